//! gattline - a minimal BLE GATT line client
//!
//! Enables notifications on a peripheral, sends a message split across ATT
//! write commands, and reassembles a line-feed terminated reply from
//! notifications.

pub mod att;
pub mod config;
pub mod fragment;
pub mod reader;
pub mod session;
pub mod transport;

pub use att::{AttCodec, AttError, AttFrame, AttOpcode, AttributeHandle, WriteKind};
pub use config::{ConfigError, GattLayout};
pub use reader::{NotificationLineReader, ReadLineError, LINE_LIMIT, MAX_LINE};
pub use session::{ClientSession, SessionError, SessionOutcome, SessionRequest, SessionState};
pub use transport::{Connector, LocalInput, Readiness, Transport, TransportError};
