//! Characteristic layout of the peripheral
//!
//! The handles and values a session talks to. Defaults match the
//! line-oriented UART-style service this client was written for.

use std::num::NonZeroUsize;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::att::{AttCodec, AttributeHandle, ATT_DEFAULT_MTU};

/// Client Characteristic Configuration descriptor of the notifying characteristic.
pub const DEFAULT_CONFIG_HANDLE: AttributeHandle = 0x002E;
/// Characteristic that receives outbound message fragments.
pub const DEFAULT_WRITE_HANDLE: AttributeHandle = 0x0031;
/// CCCD value enabling notifications.
pub const ENABLE_NOTIFICATIONS: [u8; 2] = [0x01, 0x00];

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("MTU {0} leaves no room for an ATT payload")]
    MtuTooSmall(u16),

    #[error("Enable value is {size} bytes but at most {max} fit in one write")]
    EnableValueTooLarge { size: usize, max: usize },

    #[error("Failed to read layout file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid layout file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Handles, enable value and MTU used by a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattLayout {
    /// Handle the enable value is written to (WriteRequest).
    pub config_handle: AttributeHandle,
    /// Handle outbound fragments are written to (WriteCommand).
    pub write_handle: AttributeHandle,
    /// Value written to `config_handle`.
    pub enable_value: Vec<u8>,
    /// Fixed ATT MTU; never negotiated.
    pub mtu: u16,
}

impl Default for GattLayout {
    fn default() -> Self {
        Self {
            config_handle: DEFAULT_CONFIG_HANDLE,
            write_handle: DEFAULT_WRITE_HANDLE,
            enable_value: ENABLE_NOTIFICATIONS.to_vec(),
            mtu: ATT_DEFAULT_MTU,
        }
    }
}

impl GattLayout {
    /// Load a layout from JSON. Fields left out keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let data = std::fs::read(path)?;
        let layout: GattLayout = serde_json::from_slice(&data)?;
        layout.validate()?;
        Ok(layout)
    }

    pub fn codec(&self) -> AttCodec {
        AttCodec::new(self.mtu)
    }

    /// `MTU - 3`, rejected when zero.
    pub fn max_payload(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.codec().max_payload()).ok_or(ConfigError::MtuTooSmall(self.mtu))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let max = self.max_payload()?.get();
        if self.enable_value.len() > max {
            return Err(ConfigError::EnableValueTooLarge {
                size: self.enable_value.len(),
                max,
            });
        }
        Ok(())
    }
}
