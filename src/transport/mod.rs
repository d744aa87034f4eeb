//! Transport layer for the ATT client
//!
//! Abstracts the connected ATT channel so the session and reader can run
//! against a real L2CAP socket or the in-process simulator alike.

#[cfg(target_os = "linux")]
pub mod l2cap;
pub mod simulated;
#[cfg(unix)]
pub mod stdin;

use async_trait::async_trait;
use futures_util::FutureExt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Invalid peer address: {0}")]
    InvalidAddress(String),

    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Frame exceeds MTU ({size} > {mtu})")]
    MtuExceeded { size: usize, mtu: usize },

    #[error("Short write ({written} of {len} bytes)")]
    ShortWrite { written: usize, len: usize },

    #[error("Peer disconnected")]
    Disconnected,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A connected, packet-preserving duplex channel to one peripheral.
#[async_trait]
pub trait Transport: Send {
    /// Send one ATT PDU.
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Resolve once a `read` would not block. Does not consume any data.
    async fn readable(&mut self) -> Result<(), TransportError>;

    /// Read one inbound PDU, truncated to `max_len`. An empty result means
    /// the peer closed the channel.
    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Release the channel. Later calls on a closed transport fail with
    /// [`TransportError::Disconnected`].
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Identifier of the connected peer.
    fn peer(&self) -> &str;
}

/// Establishes transports from opaque peer identifiers.
#[async_trait]
pub trait Connector: Send + Sync {
    type Transport: Transport;

    /// Open a channel to `peer`. The address format is up to the connector.
    async fn connect(&self, peer: &str) -> Result<Self::Transport, TransportError>;
}

/// A second input source multiplexed alongside the transport.
///
/// Readiness is edge-like: `ready` returns once per new readiness event and
/// leaves the data itself unread.
#[async_trait]
pub trait LocalInput: Send {
    /// Resolve on the next readiness event.
    async fn ready(&mut self) -> std::io::Result<()>;
}

/// Which source woke a [`wait_ready`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Transport,
    LocalInput,
    Both,
}

impl Readiness {
    /// The transport has a PDU (or a hang-up) to read.
    pub fn transport_ready(self) -> bool {
        matches!(self, Readiness::Transport | Readiness::Both)
    }

    /// The local input signalled since the last wait.
    pub fn local_input_ready(self) -> bool {
        matches!(self, Readiness::LocalInput | Readiness::Both)
    }
}

/// Block until the transport or the local input (if any) becomes ready.
///
/// There is no timeout. When one source fires, the other is polled once
/// more so simultaneous readiness is reported as [`Readiness::Both`].
pub async fn wait_ready<T>(
    transport: &mut T,
    local: Option<&mut (dyn LocalInput + '_)>,
) -> Result<Readiness, TransportError>
where
    T: Transport + ?Sized,
{
    let transport_ready = transport.readable();
    let local_ready = async move {
        match local {
            Some(input) => input.ready().await,
            None => std::future::pending::<std::io::Result<()>>().await,
        }
    };
    tokio::pin!(transport_ready, local_ready);

    tokio::select! {
        res = &mut transport_ready => {
            res?;
            match local_ready.as_mut().now_or_never() {
                Some(Ok(())) => Ok(Readiness::Both),
                Some(Err(e)) => Err(e.into()),
                None => Ok(Readiness::Transport),
            }
        }
        res = &mut local_ready => {
            res?;
            match transport_ready.as_mut().now_or_never() {
                Some(Ok(())) => Ok(Readiness::Both),
                Some(Err(e)) => Err(e),
                None => Ok(Readiness::LocalInput),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::simulated::{SimConnector, SimLocalInput};
    use super::*;

    #[tokio::test]
    async fn test_wait_ready_transport_only() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.notify(0x0034, b"hi").await;
        let readiness = wait_ready(&mut transport, None).await.unwrap();
        assert_eq!(readiness, Readiness::Transport);
        assert!(readiness.transport_ready());
        assert!(!readiness.local_input_ready());
    }

    #[tokio::test]
    async fn test_wait_ready_local_input_only() {
        let connector = SimConnector::new();
        let mut transport = connector.connect("sim").await.unwrap();
        let (mut input, poke) = SimLocalInput::new();

        poke.poke();
        let readiness = wait_ready(&mut transport, Some(&mut input)).await.unwrap();
        assert_eq!(readiness, Readiness::LocalInput);
    }

    #[tokio::test]
    async fn test_wait_ready_both() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();
        let (mut input, poke) = SimLocalInput::new();

        peer.notify(0x0034, b"hi").await;
        poke.poke();
        let readiness = wait_ready(&mut transport, Some(&mut input)).await.unwrap();
        assert_eq!(readiness, Readiness::Both);
    }

    #[tokio::test]
    async fn test_wait_ready_leaves_frame_unread() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.notify(0x0034, b"hi").await;
        wait_ready(&mut transport, None).await.unwrap();
        wait_ready(&mut transport, None).await.unwrap();
        let frame = transport.read(512).await.unwrap();
        assert_eq!(frame, vec![0x1B, 0x34, 0x00, b'h', b'i']);
    }

    /// Fails on every call.
    struct BrokenInput;

    #[async_trait]
    impl LocalInput for BrokenInput {
        async fn ready(&mut self) -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "input gone"))
        }
    }

    #[tokio::test]
    async fn test_local_input_failure_is_fatal_with_transport_ready() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.notify(0x0034, b"hi").await;
        let result = wait_ready(&mut transport, Some(&mut BrokenInput)).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_wait_ready_failure() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.fail_next_wait().await;
        assert!(wait_ready(&mut transport, None).await.is_err());
    }
}
