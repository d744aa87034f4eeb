//! In-process ATT peer simulator
//!
//! A scripted stand-in for a real peripheral. The test side holds a
//! [`SimPeer`] to push inbound frames, inject failures and inspect every
//! frame the client wrote; the client side gets a [`SimTransport`] from a
//! [`SimConnector`]. Used for unit and integration testing without BLE
//! hardware.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use super::{Connector, LocalInput, Transport, TransportError};
use crate::att::{AttributeHandle, ATT_DEFAULT_MTU, ATT_OP_HANDLE_VALUE_NOTI};

/// Something the simulated peer does to the channel.
#[derive(Debug)]
enum SimEvent {
    Frame(Vec<u8>),
    Close,
    ReadError,
    WaitError,
}

/// State shared between the client-side transport and the test-side peer.
#[derive(Debug)]
struct SimShared {
    writes: Mutex<Vec<Vec<u8>>>,
    /// Index of the first write that fails; `usize::MAX` means never.
    fail_write_at: AtomicUsize,
    fail_connect: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

/// Hands out the single simulated transport.
pub struct SimConnector {
    tx: mpsc::Sender<SimEvent>,
    rx: Mutex<Option<mpsc::Receiver<SimEvent>>>,
    shared: Arc<SimShared>,
    mtu: usize,
}

impl Default for SimConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl SimConnector {
    /// A fresh peripheral with the default MTU and nothing queued.
    pub fn new() -> Self {
        let (tx, rx) = mpsc::channel(64);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            shared: Arc::new(SimShared {
                writes: Mutex::new(Vec::new()),
                fail_write_at: AtomicUsize::new(usize::MAX),
                fail_connect: AtomicBool::new(false),
                connected: AtomicBool::new(false),
                closed: AtomicBool::new(false),
            }),
            mtu: usize::from(ATT_DEFAULT_MTU),
        }
    }

    /// Set the largest frame the simulated link accepts.
    pub fn set_mtu(&mut self, mtu: usize) {
        self.mtu = mtu;
    }

    /// Make the next `connect` fail.
    pub fn set_connect_failure(&self, fail: bool) {
        self.shared.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Test-side handle to the simulated peripheral.
    pub fn peer(&self) -> SimPeer {
        SimPeer {
            tx: self.tx.clone(),
            shared: Arc::clone(&self.shared),
        }
    }
}

#[async_trait]
impl Connector for SimConnector {
    type Transport = SimTransport;

    async fn connect(&self, peer: &str) -> Result<SimTransport, TransportError> {
        if self.shared.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionError(format!(
                "No simulated peripheral at {}",
                peer
            )));
        }
        let rx = self.rx.lock().await.take().ok_or_else(|| {
            TransportError::ConnectionError("Simulated peripheral already connected".to_string())
        })?;
        self.shared.connected.store(true, Ordering::SeqCst);

        Ok(SimTransport {
            peer: peer.to_string(),
            inbound: rx,
            pending: None,
            peer_closed: false,
            open: true,
            shared: Arc::clone(&self.shared),
            mtu: self.mtu,
        })
    }
}

/// Client side of the simulated channel.
pub struct SimTransport {
    peer: String,
    inbound: mpsc::Receiver<SimEvent>,
    /// Event observed by `readable` but not yet consumed by `read`.
    pending: Option<SimEvent>,
    peer_closed: bool,
    open: bool,
    shared: Arc<SimShared>,
    mtu: usize,
}

impl SimTransport {
    async fn next_event(&mut self) -> SimEvent {
        if self.peer_closed {
            return SimEvent::Close;
        }
        match self.pending.take() {
            Some(event) => event,
            // All peer handles dropped behaves like a hang-up.
            None => self.inbound.recv().await.unwrap_or(SimEvent::Close),
        }
    }
}

fn simulated_io_error(what: &str) -> TransportError {
    TransportError::Io(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!("simulated {} failure", what),
    ))
}

#[async_trait]
impl Transport for SimTransport {
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        if frame.len() > self.mtu {
            return Err(TransportError::MtuExceeded {
                size: frame.len(),
                mtu: self.mtu,
            });
        }
        let mut writes = self.shared.writes.lock().await;
        if writes.len() >= self.shared.fail_write_at.load(Ordering::SeqCst) {
            return Err(simulated_io_error("write"));
        }
        writes.push(frame.to_vec());
        Ok(())
    }

    async fn readable(&mut self) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        if self.pending.is_none() && !self.peer_closed {
            self.pending = Some(self.inbound.recv().await.unwrap_or(SimEvent::Close));
        }
        if matches!(self.pending, Some(SimEvent::WaitError)) {
            self.pending = None;
            return Err(simulated_io_error("wait"));
        }
        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        if !self.open {
            return Err(TransportError::Disconnected);
        }
        match self.next_event().await {
            SimEvent::Frame(mut frame) => {
                frame.truncate(max_len);
                Ok(frame)
            }
            SimEvent::Close => {
                self.peer_closed = true;
                Ok(Vec::new())
            }
            SimEvent::ReadError => Err(simulated_io_error("read")),
            SimEvent::WaitError => Err(simulated_io_error("wait")),
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.open = false;
        self.shared.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

/// Test-side handle: the simulated peripheral.
#[derive(Clone)]
pub struct SimPeer {
    tx: mpsc::Sender<SimEvent>,
    shared: Arc<SimShared>,
}

impl SimPeer {
    async fn push(&self, event: SimEvent) {
        // The receiver lives as long as the connector or transport; a send
        // after both are gone has nobody to observe it.
        let _ = self.tx.send(event).await;
    }

    /// Push a Handle Value Notification.
    pub async fn notify(&self, handle: AttributeHandle, payload: &[u8]) {
        let mut frame = vec![ATT_OP_HANDLE_VALUE_NOTI];
        frame.extend_from_slice(&handle.to_le_bytes());
        frame.extend_from_slice(payload);
        self.push(SimEvent::Frame(frame)).await;
    }

    /// Push an arbitrary inbound PDU.
    pub async fn send_raw(&self, frame: &[u8]) {
        self.push(SimEvent::Frame(frame.to_vec())).await;
    }

    /// Hang up: every later read returns zero bytes.
    pub async fn close(&self) {
        self.push(SimEvent::Close).await;
    }

    /// Make the next `read` fail with an I/O error.
    pub async fn fail_next_read(&self) {
        self.push(SimEvent::ReadError).await;
    }

    /// Make the next readiness wait fail.
    pub async fn fail_next_wait(&self) {
        self.push(SimEvent::WaitError).await;
    }

    /// Writes with index `>= index` fail (0 fails the very first write).
    pub fn fail_writes_from(&self, index: usize) {
        self.shared.fail_write_at.store(index, Ordering::SeqCst);
    }

    /// Every frame the client wrote successfully, in order.
    pub async fn writes(&self) -> Vec<Vec<u8>> {
        self.shared.writes.lock().await.clone()
    }

    /// Whether a client ever connected.
    pub fn was_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Whether the client released the transport.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

/// Local input source fired by hand from tests.
pub struct SimLocalInput {
    rx: mpsc::UnboundedReceiver<()>,
}

/// Fires a [`SimLocalInput`].
#[derive(Clone)]
pub struct SimLocalPoke {
    tx: mpsc::UnboundedSender<()>,
}

impl SimLocalInput {
    /// A local input and the handle that fires it.
    pub fn new() -> (Self, SimLocalPoke) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rx }, SimLocalPoke { tx })
    }
}

impl SimLocalPoke {
    /// Signal one readiness event.
    pub fn poke(&self) {
        let _ = self.tx.send(());
    }
}

#[async_trait]
impl LocalInput for SimLocalInput {
    async fn ready(&mut self) -> std::io::Result<()> {
        match self.rx.recv().await {
            Some(()) => Ok(()),
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_writes_are_recorded_in_order() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("AA:BB:CC:DD:EE:FF").await.unwrap();

        assert!(peer.was_connected());
        assert_eq!(transport.peer(), "AA:BB:CC:DD:EE:FF");

        transport.write(b"one").await.unwrap();
        transport.write(b"two").await.unwrap();
        assert_eq!(peer.writes().await, vec![b"one".to_vec(), b"two".to_vec()]);
    }

    #[tokio::test]
    async fn test_mtu_enforcement() {
        let mut connector = SimConnector::new();
        connector.set_mtu(10);
        let mut transport = connector.connect("sim").await.unwrap();

        transport.write(&[0u8; 10]).await.unwrap();
        let result = transport.write(&[0u8; 11]).await;
        assert!(matches!(
            result,
            Err(TransportError::MtuExceeded { size: 11, mtu: 10 })
        ));
    }

    #[tokio::test]
    async fn test_injected_write_failure() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.fail_writes_from(1);
        transport.write(b"ok").await.unwrap();
        assert!(transport.write(b"boom").await.is_err());
        assert_eq!(peer.writes().await.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_only_once() {
        let connector = SimConnector::new();
        let _transport = connector.connect("sim").await.unwrap();
        assert!(matches!(
            connector.connect("sim").await,
            Err(TransportError::ConnectionError(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let connector = SimConnector::new();
        connector.set_connect_failure(true);
        assert!(connector.connect("sim").await.is_err());
        assert!(!connector.peer().was_connected());
    }

    #[tokio::test]
    async fn test_close() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        assert!(!peer.is_closed());
        transport.close().await.unwrap();
        assert!(peer.is_closed());
        assert!(matches!(
            transport.write(b"late").await,
            Err(TransportError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn test_peer_hangup_reads_empty() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.notify(0x0034, b"last").await;
        peer.close().await;

        assert_eq!(transport.read(512).await.unwrap().len(), 7);
        assert!(transport.read(512).await.unwrap().is_empty());
        // Stays hung up.
        transport.readable().await.unwrap();
        assert!(transport.read(512).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_read_truncates_to_max_len() {
        let connector = SimConnector::new();
        let peer = connector.peer();
        let mut transport = connector.connect("sim").await.unwrap();

        peer.send_raw(&[1, 2, 3, 4, 5]).await;
        assert_eq!(transport.read(3).await.unwrap(), vec![1, 2, 3]);
    }
}
