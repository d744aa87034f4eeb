//! Linux L2CAP transport
//!
//! Talks ATT over the fixed LE channel (CID 4) of a kernel Bluetooth
//! socket. The socket is non-blocking and registered with the tokio reactor,
//! so waiting for notifications never ties up a thread.

use std::fmt;
use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::str::FromStr;

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use super::{Connector, Transport, TransportError};

const AF_BLUETOOTH: libc::c_int = 31;
const BTPROTO_L2CAP: libc::c_int = 0;
const SOL_BLUETOOTH: libc::c_int = 274;
const BT_SECURITY: libc::c_int = 4;

const ATT_CID: u16 = 0x0004;
const BDADDR_LE_PUBLIC: u8 = 0x01;
const BDADDR_LE_RANDOM: u8 = 0x02;

/// A 48-bit Bluetooth device address, most significant byte first.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BdAddr([u8; 6]);

impl BdAddr {
    /// Wildcard local address; the kernel picks the adapter.
    pub const ANY: BdAddr = BdAddr([0; 6]);

    pub fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Kernel byte order (little-endian).
    fn to_wire(self) -> [u8; 6] {
        let mut wire = self.0;
        wire.reverse();
        wire
    }
}

impl FromStr for BdAddr {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || TransportError::InvalidAddress(s.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 || !part.bytes().all(|b| b.is_ascii_hexdigit()) {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BdAddr({})", self)
    }
}

/// LE address type of the peer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AddressType {
    #[default]
    Public,
    Random,
}

impl AddressType {
    fn as_raw(self) -> u8 {
        match self {
            AddressType::Public => BDADDR_LE_PUBLIC,
            AddressType::Random => BDADDR_LE_RANDOM,
        }
    }
}

/// Link security requested through `BT_SECURITY`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityLevel {
    #[default]
    Low,
    Medium,
    High,
}

impl SecurityLevel {
    fn as_raw(self) -> u8 {
        match self {
            SecurityLevel::Low => 1,
            SecurityLevel::Medium => 2,
            SecurityLevel::High => 3,
        }
    }
}

#[repr(C)]
struct SockaddrL2 {
    l2_family: libc::sa_family_t,
    l2_psm: u16,
    l2_bdaddr: [u8; 6],
    l2_cid: u16,
    l2_bdaddr_type: u8,
}

impl SockaddrL2 {
    fn att(addr: BdAddr, addr_type: u8) -> Self {
        Self {
            l2_family: AF_BLUETOOTH as libc::sa_family_t,
            l2_psm: 0,
            l2_bdaddr: addr.to_wire(),
            l2_cid: ATT_CID.to_le(),
            l2_bdaddr_type: addr_type,
        }
    }

    fn as_ptr(&self) -> *const libc::sockaddr {
        (self as *const SockaddrL2).cast()
    }

    fn len() -> libc::socklen_t {
        mem::size_of::<SockaddrL2>() as libc::socklen_t
    }
}

#[repr(C)]
struct BtSecurity {
    level: u8,
    key_size: u8,
}

fn cvt(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn open_socket() -> io::Result<OwnedFd> {
    // SAFETY: no pointers are passed.
    let raw = unsafe {
        libc::socket(
            AF_BLUETOOTH,
            libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            BTPROTO_L2CAP,
        )
    };
    if raw < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `raw` is a freshly created descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

fn bind(fd: &OwnedFd, addr: &SockaddrL2) -> io::Result<()> {
    // SAFETY: `addr` is a live, correctly sized sockaddr_l2.
    cvt(unsafe { libc::bind(fd.as_raw_fd(), addr.as_ptr(), SockaddrL2::len()) })
}

fn set_security(fd: &OwnedFd, level: SecurityLevel) -> io::Result<()> {
    let sec = BtSecurity {
        level: level.as_raw(),
        key_size: 0,
    };
    // SAFETY: `sec` outlives the call and the length matches its type.
    cvt(unsafe {
        libc::setsockopt(
            fd.as_raw_fd(),
            SOL_BLUETOOTH,
            BT_SECURITY,
            (&sec as *const BtSecurity).cast(),
            mem::size_of::<BtSecurity>() as libc::socklen_t,
        )
    })
}

/// Start a non-blocking connect. `Ok(true)` when already connected.
fn start_connect(fd: &OwnedFd, addr: &SockaddrL2) -> io::Result<bool> {
    // SAFETY: `addr` is a live, correctly sized sockaddr_l2.
    match cvt(unsafe { libc::connect(fd.as_raw_fd(), addr.as_ptr(), SockaddrL2::len()) }) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
        Err(e) => Err(e),
    }
}

fn take_socket_error(fd: &OwnedFd) -> io::Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    // SAFETY: `err` and `len` are valid for writes of the advertised size.
    cvt(unsafe {
        libc::getsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            (&mut err as *mut libc::c_int).cast(),
            &mut len,
        )
    })?;
    if err != 0 {
        return Err(io::Error::from_raw_os_error(err));
    }
    Ok(())
}

fn step_failed(step: &str, e: io::Error) -> TransportError {
    TransportError::ConnectionError(format!("{} failed: {}", step, e))
}

/// Opens ATT channels over kernel L2CAP sockets.
#[derive(Debug, Clone, Default)]
pub struct L2capConnector {
    adapter: BdAddr,
    address_type: AddressType,
    security: SecurityLevel,
}

impl L2capConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local adapter address to bind to. Defaults to [`BdAddr::ANY`].
    pub fn with_adapter(mut self, adapter: BdAddr) -> Self {
        self.adapter = adapter;
        self
    }

    pub fn with_address_type(mut self, address_type: AddressType) -> Self {
        self.address_type = address_type;
        self
    }

    pub fn with_security(mut self, security: SecurityLevel) -> Self {
        self.security = security;
        self
    }
}

#[async_trait]
impl Connector for L2capConnector {
    type Transport = L2capTransport;

    async fn connect(&self, peer: &str) -> Result<L2capTransport, TransportError> {
        let dst: BdAddr = peer.parse()?;

        // From here on the descriptor is closed by drop on every early return.
        let fd = open_socket().map_err(|e| step_failed("socket", e))?;
        bind(&fd, &SockaddrL2::att(self.adapter, BDADDR_LE_PUBLIC))
            .map_err(|e| step_failed("bind", e))?;
        set_security(&fd, self.security).map_err(|e| step_failed("set security", e))?;

        let fd = AsyncFd::new(fd)?;
        let dst_addr = SockaddrL2::att(dst, self.address_type.as_raw());
        let connected = start_connect(fd.get_ref(), &dst_addr)
            .map_err(|e| step_failed("connect", e))?;
        if !connected {
            log::debug!("Waiting for L2CAP connection to {}", dst);
            let _guard = fd.writable().await?;
            take_socket_error(fd.get_ref()).map_err(|e| step_failed("connect", e))?;
        }
        log::info!("Connected to {} on ATT channel", dst);

        Ok(L2capTransport {
            peer: dst.to_string(),
            fd: Some(fd),
        })
    }
}

/// A connected ATT channel. The socket closes on [`Transport::close`] or drop.
pub struct L2capTransport {
    peer: String,
    fd: Option<AsyncFd<OwnedFd>>,
}

impl L2capTransport {
    fn fd(&self) -> Result<&AsyncFd<OwnedFd>, TransportError> {
        self.fd.as_ref().ok_or(TransportError::Disconnected)
    }
}

#[async_trait]
impl Transport for L2capTransport {
    async fn write(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        let fd = self.fd()?;
        loop {
            let mut guard = fd.writable().await?;
            let written = guard.try_io(|inner| {
                // SAFETY: `frame` is valid for reads of `frame.len()` bytes.
                let n = unsafe {
                    libc::send(
                        inner.as_raw_fd(),
                        frame.as_ptr().cast(),
                        frame.len(),
                        libc::MSG_NOSIGNAL,
                    )
                };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match written {
                Ok(Ok(n)) if n == frame.len() => return Ok(()),
                Ok(Ok(n)) => {
                    return Err(TransportError::ShortWrite {
                        written: n,
                        len: frame.len(),
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn readable(&mut self) -> Result<(), TransportError> {
        // Dropping the guard without clearing keeps the readiness for `read`.
        self.fd()?.readable().await?;
        Ok(())
    }

    async fn read(&mut self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let fd = self.fd()?;
        let mut buf = vec![0u8; max_len];
        loop {
            let mut guard = fd.readable().await?;
            let read = guard.try_io(|inner| {
                // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
                let n = unsafe { libc::read(inner.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
                if n < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match read {
                Ok(Ok(n)) => {
                    buf.truncate(n);
                    return Ok(buf);
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_would_block) => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.fd.take().is_some() {
            log::debug!("Closed ATT channel to {}", self.peer);
        }
        Ok(())
    }

    fn peer(&self) -> &str {
        &self.peer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bdaddr() {
        let addr: BdAddr = "D1:5E:28:7A:4E:E0".parse().unwrap();
        assert_eq!(addr, BdAddr::new([0xD1, 0x5E, 0x28, 0x7A, 0x4E, 0xE0]));
        assert_eq!(addr.to_string(), "D1:5E:28:7A:4E:E0");

        let lower: BdAddr = "d1:5e:28:7a:4e:e0".parse().unwrap();
        assert_eq!(lower, addr);
    }

    #[test]
    fn test_reject_malformed_bdaddr() {
        for bad in [
            "",
            "D1:5E:28:7A:4E",
            "D1:5E:28:7A:4E:E0:00",
            "D1:5E:28:7A:4E:G0",
            "D15E:28:7A:4E:E0:0",
            "D1-5E-28-7A-4E-E0",
            "+1:5E:28:7A:4E:E0",
        ] {
            assert!(
                matches!(bad.parse::<BdAddr>(), Err(TransportError::InvalidAddress(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    #[test]
    fn test_wire_order_is_reversed() {
        let addr: BdAddr = "01:02:03:04:05:06".parse().unwrap();
        assert_eq!(addr.to_wire(), [0x06, 0x05, 0x04, 0x03, 0x02, 0x01]);
    }

    #[test]
    fn test_sockaddr_layout_matches_kernel() {
        assert_eq!(mem::size_of::<SockaddrL2>(), 14);
        assert_eq!(mem::size_of::<BtSecurity>(), 2);

        let sa = SockaddrL2::att(BdAddr::ANY, BDADDR_LE_RANDOM);
        assert_eq!(sa.l2_cid, 4u16.to_le());
        assert_eq!(sa.l2_psm, 0);
        assert_eq!(sa.l2_bdaddr_type, 2);
    }

    /// A transport over one end of a local SEQPACKET pair, plus the other end.
    fn transport_pair() -> (L2capTransport, OwnedFd) {
        let mut fds = [0 as libc::c_int; 2];
        // SAFETY: `fds` is valid for two descriptors.
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_SEQPACKET | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0, "socketpair: {}", io::Error::last_os_error());
        // SAFETY: both descriptors were just created and are owned by nobody else.
        let (ours, theirs) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

        let transport = L2capTransport {
            peer: "D1:5E:28:7A:4E:E0".to_string(),
            fd: Some(AsyncFd::new(ours).unwrap()),
        };
        (transport, theirs)
    }

    fn peer_send(fd: &OwnedFd, frame: &[u8]) {
        // SAFETY: `frame` is valid for reads of `frame.len()` bytes.
        let n = unsafe { libc::write(fd.as_raw_fd(), frame.as_ptr().cast(), frame.len()) };
        assert_eq!(n, frame.len() as isize);
    }

    fn peer_recv(fd: &OwnedFd) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        // SAFETY: `buf` is valid for writes of `buf.len()` bytes.
        let n = unsafe { libc::read(fd.as_raw_fd(), buf.as_mut_ptr().cast(), buf.len()) };
        assert!(n >= 0, "read: {}", io::Error::last_os_error());
        buf.truncate(n as usize);
        buf
    }

    #[tokio::test]
    async fn test_write_sends_one_frame() {
        let (mut transport, theirs) = transport_pair();

        transport.write(&[0x12, 0x2E, 0x00, 0x01, 0x00]).await.unwrap();
        transport.write(b"\x52\x31\x00Hello\r\n").await.unwrap();

        assert_eq!(peer_recv(&theirs), vec![0x12, 0x2E, 0x00, 0x01, 0x00]);
        assert_eq!(peer_recv(&theirs), b"\x52\x31\x00Hello\r\n".to_vec());
        assert_eq!(transport.peer(), "D1:5E:28:7A:4E:E0");
    }

    #[tokio::test]
    async fn test_readable_keeps_frame_for_read() {
        let (mut transport, theirs) = transport_pair();
        peer_send(&theirs, &[0x1B, 0x34, 0x00, b'h', b'i']);

        transport.readable().await.unwrap();
        transport.readable().await.unwrap();
        let frame = transport.read(512).await.unwrap();
        assert_eq!(frame, vec![0x1B, 0x34, 0x00, b'h', b'i']);
    }

    #[tokio::test]
    async fn test_read_truncates_to_max_len() {
        let (mut transport, theirs) = transport_pair();
        peer_send(&theirs, &[1, 2, 3, 4, 5, 6, 7, 8]);
        peer_send(&theirs, &[9, 10]);

        assert_eq!(transport.read(3).await.unwrap(), vec![1, 2, 3]);
        // The rest of a truncated packet is gone, not split off.
        assert_eq!(transport.read(3).await.unwrap(), vec![9, 10]);
    }

    #[tokio::test]
    async fn test_peer_hangup_reads_empty() {
        let (mut transport, theirs) = transport_pair();
        peer_send(&theirs, &[0x1B, 0x34, 0x00, b'x']);
        drop(theirs);

        assert_eq!(transport.read(512).await.unwrap().len(), 4);
        transport.readable().await.unwrap();
        assert!(transport.read(512).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_to_dropped_peer_fails() {
        let (mut transport, theirs) = transport_pair();
        drop(theirs);

        let result = transport.write(&[0x52, 0x31, 0x00, b'x']).await;
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[tokio::test]
    async fn test_closed_transport_is_disconnected() {
        let (mut transport, _theirs) = transport_pair();

        transport.close().await.unwrap();
        assert!(matches!(
            transport.write(&[0x52, 0x31, 0x00]).await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            transport.readable().await,
            Err(TransportError::Disconnected)
        ));
        assert!(matches!(
            transport.read(512).await,
            Err(TransportError::Disconnected)
        ));
        // Closing twice is harmless.
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_rejects_bad_address_before_opening_socket() {
        let connector = L2capConnector::new().with_security(SecurityLevel::Medium);
        let result = connector.connect("not-an-address").await;
        assert!(matches!(result, Err(TransportError::InvalidAddress(_))));
    }
}
