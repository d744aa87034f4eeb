//! Attribute Protocol framing
//!
//! Encodes the two write PDUs this client issues and decodes whatever the
//! peripheral pushes back. Only Handle Value Notifications are interpreted;
//! every other inbound opcode is carried through as [`AttOpcode::Other`].

use thiserror::Error;

/// ATT Error Response opcode.
pub const ATT_OP_ERROR_RSP: u8 = 0x01;
/// ATT Write Request opcode (acknowledged).
pub const ATT_OP_WRITE_REQ: u8 = 0x12;
/// ATT Write Command opcode (unacknowledged).
pub const ATT_OP_WRITE_CMD: u8 = 0x52;
/// ATT Handle Value Notification opcode.
pub const ATT_OP_HANDLE_VALUE_NOTI: u8 = 0x1B;

/// Default ATT MTU before any exchange.
pub const ATT_DEFAULT_MTU: u16 = 23;
/// Opcode plus 16-bit handle.
pub const ATT_HEADER_LEN: usize = 3;

/// A 16-bit identifier addressing a remote attribute.
pub type AttributeHandle = u16;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum AttError {
    #[error("ATT payload too large ({size} > {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("Empty ATT frame")]
    EmptyFrame,
}

/// The two write flavours a client can issue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteKind {
    /// Acknowledged write (opcode 0x12).
    Request,
    /// Unacknowledged write (opcode 0x52).
    Command,
}

impl WriteKind {
    /// ATT opcode carried in the first byte of the PDU.
    pub fn opcode(self) -> u8 {
        match self {
            WriteKind::Request => ATT_OP_WRITE_REQ,
            WriteKind::Command => ATT_OP_WRITE_CMD,
        }
    }
}

/// Opcode of a decoded inbound frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttOpcode {
    Notification,
    Other(u8),
}

/// A decoded inbound ATT frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttFrame {
    pub opcode: AttOpcode,
    /// Present only for notifications that carried a full header.
    pub handle: Option<AttributeHandle>,
    pub payload: Vec<u8>,
}

impl AttFrame {
    /// True for Handle Value Notifications.
    pub fn is_notification(&self) -> bool {
        self.opcode == AttOpcode::Notification
    }
}

/// Encoder/decoder bound to a fixed MTU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttCodec {
    mtu: u16,
}

impl Default for AttCodec {
    fn default() -> Self {
        Self::new(ATT_DEFAULT_MTU)
    }
}

impl AttCodec {
    /// Codec for a link with the given ATT MTU.
    pub fn new(mtu: u16) -> Self {
        Self { mtu }
    }

    /// The ATT MTU this codec was built for.
    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Largest payload a single write may carry (`MTU - 3`).
    pub fn max_payload(&self) -> usize {
        usize::from(self.mtu).saturating_sub(ATT_HEADER_LEN)
    }

    /// Build a write PDU: opcode, handle (little-endian), payload.
    ///
    /// Oversized payloads are rejected rather than truncated; callers are
    /// expected to fragment first.
    pub fn encode_write(
        &self,
        kind: WriteKind,
        handle: AttributeHandle,
        payload: &[u8],
    ) -> Result<Vec<u8>, AttError> {
        let max = self.max_payload();
        if payload.len() > max {
            return Err(AttError::PayloadTooLarge {
                size: payload.len(),
                max,
            });
        }

        let mut frame = Vec::with_capacity(ATT_HEADER_LEN + payload.len());
        frame.push(kind.opcode());
        frame.extend_from_slice(&handle.to_le_bytes());
        frame.extend_from_slice(payload);
        Ok(frame)
    }

    /// Decode an inbound PDU.
    ///
    /// Header-only or truncated notifications decode to an empty notification
    /// instead of failing, so the reader can skip them.
    pub fn decode_frame(raw: &[u8]) -> Result<AttFrame, AttError> {
        let (&opcode, _) = raw.split_first().ok_or(AttError::EmptyFrame)?;

        let payload = raw
            .get(ATT_HEADER_LEN..)
            .map(<[u8]>::to_vec)
            .unwrap_or_default();

        if opcode == ATT_OP_HANDLE_VALUE_NOTI {
            if raw.len() < ATT_HEADER_LEN {
                return Ok(AttFrame {
                    opcode: AttOpcode::Notification,
                    handle: None,
                    payload: Vec::new(),
                });
            }
            return Ok(AttFrame {
                opcode: AttOpcode::Notification,
                handle: Some(u16::from_le_bytes([raw[1], raw[2]])),
                payload,
            });
        }

        if opcode == ATT_OP_ERROR_RSP {
            log::debug!("Ignoring ATT error response: {}", hex::encode(raw));
        }

        Ok(AttFrame {
            opcode: AttOpcode::Other(opcode),
            handle: None,
            payload,
        })
    }
}
