//! Line reassembly from ATT notifications
//!
//! A peripheral streams a text line as any number of notifications. The
//! reader waits on the transport (and an optional local input), keeps the
//! printable bytes of each notification and stops at the first line feed.

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::att::AttCodec;
use crate::transport::{wait_ready, LocalInput, Transport, TransportError};

/// Largest inbound PDU read in one go.
pub const MAX_LINE: usize = 512;

/// Default cap on a reassembled line. Printable bytes past it are dropped
/// until the line feed arrives.
pub const LINE_LIMIT: usize = 4096;

#[derive(Error, Debug)]
pub enum ReadLineError {
    #[error("Waiting for input failed: {0}")]
    WaitFailed(#[source] TransportError),

    #[error("Transport closed by peer")]
    TransportClosed,

    #[error("Wait cancelled")]
    Cancelled,
}

/// Reassembles one LF-terminated line per [`read_line`](Self::read_line) call.
#[derive(Debug, Clone)]
pub struct NotificationLineReader {
    cancel: CancellationToken,
    line_limit: usize,
}

impl Default for NotificationLineReader {
    fn default() -> Self {
        Self {
            cancel: CancellationToken::new(),
            line_limit: LINE_LIMIT,
        }
    }
}

impl NotificationLineReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `limit` bytes of a line; the rest up to the line feed is
    /// discarded.
    pub fn with_line_limit(mut self, limit: usize) -> Self {
        self.line_limit = limit;
        self
    }

    /// Abort a pending wait when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Wait for notifications until one contains a line feed.
    ///
    /// Returns the printable bytes gathered before the line feed, at most
    /// the line limit. Bytes after the line feed in the same notification
    /// are dropped; every call starts empty. Readiness of `local` alone never
    /// ends the call.
    pub async fn read_line<T>(
        &self,
        transport: &mut T,
        mut local: Option<&mut (dyn LocalInput + '_)>,
    ) -> Result<Vec<u8>, ReadLineError>
    where
        T: Transport + ?Sized,
    {
        let mut line = Vec::new();
        let mut overflowed = false;

        loop {
            let readiness = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(ReadLineError::Cancelled),
                res = wait_ready(transport, local.as_deref_mut()) => {
                    res.map_err(ReadLineError::WaitFailed)?
                }
            };
            if !readiness.transport_ready() {
                continue;
            }

            let raw = match transport.read(MAX_LINE).await {
                Ok(raw) if !raw.is_empty() => raw,
                Ok(_) => return Err(ReadLineError::TransportClosed),
                Err(e) => {
                    log::debug!("Read from {} failed: {}", transport.peer(), e);
                    return Err(ReadLineError::TransportClosed);
                }
            };
            log::trace!("rx {}", hex::encode(&raw));

            let frame = match AttCodec::decode_frame(&raw) {
                Ok(frame) => frame,
                Err(_) => continue,
            };
            if !frame.is_notification() || frame.payload.is_empty() {
                continue;
            }

            let done = absorb(&mut line, &frame.payload, self.line_limit);
            if !overflowed && line.len() >= self.line_limit {
                overflowed = true;
                log::warn!(
                    "Line from {} reached {} bytes, dropping the rest",
                    transport.peer(),
                    self.line_limit
                );
            }
            if done {
                return Ok(line);
            }
        }
    }
}

/// Append the printable bytes of `payload` while `line` is under `limit`.
/// Returns true at a line feed.
fn absorb(line: &mut Vec<u8>, payload: &[u8], limit: usize) -> bool {
    for &byte in payload {
        match byte {
            b'\n' => return true,
            32..=126 if line.len() < limit => line.push(byte),
            _ => {}
        }
    }
    false
}
