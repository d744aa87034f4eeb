//! Client session
//!
//! Drives one connection through its whole life: connect, enable
//! notifications, optionally send a message, optionally wait for a line.
//! Every failure ends the session; the transport is closed on every path.

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::att::{AttError, WriteKind};
use crate::config::{ConfigError, GattLayout};
use crate::fragment;
use crate::reader::{NotificationLineReader, ReadLineError};
use crate::transport::{Connector, LocalInput, Transport, TransportError};

/// Appended to every outbound message.
pub const LINE_ENDING: &[u8] = b"\r\n";

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid GATT layout: {0}")]
    Layout(#[from] ConfigError),

    #[error("Failed to connect to {peer}: {source}")]
    Connect {
        peer: String,
        #[source]
        source: TransportError,
    },

    #[error("Failed to enable notifications: {0}")]
    Configure(#[source] TransportError),

    #[error("Failed to send fragment {} of {total}: {source}", .index + 1)]
    Send {
        index: usize,
        total: usize,
        #[source]
        source: TransportError,
    },

    #[error(transparent)]
    Wait(#[from] ReadLineError),

    #[error(transparent)]
    Codec(#[from] AttError),

    #[error("Session cancelled")]
    Cancelled,
}

impl SessionError {
    /// True when the run ended because its cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            SessionError::Cancelled | SessionError::Wait(ReadLineError::Cancelled)
        )
    }
}

/// Where a session is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    /// `run` has not been called yet.
    Idle,
    Connecting,
    ConfiguringNotifications,
    Sending,
    Waiting,
    Done,
    /// Terminal failure, with the rendered error.
    Failed(String),
}

/// What a single run should do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionRequest {
    /// Opaque peer identifier handed to the connector.
    pub peer: String,
    /// Sent with [`LINE_ENDING`] appended.
    pub message: Option<Vec<u8>>,
    /// Wait for one reassembled line after sending.
    pub wait: bool,
}

impl SessionRequest {
    pub fn new(peer: impl Into<String>) -> Self {
        Self {
            peer: peer.into(),
            ..Self::default()
        }
    }

    pub fn with_message(mut self, message: impl Into<Vec<u8>>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    /// Reject requests with no peer, or with neither a message nor a wait.
    pub fn validate(&self) -> Result<(), SessionError> {
        if self.peer.trim().is_empty() {
            return Err(SessionError::InvalidRequest(
                "a peer identifier is required".to_string(),
            ));
        }
        if self.message.is_none() && !self.wait {
            return Err(SessionError::InvalidRequest(
                "either a message or a wait must be requested".to_string(),
            ));
        }
        Ok(())
    }
}

/// Result of a successful run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOutcome {
    /// The reassembled line, when a wait was requested.
    pub line: Option<Vec<u8>>,
    /// Number of WriteCommands carrying the message.
    pub fragments_sent: usize,
}

/// One client connection to a peripheral.
pub struct ClientSession<C: Connector> {
    connector: C,
    layout: GattLayout,
    local_input: Option<Box<dyn LocalInput>>,
    cancel: CancellationToken,
    state: SessionState,
}

impl<C: Connector> ClientSession<C> {
    /// A session using the default layout and no local input.
    pub fn new(connector: C) -> Self {
        Self {
            connector,
            layout: GattLayout::default(),
            local_input: None,
            cancel: CancellationToken::new(),
            state: SessionState::Idle,
        }
    }

    pub fn with_layout(mut self, layout: GattLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Multiplex this source with the transport while waiting.
    pub fn with_local_input(mut self, input: Box<dyn LocalInput>) -> Self {
        self.local_input = Some(input);
        self
    }

    /// Cancelling `token` aborts the run at its next step. Pending connects
    /// and writes are abandoned; an open transport is still closed.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Current lifecycle state; terminal after `run` returns.
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    pub fn layout(&self) -> &GattLayout {
        &self.layout
    }

    /// Execute `request` from connect to completion.
    pub async fn run(&mut self, request: &SessionRequest) -> Result<SessionOutcome, SessionError> {
        if let Err(e) = request.validate() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.layout.validate() {
            return Err(self.fail(e.into()));
        }

        if let Err(e) = self.enter(SessionState::Connecting) {
            return Err(self.fail(e));
        }
        let connected = self.cancellable(self.connector.connect(&request.peer)).await;
        let mut transport = match connected {
            Ok(Ok(transport)) => transport,
            Ok(Err(source)) => {
                return Err(self.fail(SessionError::Connect {
                    peer: request.peer.clone(),
                    source,
                }))
            }
            Err(e) => return Err(self.fail(e)),
        };

        let result = self.drive(&mut transport, request).await;

        if let Err(e) = transport.close().await {
            log::warn!("Failed to close transport to {}: {}", request.peer, e);
        }

        match result {
            Ok(outcome) => {
                self.transition(SessionState::Done);
                Ok(outcome)
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    async fn drive(
        &mut self,
        transport: &mut C::Transport,
        request: &SessionRequest,
    ) -> Result<SessionOutcome, SessionError> {
        let codec = self.layout.codec();

        self.enter(SessionState::ConfiguringNotifications)?;
        let frame = codec.encode_write(
            WriteKind::Request,
            self.layout.config_handle,
            &self.layout.enable_value,
        )?;
        log::trace!("tx {}", hex::encode(&frame));
        self.cancellable(transport.write(&frame))
            .await?
            .map_err(SessionError::Configure)?;

        let mut fragments_sent = 0;
        if let Some(message) = &request.message {
            self.enter(SessionState::Sending)?;

            let mut outbound = Vec::with_capacity(message.len() + LINE_ENDING.len());
            outbound.extend_from_slice(message);
            outbound.extend_from_slice(LINE_ENDING);

            let fragments = fragment::split(&outbound, self.layout.max_payload()?);
            let total = fragments.len();
            for (index, chunk) in fragments.enumerate() {
                let frame = codec.encode_write(WriteKind::Command, self.layout.write_handle, chunk)?;
                log::trace!("tx {}", hex::encode(&frame));
                self.cancellable(transport.write(&frame))
                    .await?
                    .map_err(|source| SessionError::Send {
                        index,
                        total,
                        source,
                    })?;
                fragments_sent += 1;
            }
            log::info!(
                "Sent {} bytes to {} in {} fragment(s)",
                outbound.len(),
                transport.peer(),
                fragments_sent
            );
        }

        let line = if request.wait {
            self.enter(SessionState::Waiting)?;
            let reader = NotificationLineReader::new().with_cancellation(self.cancel.clone());
            let line = reader
                .read_line(transport, self.local_input.as_deref_mut())
                .await?;
            log::info!("Received {} byte line from {}", line.len(), transport.peer());
            Some(line)
        } else {
            None
        };

        Ok(SessionOutcome {
            line,
            fragments_sent,
        })
    }

    /// Race `step` against the cancellation token, which wins ties.
    async fn cancellable<F: Future>(&self, step: F) -> Result<F::Output, SessionError> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(SessionError::Cancelled),
            out = step => Ok(out),
        }
    }

    fn enter(&mut self, next: SessionState) -> Result<(), SessionError> {
        if self.cancel.is_cancelled() {
            return Err(SessionError::Cancelled);
        }
        self.transition(next);
        Ok(())
    }

    fn transition(&mut self, next: SessionState) {
        log::debug!("Session {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn fail(&mut self, error: SessionError) -> SessionError {
        self.transition(SessionState::Failed(error.to_string()));
        error
    }
}
