//! Standard input as a local readiness source.

use std::os::fd::{AsFd, OwnedFd};

use async_trait::async_trait;
use tokio::io::unix::AsyncFd;

use super::LocalInput;

/// Reports stdin readiness without reading from it.
///
/// Registration leaves the descriptor's blocking mode untouched, since no
/// read is ever issued on it.
pub struct StdinInput {
    fd: AsyncFd<OwnedFd>,
}

impl StdinInput {
    /// Register stdin with the reactor. Fails when stdin cannot be polled
    /// (regular files, `/dev/null`); callers then run without local input.
    pub fn new() -> std::io::Result<Self> {
        Self::from_fd(std::io::stdin().as_fd().try_clone_to_owned()?)
    }

    fn from_fd(fd: OwnedFd) -> std::io::Result<Self> {
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }
}

#[async_trait]
impl LocalInput for StdinInput {
    async fn ready(&mut self) -> std::io::Result<()> {
        let mut guard = self.fd.readable().await?;
        // Acknowledge the edge so unread input does not wake us again.
        guard.clear_ready();
        Ok(())
    }
}
