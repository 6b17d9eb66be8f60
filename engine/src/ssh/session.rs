//! Transport seams between the engine and an SSH implementation

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::ssh::command::{CommandResult, StreamEvent};
use crate::ssh::target::Target;
use crate::vault::SshSecret;

/// Opens authenticated sessions to targets
#[async_trait]
pub trait Connector: Send + Sync {
    /// Handshake and authenticate within `timeout`. The secret is consumed
    /// and dropped before this returns.
    async fn connect(
        &self,
        target: &Target,
        secret: SshSecret,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, EngineError>;
}

/// An authenticated connection to one host
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Run a command to completion. On timeout the channel is closed and
    /// [`EngineError::CommandTimeout`] is returned.
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandResult, EngineError>;

    /// Write `contents` to `remote_path`, replacing it
    async fn upload(
        &self,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), EngineError>;

    /// Start a long-running command whose output is read incrementally
    async fn open_stream(&self, command: &str) -> Result<Box<dyn RemoteStream>, EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Output of a long-running remote command
#[async_trait]
pub trait RemoteStream: Send {
    /// Next event, or `None` once the remote side has closed.
    /// Dropping the returned future loses no data.
    async fn next_event(&mut self) -> Option<StreamEvent>;

    async fn close(&mut self) -> Result<(), EngineError>;
}
