//! Session manager: per-host connection cap and scoped credential use

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::ssh::command::{privileged, CommandResult};
use crate::ssh::session::{Connector, RemoteSession, RemoteStream};
use crate::ssh::target::Target;
use crate::vault::CredentialVault;

/// SSH session options
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Bound on handshake plus authentication, and on waiting for a slot
    pub connect_timeout: Duration,

    /// Maximum concurrent sessions to one host
    pub per_host_cap: usize,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            per_host_cap: 4,
        }
    }
}

pub struct SessionManager {
    connector: Arc<dyn Connector>,
    vault: Arc<CredentialVault>,
    options: SshOptions,
    slots: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl SessionManager {
    pub fn new(connector: Arc<dyn Connector>, vault: Arc<CredentialVault>, options: SshOptions) -> Self {
        Self {
            connector,
            vault,
            options,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    fn slot(&self, host_key: &str) -> Arc<Semaphore> {
        let mut slots = match self.slots.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        slots
            .entry(host_key.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.options.per_host_cap.max(1))))
            .clone()
    }

    /// Free session slots for the target's host
    pub fn available_slots(&self, target: &Target) -> usize {
        self.slot(&target.host_key()).available_permits()
    }

    /// Open a session for one logical operation.
    ///
    /// Holds a slot of the host's connection cap until the session is closed
    /// or dropped. The credential is decrypted here and dropped once the
    /// connector has authenticated.
    pub async fn open(&self, target: &Target) -> Result<ManagedSession, EngineError> {
        target.validate()?;
        let host_key = target.host_key();

        let permit = tokio::time::timeout(self.options.connect_timeout, self.slot(&host_key).acquire_owned())
            .await
            .map_err(|_| {
                EngineError::ConnectionError(format!(
                    "{}: connection cap of {} reached",
                    host_key, self.options.per_host_cap
                ))
            })?
            .map_err(|_| EngineError::Internal("connection slots closed".to_string()))?;

        let secret = self.vault.retrieve(&target.credential_handle)?;
        debug!(
            host = %host_key,
            user = %target.ssh_username,
            credential = %target.credential_handle.fingerprint(),
            "Opening SSH session"
        );
        let inner = self
            .connector
            .connect(target, secret, self.options.connect_timeout)
            .await?;

        Ok(ManagedSession {
            inner,
            username: target.ssh_username.clone(),
            label: target.label().to_string(),
            _permit: permit,
        })
    }

    /// One-shot form of [`open`](Self::open) + exec + close
    pub async fn execute(
        &self,
        target: &Target,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, EngineError> {
        let session = self.open(target).await?;
        let result = session.exec(command, timeout).await;
        session.close().await;
        result
    }
}

/// A session bound to one operation
pub struct ManagedSession {
    inner: Box<dyn RemoteSession>,
    username: String,
    label: String,
    _permit: OwnedSemaphorePermit,
}

impl ManagedSession {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandResult, EngineError> {
        self.inner.exec(command, timeout).await
    }

    /// Run with `sudo -n` unless logged in as root
    pub async fn exec_privileged(
        &self,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, EngineError> {
        self.inner.exec(&privileged(command, &self.username), timeout).await
    }

    pub async fn upload(
        &self,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        self.inner.upload(contents, remote_path, timeout).await
    }

    pub async fn open_stream(&self, command: &str) -> Result<Box<dyn RemoteStream>, EngineError> {
        self.inner.open_stream(command).await
    }

    /// Disconnect and release the host slot
    pub async fn close(self) {
        if let Err(e) = self.inner.close().await {
            warn!(target = %self.label, error = %e, "SSH disconnect failed");
        }
    }

    /// Like [`close`](Self::close) but surfaces the disconnect error
    pub async fn try_close(self) -> Result<(), EngineError> {
        self.inner.close().await
    }
}
