//! russh-backed [`Connector`]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle, Msg};
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, PublicKey};
use russh::{Channel, ChannelMsg, Disconnect};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::errors::EngineError;
use crate::ssh::command::{shell_quote, CommandResult, StreamEvent};
use crate::ssh::session::{Connector, RemoteSession, RemoteStream};
use crate::ssh::target::Target;
use crate::vault::SshSecret;

/// How server host keys are trusted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostKeyPolicy {
    /// Log the fingerprint and accept
    #[default]
    Accept,
    /// Require a matching entry in an OpenSSH known_hosts file
    KnownHosts,
}

pub struct RusshConnector {
    policy: HostKeyPolicy,
    known_hosts_path: PathBuf,
    inactivity_timeout: Duration,
}

impl RusshConnector {
    pub fn new(policy: HostKeyPolicy, known_hosts_path: PathBuf, inactivity_timeout: Duration) -> Self {
        Self {
            policy,
            known_hosts_path,
            inactivity_timeout,
        }
    }
}

struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts_path: PathBuf,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint(HashAlg::Sha256);
        match self.policy {
            HostKeyPolicy::Accept => {
                info!(host = %self.host, port = self.port, %fingerprint, "Accepting host key");
                Ok(true)
            }
            HostKeyPolicy::KnownHosts => {
                let Some(contents) = read_known_hosts(&self.known_hosts_path).await else {
                    return Ok(false);
                };
                match check_known_hosts(&contents, &self.host, self.port, server_public_key) {
                    KnownHost::Match => Ok(true),
                    KnownHost::Mismatch => {
                        error!(host = %self.host, %fingerprint, "Host key does not match known_hosts");
                        Ok(false)
                    }
                    KnownHost::Unknown => {
                        warn!(host = %self.host, %fingerprint, "Host not present in known_hosts");
                        Ok(false)
                    }
                }
            }
        }
    }
}

async fn read_known_hosts(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => Some(contents),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "known_hosts unreadable, rejecting host key");
            None
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum KnownHost {
    Match,
    Mismatch,
    Unknown,
}

/// Names a host may appear under in known_hosts
fn host_patterns(host: &str, port: u16) -> Vec<String> {
    if port == 22 {
        vec![host.to_string(), format!("[{}]:22", host)]
    } else {
        vec![format!("[{}]:{}", host, port)]
    }
}

fn check_known_hosts(contents: &str, host: &str, port: u16, key: &PublicKey) -> KnownHost {
    let patterns = host_patterns(host, port);
    let wanted = key.fingerprint(HashAlg::Sha256);
    let mut seen_host = false;

    for line in contents.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('@') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let (Some(hosts), Some(_key_type), Some(key_data)) = (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if !hosts.split(',').any(|h| patterns.iter().any(|p| p == h)) {
            continue;
        }
        seen_host = true;
        if let Ok(stored) = russh::keys::parse_public_key_base64(key_data) {
            if stored.fingerprint(HashAlg::Sha256) == wanted {
                return KnownHost::Match;
            }
        }
    }

    if seen_host {
        KnownHost::Mismatch
    } else {
        KnownHost::Unknown
    }
}

#[async_trait]
impl Connector for RusshConnector {
    async fn connect(
        &self,
        target: &Target,
        secret: SshSecret,
        timeout: Duration,
    ) -> Result<Box<dyn RemoteSession>, EngineError> {
        let host_key = target.host_key();
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            ..Default::default()
        });
        let handler = ClientHandler {
            host: target.host_address.clone(),
            port: target.ssh_port,
            policy: self.policy,
            known_hosts_path: self.known_hosts_path.clone(),
        };

        debug!(host = %host_key, "SSH handshake");
        let addr = (target.host_address.as_str(), target.ssh_port);
        let mut handle = tokio::time::timeout(timeout, client::connect(config, addr, handler))
            .await
            .map_err(|_| {
                EngineError::ConnectionError(format!("{}: handshake timed out after {:?}", host_key, timeout))
            })?
            .map_err(|e| EngineError::ConnectionError(format!("{}: {}", host_key, e)))?;

        let authenticated = tokio::time::timeout(
            timeout,
            authenticate(&mut handle, &target.ssh_username, &secret),
        )
        .await
        .map_err(|_| {
            EngineError::ConnectionError(format!("{}: authentication timed out", host_key))
        })??;
        drop(secret);

        if !authenticated {
            return Err(EngineError::ConnectionError(format!(
                "{}: authentication failed for user {}",
                host_key, target.ssh_username
            )));
        }

        Ok(Box::new(RusshSession { handle, host_key }))
    }
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    username: &str,
    secret: &SshSecret,
) -> Result<bool, EngineError> {
    if let Some(pem) = secret.private_key_secret() {
        let passphrase = secret.passphrase_secret().map(|p| p.expose_secret());
        let key = russh::keys::decode_secret_key(pem.expose_secret(), passphrase).map_err(|e| {
            EngineError::ConnectionError(format!("private key could not be decoded: {}", e))
        })?;
        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        let result = handle
            .authenticate_publickey(username, PrivateKeyWithHashAlg::new(Arc::new(key), rsa_hash))
            .await
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;
        if result.success() {
            debug!(user = %username, "Public key authentication succeeded");
            return Ok(true);
        }
    }

    if let Some(password) = secret.password_secret() {
        let result = handle
            .authenticate_password(username, password.expose_secret())
            .await
            .map_err(|e| EngineError::ConnectionError(e.to_string()))?;
        if result.success() {
            debug!(user = %username, "Password authentication succeeded");
            return Ok(true);
        }
    }

    Ok(false)
}

struct RusshSession {
    handle: Handle<ClientHandler>,
    host_key: String,
}

impl RusshSession {
    async fn open_channel(&self, timeout: Duration) -> Result<Channel<Msg>, EngineError> {
        tokio::time::timeout(timeout, self.handle.channel_open_session())
            .await
            .map_err(|_| EngineError::CommandTimeout(timeout))?
            .map_err(|e| EngineError::ConnectionError(format!("{}: {}", self.host_key, e)))
    }
}

fn channel_error(e: russh::Error) -> EngineError {
    EngineError::ConnectionError(format!("channel error: {}", e))
}

async fn collect_output(channel: &mut Channel<Msg>) -> Result<CommandResult, EngineError> {
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    let mut exit_code = None;

    while let Some(msg) = channel.wait().await {
        match msg {
            ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
            ChannelMsg::ExtendedData { ref data, ext } if ext == 1 => stderr.extend_from_slice(data),
            ChannelMsg::ExitStatus { exit_status } => exit_code = Some(exit_status),
            _ => {}
        }
    }

    Ok(CommandResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
    })
}

#[async_trait]
impl RemoteSession for RusshSession {
    async fn exec(&self, command: &str, timeout: Duration) -> Result<CommandResult, EngineError> {
        let mut channel = self.open_channel(timeout).await?;
        let outcome = tokio::time::timeout(timeout, async {
            channel.exec(true, command).await.map_err(channel_error)?;
            collect_output(&mut channel).await
        })
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = channel.close().await {
                    debug!(host = %self.host_key, error = %e, "Closing timed out channel failed");
                }
                Err(EngineError::CommandTimeout(timeout))
            }
        }
    }

    async fn upload(
        &self,
        contents: &[u8],
        remote_path: &str,
        timeout: Duration,
    ) -> Result<(), EngineError> {
        let mut channel = self.open_channel(timeout).await?;
        let command = format!("cat > {}", shell_quote(remote_path));
        let outcome = tokio::time::timeout(timeout, async {
            channel.exec(true, command.as_str()).await.map_err(channel_error)?;
            channel.data(contents).await.map_err(channel_error)?;
            channel.eof().await.map_err(channel_error)?;
            collect_output(&mut channel).await
        })
        .await;

        match outcome {
            Ok(result) => result?.into_checked().map(|_| ()),
            Err(_) => {
                let _ = channel.close().await;
                Err(EngineError::CommandTimeout(timeout))
            }
        }
    }

    async fn open_stream(&self, command: &str) -> Result<Box<dyn RemoteStream>, EngineError> {
        let channel = self.open_channel(Duration::from_secs(30)).await?;
        // A PTY makes the remote side hang up the command when the channel closes
        channel
            .request_pty(false, "xterm", 200, 50, 0, 0, &[])
            .await
            .map_err(channel_error)?;
        channel.exec(true, command).await.map_err(channel_error)?;
        Ok(Box::new(RusshStream { channel }))
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| EngineError::ConnectionError(format!("{}: {}", self.host_key, e)))
    }
}

struct RusshStream {
    channel: Channel<Msg>,
}

#[async_trait]
impl RemoteStream for RusshStream {
    async fn next_event(&mut self) -> Option<StreamEvent> {
        loop {
            match self.channel.wait().await? {
                ChannelMsg::Data { ref data } | ChannelMsg::ExtendedData { ref data, .. } => {
                    return Some(StreamEvent::Data(data.to_vec()));
                }
                ChannelMsg::ExitStatus { exit_status } => return Some(StreamEvent::Exit(exit_status)),
                _ => continue,
            }
        }
    }

    async fn close(&mut self) -> Result<(), EngineError> {
        self.channel.close().await.map_err(channel_error)
    }
}

/// Default known_hosts location for the engine's user
pub fn default_known_hosts_path() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| Path::new("/root").to_path_buf())
        .join(".ssh")
        .join("known_hosts")
}
