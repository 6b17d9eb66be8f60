//! Remote targets

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;
use crate::vault::CredentialHandle;

/// An addressable host plus the sealed credential needed to reach it.
///
/// Built per operation; only the credential handle is ever stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub host_address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_username: String,
    pub credential_handle: CredentialHandle,
    /// Display name for results; defaults to the host address
    #[serde(default)]
    pub label: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl Target {
    pub fn new(
        host_address: impl Into<String>,
        ssh_port: u16,
        ssh_username: impl Into<String>,
        credential_handle: CredentialHandle,
    ) -> Self {
        Self {
            host_address: host_address.into(),
            ssh_port,
            ssh_username: ssh_username.into(),
            credential_handle,
            label: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(&self.host_address)
    }

    /// Key for the per-host connection cap
    pub fn host_key(&self) -> String {
        format!("{}:{}", self.host_address, self.ssh_port)
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let host = self.host_address.trim();
        if host.is_empty() {
            return Err(EngineError::ValidationError(
                "target host address is empty".to_string(),
            ));
        }
        if host.chars().any(|c| c.is_whitespace() || c == '/' || c == '@') {
            return Err(EngineError::ValidationError(format!(
                "target host address '{}' is malformed",
                host
            )));
        }
        if self.ssh_port == 0 {
            return Err(EngineError::ValidationError("ssh port must be non-zero".to_string()));
        }
        if self.ssh_username.trim().is_empty() {
            return Err(EngineError::ValidationError("ssh username is empty".to_string()));
        }
        Ok(())
    }
}
