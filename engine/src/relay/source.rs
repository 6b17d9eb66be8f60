//! Remote text sources a relay can attach to

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::deploy::docker::validate_container_id;
use crate::errors::EngineError;
use crate::ssh::command::{privileged, shell_quote};
use crate::utils::sha256_hash;

/// A continuously growing remote source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum LogSource {
    /// Tail of a file, following rotation
    File { path: String },
    /// Output of a long-running command
    Command { command: String },
    /// A container's log
    Container { container: String },
}

impl LogSource {
    pub fn validate(&self) -> Result<(), EngineError> {
        match self {
            LogSource::File { path } => {
                if !path.starts_with('/') || path.contains('\0') || path.contains('\n') {
                    return Err(EngineError::ValidationError(format!(
                        "log path must be absolute: '{}'",
                        path
                    )));
                }
            }
            LogSource::Command { command } => {
                if command.trim().is_empty() {
                    return Err(EngineError::ValidationError("stream command is empty".to_string()));
                }
            }
            LogSource::Container { container } => validate_container_id(container)?,
        }
        Ok(())
    }

    /// Identity used for the one-reader rule. Commands are hashed so the key
    /// stays short and printable.
    pub fn key(&self) -> String {
        match self {
            LogSource::File { path } => format!("file:{}", path),
            LogSource::Command { command } => format!("command:{}", &sha256_hash(command.as_bytes())[..16]),
            LogSource::Container { container } => format!("container:{}", container),
        }
    }

    /// Remote command producing the stream for a session logged in as `username`
    pub fn command(&self, initial_lines: u32, username: &str) -> String {
        match self {
            LogSource::File { path } => {
                let quoted = shell_quote(path);
                format!(
                    "if [ -e {p} ]; then exec tail -n {n} -F {p}; else echo {notice}; fi",
                    p = quoted,
                    n = initial_lines,
                    notice = shell_quote(&format!("log file not found: {}", path)),
                )
            }
            LogSource::Command { command } => command.clone(),
            LogSource::Container { container } => privileged(
                &format!("docker logs -f --tail {} {} 2>&1", initial_lines, container),
                username,
            ),
        }
    }
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::File { path } => write!(f, "file {}", path),
            LogSource::Command { .. } => write!(f, "command"),
            LogSource::Container { container } => write!(f, "container {}", container),
        }
    }
}
