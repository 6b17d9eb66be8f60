//! Remote command results and shell helpers

use serde::{Deserialize, Serialize};

use crate::errors::EngineError;

/// Output of one remote command
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the channel closed without reporting a status
    pub exit_code: Option<u32>,
}

impl CommandResult {
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>, exit_code: u32) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stdout_trimmed(&self) -> &str {
        self.stdout.trim()
    }

    /// stderr if present, otherwise stdout
    pub fn diagnostic(&self) -> &str {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim()
        } else {
            stderr
        }
    }

    /// stdout on success, [`EngineError::CommandFailed`] otherwise
    pub fn into_checked(self) -> Result<String, EngineError> {
        if self.success() {
            Ok(self.stdout)
        } else {
            Err(EngineError::CommandFailed {
                exit_code: self.exit_code.unwrap_or(u32::MAX),
                output: self.diagnostic().to_string(),
            })
        }
    }
}

/// One event from a long-running remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Data(Vec<u8>),
    Exit(u32),
}

/// Quote a value for a POSIX shell as a single-quoted word
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Prefix with non-interactive sudo unless already running as root
pub fn privileged(command: &str, username: &str) -> String {
    if username == "root" {
        command.to_string()
    } else {
        format!("sudo -n sh -c {}", shell_quote(command))
    }
}
