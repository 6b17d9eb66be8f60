//! Error types for the OpsPro engine

use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

/// Main error type for the OpsPro engine
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// The host could not be reached or refused the credentials
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// A remote command ran past its deadline and was abandoned
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// A remote command exited non-zero
    #[error("Command failed (exit {exit_code}): {output}")]
    CommandFailed { exit_code: u32, output: String },

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Step '{step}' failed: {message}")]
    StepFailure { step: String, message: String },

    /// Cleanup of a live stream could not confirm remote detachment
    #[error("Stream teardown error: {0}")]
    StreamTeardown(String),

    #[error("Stream already attached: {0}")]
    AlreadyAttached(String),

    #[error("Vault error: {0}")]
    VaultError(String),

    #[error("Storage error: {0}")]
    StorageError(String),

    #[error("Job error: {0}")]
    JobError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            EngineError::ValidationError(_) | EngineError::JsonError(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AlreadyAttached(_) => StatusCode::CONFLICT,
            EngineError::ConnectionError(_) => StatusCode::BAD_GATEWAY,
            EngineError::CommandTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        EngineError::Internal(err.to_string())
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({ "error": self.to_string() });
        (self.status_code(), Json(body)).into_response()
    }
}
