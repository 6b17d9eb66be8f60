//! Background job interface

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::EngineError;

/// Work handed to a queue; resolves to the job's JSON output
pub type JobFuture = BoxFuture<'static, Result<Value, EngineError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub name: String,
    pub status: JobStatus,
    pub submitted_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    pub fn queued(id: String, name: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            status: JobStatus::Queued,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            output: None,
            error: None,
        }
    }
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Accept `job` for background execution and return its id
    async fn submit(&self, name: &str, job: JobFuture) -> Result<String, EngineError>;

    async fn poll(&self, job_id: &str) -> Result<JobRecord, EngineError>;

    /// Known jobs, newest first
    async fn history(&self) -> Vec<JobRecord>;

    /// Stop accepting work and wait for running jobs
    async fn shutdown(&self);
}
