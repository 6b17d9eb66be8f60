//! Deployment data model

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ssh::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
}

/// One remote action on one target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub target_label: String,
    pub step_name: String,
    pub status: StepStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResult {
    pub target_label: String,
    pub resource_id: String,
    pub success: bool,
    pub steps: Vec<DeploymentStep>,
    pub error: Option<String>,
}

impl DeploymentResult {
    pub fn step(&self, name: &str) -> Option<&DeploymentStep> {
        self.steps.iter().find(|s| s.step_name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_name.as_str()).collect()
    }
}

/// Tag distinguishing otherwise identical result shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Deploy,
    Rollback,
    AgentDeploy,
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Operation::Deploy => "deploy",
            Operation::Rollback => "rollback",
            Operation::AgentDeploy => "agent_deploy",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentResponse {
    pub operation: Operation,
    pub success: bool,
    pub results: Vec<DeploymentResult>,
}

impl DeploymentResponse {
    pub fn new(operation: Operation, results: Vec<DeploymentResult>) -> Self {
        let success = !results.is_empty() && results.iter().all(|r| r.success);
        Self {
            operation,
            success,
            results,
        }
    }

    pub fn result_for(&self, resource_id: &str) -> Option<&DeploymentResult> {
        self.results.iter().find(|r| r.resource_id == resource_id)
    }
}

/// A prior artifact snapshot on a target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub name: String,
    pub size: u64,
    pub created_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Success,
    Failed,
}

/// History row appended after every deploy, rollback or agent install
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: String,
    pub operation: Operation,
    pub resource_ids: Vec<String>,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub steps: Vec<DeploymentStep>,
    /// Request as submitted, never carrying credentials
    pub input: serde_json::Value,
}

/// A resolved resource ready to receive steps
#[derive(Debug, Clone)]
pub struct DeployTarget {
    pub resource_id: String,
    pub target: Target,
}

impl DeployTarget {
    pub fn label(&self) -> &str {
        self.target.label()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployFlags {
    #[serde(default)]
    pub restart_shared_daemon: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub artifact_id: String,
    pub target_resource_ids: Vec<String>,
    #[serde(default)]
    pub options: DeployFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub target_resource_id: String,
    pub backup_name: String,
    /// Restart the failover daemon once the restore is healthy
    #[serde(default)]
    pub restart_shared_daemon: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDeployRequest {
    pub target_resource_ids: Vec<String>,
}
