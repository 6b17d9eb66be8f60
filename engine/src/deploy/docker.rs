//! Container listing and control on a target

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::EngineError;
use crate::ssh::{SessionManager, Target};

const LIST_ALL: &str = "docker ps -a --format '{{json .}}'";
const LIST_RUNNING: &str = "docker ps --format '{{json .}}'";

/// Container names and ids are passed to the remote shell unquoted
pub fn validate_container_id(container: &str) -> Result<(), EngineError> {
    let valid = !container.is_empty()
        && container.len() <= 128
        && container
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(EngineError::ValidationError(format!("invalid container id '{}'", container)))
    }
}

/// One row of `docker ps`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    /// running, exited, paused, ...
    pub state: String,
    pub ports: String,
    pub created: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct PsLine {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(default)]
    names: String,
    #[serde(default)]
    image: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    ports: String,
    #[serde(default)]
    created_at: Option<String>,
    #[serde(default)]
    running_for: Option<String>,
}

impl From<PsLine> for ContainerInfo {
    fn from(line: PsLine) -> Self {
        Self {
            id: line.id,
            name: line.names,
            image: line.image,
            status: line.status,
            state: line.state,
            ports: line.ports,
            created: line.created_at.or(line.running_for).unwrap_or_default(),
        }
    }
}

/// Parse `docker ps --format '{{json .}}'` output, skipping lines that are not JSON
pub fn parse_container_list(output: &str) -> Vec<ContainerInfo> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match serde_json::from_str::<PsLine>(line) {
            Ok(parsed) => Some(ContainerInfo::from(parsed)),
            Err(e) => {
                warn!(error = %e, "Skipping unparseable docker ps line");
                None
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerAction {
    Start,
    Stop,
    Restart,
}

impl ContainerAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerAction::Start => "start",
            ContainerAction::Stop => "stop",
            ContainerAction::Restart => "restart",
        }
    }

    fn past_tense(&self) -> &'static str {
        match self {
            ContainerAction::Start => "started",
            ContainerAction::Stop => "stopped",
            ContainerAction::Restart => "restarted",
        }
    }
}

impl fmt::Display for ContainerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerAction {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(ContainerAction::Start),
            "stop" => Ok(ContainerAction::Stop),
            "restart" => Ok(ContainerAction::Restart),
            other => Err(EngineError::ValidationError(format!(
                "unsupported container action '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerActionResult {
    pub container: String,
    pub action: ContainerAction,
    pub success: bool,
    pub message: String,
}

pub async fn list_containers(
    sessions: &SessionManager,
    target: &Target,
    include_stopped: bool,
    timeout: Duration,
) -> Result<Vec<ContainerInfo>, EngineError> {
    let command = if include_stopped { LIST_ALL } else { LIST_RUNNING };
    let session = sessions.open(target).await?;
    let result = session.exec_privileged(command, timeout).await;
    session.close().await;

    Ok(parse_container_list(&result?.into_checked()?))
}

/// Start, stop or restart one container. A non-zero docker exit is
/// reported in the result rather than as an error.
pub async fn control_container(
    sessions: &SessionManager,
    target: &Target,
    container: &str,
    action: ContainerAction,
    timeout: Duration,
) -> Result<ContainerActionResult, EngineError> {
    validate_container_id(container)?;

    let session = sessions.open(target).await?;
    let command = format!("docker {} {}", action, container);
    let result = session.exec_privileged(&command, timeout).await;
    session.close().await;
    let result = result?;

    let success = result.success();
    let message = if success {
        format!("container {} {}", container, action.past_tense())
    } else {
        result.diagnostic().to_string()
    };
    info!(target = %target.label(), %container, %action, success, "Container action finished");

    Ok(ContainerActionResult {
        container: container.to_string(),
        action,
        success,
        message,
    })
}
