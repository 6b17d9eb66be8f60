//! HTTP request handlers

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use futures::FutureExt;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::deploy::docker::{
    control_container, list_containers, validate_container_id, ContainerAction, ContainerActionResult,
    ContainerInfo,
};
use crate::deploy::model::{AgentDeployRequest, DeployRequest, RollbackRequest};
use crate::errors::EngineError;
use crate::jobs::{JobFuture, JobRecord};
use crate::probe::host::probe_host_facts;
use crate::probe::status::collect_status;
use crate::probe::{HostFacts, MiddlewareKind, MiddlewareStatus, VerificationReport, VerifyRequest};
use crate::server::state::ServerState;
use crate::ssh::Target;
use crate::utils::version_info;
use crate::vault::CredentialHandle;

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Health check handler
pub async fn health_handler() -> impl IntoResponse {
    let version = version_info();
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: "opspro-engine".to_string(),
        version: version.version,
    })
}

/// Version response
#[derive(Debug, Serialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Version handler
pub async fn version_handler() -> impl IntoResponse {
    let version = version_info();
    Json(VersionResponse {
        version: version.version,
        git_hash: version.git_hash,
        build_time: version.build_time,
    })
}

// ================================ VERIFICATION ================================== //

/// A host not yet registered with the backend
#[derive(Debug, Deserialize)]
pub struct AdHocTarget {
    pub host_address: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub ssh_username: String,
    pub credential_handle: CredentialHandle,
    #[serde(default)]
    pub name: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl AdHocTarget {
    fn into_target(self) -> Target {
        let target = Target::new(self.host_address, self.ssh_port, self.ssh_username, self.credential_handle);
        match self.name {
            Some(name) if !name.is_empty() => target.with_label(name),
            _ => target,
        }
    }
}

/// Verification or status request body
#[derive(Deserialize)]
pub struct VerifyBody {
    #[serde(default)]
    pub resource_id: Option<String>,
    #[serde(default)]
    pub target: Option<AdHocTarget>,
    /// `mysql`, `redis` or `sentinel`; parsed in `verify_request`
    pub middleware_type: String,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub username: Option<String>,
    /// Plaintext middleware password
    #[serde(default)]
    pub password: Option<String>,
    /// Middleware password sealed by the vault
    #[serde(default)]
    pub password_handle: Option<CredentialHandle>,
    #[serde(default)]
    pub service_name: Option<String>,
}

async fn resolve_target(
    state: &ServerState,
    resource_id: Option<String>,
    target: Option<AdHocTarget>,
) -> Result<Target, EngineError> {
    match (resource_id, target) {
        (Some(id), None) => Ok(state.store.get_resource(&id).await?.target()),
        (None, Some(target)) => Ok(target.into_target()),
        (Some(_), Some(_)) => Err(EngineError::ValidationError(
            "give either resource_id or target, not both".to_string(),
        )),
        (None, None) => Err(EngineError::ValidationError(
            "resource_id or target is required".to_string(),
        )),
    }
}

async fn verify_request(state: &ServerState, body: VerifyBody) -> Result<VerifyRequest, EngineError> {
    let kind: MiddlewareKind = body.middleware_type.parse()?;
    let password = match (body.password, body.password_handle) {
        (Some(_), Some(_)) => {
            return Err(EngineError::ValidationError(
                "give either password or password_handle, not both".to_string(),
            ))
        }
        (Some(password), None) => Some(SecretString::from(password)),
        (None, Some(handle)) => Some(state.sessions.vault().open_text(&handle)?),
        (None, None) => None,
    };
    let target = resolve_target(state, body.resource_id, body.target).await?;

    Ok(VerifyRequest {
        target,
        kind,
        port: body.port,
        username: body.username.filter(|u| !u.is_empty()),
        password,
        service_name: body.service_name.filter(|s| !s.is_empty()),
    })
}

/// Run the onboarding checks for one middleware instance
pub async fn verify_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<VerificationReport>, EngineError> {
    let request = verify_request(&state, body).await?;
    let report = state.probe.verify(request).await?;
    Ok(Json(report))
}

/// Service state and metrics for a registered middleware instance
pub async fn middleware_status_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<VerifyBody>,
) -> Result<Json<MiddlewareStatus>, EngineError> {
    let request = verify_request(&state, body).await?;
    let status = collect_status(&state.sessions, &request, state.probe.options().check_timeout).await?;
    Ok(Json(status))
}

pub async fn host_facts_handler(
    State(state): State<Arc<ServerState>>,
    Path(resource_id): Path<String>,
) -> Result<Json<HostFacts>, EngineError> {
    let target = state.store.get_resource(&resource_id).await?.target();
    let facts = probe_host_facts(&state.sessions, &target, state.probe.options().check_timeout).await?;
    Ok(Json(facts))
}

// ================================== DEPLOYMENT ================================== //

#[derive(Debug, Deserialize)]
pub struct ArtifactQuery {
    pub filename: String,
}

/// Store and validate an uploaded site package
pub async fn upload_artifact_handler(
    State(state): State<Arc<ServerState>>,
    Query(query): Query<ArtifactQuery>,
    body: Bytes,
) -> Result<impl IntoResponse, EngineError> {
    if body.is_empty() {
        return Err(EngineError::ValidationError("package is empty".to_string()));
    }
    let artifact = state
        .orchestrator
        .artifacts()
        .save(&query.filename, body.to_vec())
        .await?;
    Ok((StatusCode::CREATED, Json(artifact)))
}

/// Either runs inline or hands the work to the job runner
#[derive(Debug, Deserialize)]
pub struct Submission<T> {
    #[serde(flatten)]
    pub request: T,
    #[serde(default, rename = "async")]
    pub run_async: bool,
}

#[derive(Debug, Serialize)]
pub struct JobAccepted {
    pub job_id: String,
}

async fn submit_or_run(state: &ServerState, name: &str, run_async: bool, job: JobFuture) -> Response {
    if run_async {
        return match state.jobs.submit(name, job).await {
            Ok(job_id) => {
                info!(job = %job_id, "{} submitted", name);
                (StatusCode::ACCEPTED, Json(JobAccepted { job_id })).into_response()
            }
            Err(e) => e.into_response(),
        };
    }
    match job.await {
        Ok(output) => Json(output).into_response(),
        Err(e) => e.into_response(),
    }
}

pub async fn deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Submission<DeployRequest>>,
) -> Response {
    let orchestrator = state.orchestrator.clone();
    let request = body.request;
    let job = async move {
        let response = orchestrator.deploy(request).await?;
        Ok::<_, EngineError>(serde_json::to_value(response)?)
    }
    .boxed();
    submit_or_run(&state, "deploy", body.run_async, job).await
}

pub async fn rollback_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Submission<RollbackRequest>>,
) -> Response {
    let orchestrator = state.orchestrator.clone();
    let request = body.request;
    let job = async move {
        let response = orchestrator.rollback(request).await?;
        Ok::<_, EngineError>(serde_json::to_value(response)?)
    }
    .boxed();
    submit_or_run(&state, "rollback", body.run_async, job).await
}

pub async fn agent_deploy_handler(
    State(state): State<Arc<ServerState>>,
    Json(body): Json<Submission<AgentDeployRequest>>,
) -> Response {
    let orchestrator = state.orchestrator.clone();
    let request = body.request;
    let job = async move {
        let response = orchestrator.deploy_agent(request).await?;
        Ok::<_, EngineError>(serde_json::to_value(response)?)
    }
    .boxed();
    submit_or_run(&state, "agent-deploy", body.run_async, job).await
}

pub async fn backups_handler(
    State(state): State<Arc<ServerState>>,
    Path(resource_id): Path<String>,
) -> Result<impl IntoResponse, EngineError> {
    let backups = state.orchestrator.list_backups(&resource_id).await?;
    Ok(Json(backups))
}

// =================================== CONTAINERS ================================= //

#[derive(Debug, Default, Deserialize)]
pub struct ContainerListQuery {
    /// Include stopped containers; defaults to true
    #[serde(default)]
    pub all: Option<bool>,
}

pub async fn containers_handler(
    State(state): State<Arc<ServerState>>,
    Path(resource_id): Path<String>,
    Query(query): Query<ContainerListQuery>,
) -> Result<Json<Vec<ContainerInfo>>, EngineError> {
    let target = state.store.get_resource(&resource_id).await?.target();
    let containers = list_containers(
        &state.sessions,
        &target,
        query.all.unwrap_or(true),
        state.probe.options().check_timeout,
    )
    .await?;
    Ok(Json(containers))
}

pub async fn container_action_handler(
    State(state): State<Arc<ServerState>>,
    Path((resource_id, container, action)): Path<(String, String, String)>,
) -> Result<Json<ContainerActionResult>, EngineError> {
    let action: ContainerAction = action.parse()?;
    validate_container_id(&container)?;
    let target = state.store.get_resource(&resource_id).await?.target();
    let result = control_container(
        &state.sessions,
        &target,
        &container,
        action,
        state.orchestrator.options().step_timeout,
    )
    .await?;
    Ok(Json(result))
}

// ===================================== JOBS ===================================== //

pub async fn jobs_handler(State(state): State<Arc<ServerState>>) -> Json<Vec<JobRecord>> {
    Json(state.jobs.history().await)
}

pub async fn job_handler(
    State(state): State<Arc<ServerState>>,
    Path(job_id): Path<String>,
) -> Result<Json<JobRecord>, EngineError> {
    Ok(Json(state.jobs.poll(&job_id).await?))
}
