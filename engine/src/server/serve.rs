//! HTTP server setup

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::app::options::ServerOptions;
use crate::errors::EngineError;
use crate::server::handlers::{
    agent_deploy_handler, backups_handler, container_action_handler, containers_handler, deploy_handler,
    health_handler, host_facts_handler, job_handler, jobs_handler, middleware_status_handler,
    rollback_handler, upload_artifact_handler, verify_handler, version_handler,
};
use crate::server::state::ServerState;
use crate::server::ws::logs_ws_handler;

/// Build the engine's router
pub fn router(state: Arc<ServerState>, max_upload_bytes: usize) -> Router {
    Router::new()
        // Health and version
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        // Onboarding and monitoring probes
        .route("/verify", post(verify_handler))
        .route("/middleware/status", post(middleware_status_handler))
        .route("/resources/{id}/facts", post(host_facts_handler))
        // Deployment
        .route(
            "/artifacts",
            post(upload_artifact_handler).layer(DefaultBodyLimit::max(max_upload_bytes)),
        )
        .route("/deploy", post(deploy_handler))
        .route("/rollback", post(rollback_handler))
        .route("/agents/deploy", post(agent_deploy_handler))
        .route("/resources/{id}/backups", get(backups_handler))
        // Containers
        .route("/resources/{id}/containers", get(containers_handler))
        .route(
            "/resources/{id}/containers/{container}/{action}",
            post(container_action_handler),
        )
        // Background jobs
        .route("/jobs", get(jobs_handler))
        .route("/jobs/{id}", get(job_handler))
        // Live logs
        .route("/ws/logs/{resource_id}", get(logs_ws_handler))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Start the HTTP server
pub async fn serve(
    options: &ServerOptions,
    state: Arc<ServerState>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<JoinHandle<Result<(), EngineError>>, EngineError> {
    let app = router(state, options.max_upload_bytes);

    let addr = format!("{}:{}", options.host, options.port);
    info!("Starting HTTP server on {}", addr);

    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| EngineError::ServerError(e.to_string()))?;

    let handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal)
            .await
            .map_err(|e| EngineError::ServerError(e.to_string()))
    });

    Ok(handle)
}
