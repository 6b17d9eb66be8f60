//! Deployment orchestrator.
//!
//! Every target runs its plan over its own session, concurrently with and
//! isolated from the other targets of the batch. Steps on one target are
//! strictly sequential; the first failure stops that target only. Nothing
//! is retried here.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use futures::future::join_all;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::deploy::agent::{self, list_bundles, load_template, mint_agent_token, render_template, unit_file};
use crate::deploy::artifact::ArtifactStore;
use crate::deploy::backup::{self, backup_name_at, validate_backup_name};
use crate::deploy::fsm::StepRecorder;
use crate::deploy::model::{
    AgentDeployRequest, BackupRecord, DeployRequest, DeployTarget, DeploymentResponse, DeploymentResult,
    ExecutionRecord, ExecutionStatus, Operation, RollbackRequest,
};
use crate::deploy::plan::{self, PlannedStep, StepAction, CONNECT};
use crate::errors::EngineError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::ssh::{ManagedSession, SessionManager};
use crate::storage::settings::{AgentSettings, SiteLayout};
use crate::storage::store::ResourceStore;
use crate::utils::generate_uuid;

/// Orchestrator options
#[derive(Debug, Clone)]
pub struct OrchestratorOptions {
    /// Deadline for a single remote step
    pub step_timeout: Duration,

    /// Deadline for a whole batch, checked before each step starts
    pub batch_deadline: Duration,

    pub max_batch_size: usize,

    pub site: SiteLayout,

    pub agent: AgentSettings,

    /// Signing secret for agent push tokens
    pub agent_token_secret: Option<SecretString>,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(120),
            batch_deadline: Duration::from_secs(15 * 60),
            max_batch_size: 10,
            site: SiteLayout::default(),
            agent: AgentSettings::default(),
            agent_token_secret: None,
        }
    }
}

/// State carried between the steps of one target
#[derive(Debug, Default)]
struct StepContext {
    arch: Option<String>,
}

struct TargetRun {
    recorder: StepRecorder,
    session: Option<ManagedSession>,
    ok: bool,
}

pub struct Orchestrator {
    sessions: Arc<SessionManager>,
    store: Arc<dyn ResourceStore>,
    artifacts: Arc<ArtifactStore>,
    bundle_dir: Dir,
    options: OrchestratorOptions,
}

impl Orchestrator {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn ResourceStore>,
        artifacts: Arc<ArtifactStore>,
        bundle_dir: Dir,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            sessions,
            store,
            artifacts,
            bundle_dir,
            options,
        }
    }

    pub fn options(&self) -> &OrchestratorOptions {
        &self.options
    }

    pub fn artifacts(&self) -> &Arc<ArtifactStore> {
        &self.artifacts
    }

    /// Roll a site package out to a batch of resources
    pub async fn deploy(&self, request: DeployRequest) -> Result<DeploymentResponse, EngineError> {
        let started_at = Utc::now();
        self.validate_batch(&request.target_resource_ids)?;
        let ha = request.options.restart_shared_daemon;
        if ha && request.target_resource_ids.len() != 2 {
            return Err(EngineError::ValidationError(format!(
                "restart_shared_daemon requires exactly two targets, got {}",
                request.target_resource_ids.len()
            )));
        }

        let (artifact, contents) = self.artifacts.load_validated(&request.artifact_id).await?;
        let targets = self.resolve(&request.target_resource_ids).await?;
        let contents = Arc::new(contents);
        let deadline = Instant::now() + self.options.batch_deadline;
        let timeout = self.options.step_timeout;

        info!(artifact = %artifact.id, targets = targets.len(), ha, "Starting deployment batch");

        let mut runs = join_all(targets.iter().map(|target| {
            let deploy_id: String = generate_uuid().replace('-', "").chars().take(8).collect();
            let steps = plan::site_plan(
                &self.options.site,
                artifact.format,
                contents.clone(),
                &deploy_id,
                &backup_name_at(&Local::now()),
                timeout,
            );
            async move { self.run_target(target, steps, deadline).await }
        }))
        .await;

        if ha && runs.iter().all(|run| run.ok) {
            let step = plan::failover_step(&self.options.site, timeout);
            for run in runs.iter_mut() {
                if let Some(session) = &run.session {
                    let mut ctx = StepContext::default();
                    run.ok = self
                        .run_steps(&mut run.recorder, session, std::slice::from_ref(&step), &mut ctx, deadline)
                        .await;
                }
            }
        } else if ha {
            warn!("Skipping failover daemon restart: not every host deployed cleanly");
        }

        let response = DeploymentResponse::new(Operation::Deploy, self.finish_runs(runs).await);
        self.record(&request.target_resource_ids, &request, started_at, &response)
            .await;
        Ok(response)
    }

    /// Restore a named backup on one resource
    pub async fn rollback(&self, request: RollbackRequest) -> Result<DeploymentResponse, EngineError> {
        let started_at = Utc::now();
        validate_backup_name(&request.backup_name)?;
        let ids = vec![request.target_resource_id.clone()];
        let targets = self.resolve(&ids).await?;
        let deadline = Instant::now() + self.options.batch_deadline;

        let mut runs = Vec::with_capacity(targets.len());
        for target in &targets {
            let mut steps = plan::rollback_plan(&self.options.site, &request.backup_name, self.options.step_timeout);
            if request.restart_shared_daemon {
                steps.push(plan::failover_step(&self.options.site, self.options.step_timeout));
            }
            runs.push(self.run_target(target, steps, deadline).await);
        }

        let response = DeploymentResponse::new(Operation::Rollback, self.finish_runs(runs).await);
        self.record(&ids, &request, started_at, &response).await;
        Ok(response)
    }

    /// Install and start the monitoring agent on a batch of resources
    pub async fn deploy_agent(&self, request: AgentDeployRequest) -> Result<DeploymentResponse, EngineError> {
        let started_at = Utc::now();
        self.validate_batch(&request.target_resource_ids)?;

        let secret = self
            .options
            .agent_token_secret
            .as_ref()
            .filter(|s| !s.expose_secret().is_empty())
            .ok_or_else(|| {
                EngineError::ConfigError(format!(
                    "agent token secret is not set ({})",
                    self.options.agent.token_secret_env
                ))
            })?;
        let bundles = list_bundles(&self.bundle_dir).await?;
        if bundles.is_empty() {
            return Err(EngineError::ValidationError(format!(
                "no agent bundles in {}",
                self.bundle_dir.path().display()
            )));
        }
        let template = load_template(&self.options.agent).await?;
        let targets = self.resolve(&request.target_resource_ids).await?;
        let deadline = Instant::now() + self.options.batch_deadline;
        let agent = &self.options.agent;

        let mut plans = Vec::with_capacity(targets.len());
        for target in &targets {
            let token = mint_agent_token(
                secret.expose_secret().as_bytes(),
                &target.resource_id,
                agent.token_ttl_days,
            )?;
            let config = render_template(
                &template,
                &[
                    ("resource_id", target.resource_id.as_str()),
                    ("host_address", target.target.host_address.as_str()),
                    ("metrics_push_url", agent.metrics_push_url().as_str()),
                    ("logs_push_url", agent.logs_push_url().as_str()),
                    ("token", token.as_str()),
                ],
            );
            let steps = plan::agent_plan(
                agent,
                bundles.clone(),
                config,
                unit_file(&agent.service_name),
                self.options.step_timeout,
            );
            plans.push((target, steps));
        }

        info!(targets = plans.len(), "Starting agent rollout");
        let runs = join_all(
            plans
                .into_iter()
                .map(|(target, steps)| self.run_target(target, steps, deadline)),
        )
        .await;

        let response = DeploymentResponse::new(Operation::AgentDeploy, self.finish_runs(runs).await);
        self.record(&request.target_resource_ids, &request, started_at, &response)
            .await;
        Ok(response)
    }

    /// Backups on one resource, newest first
    pub async fn list_backups(&self, resource_id: &str) -> Result<Vec<BackupRecord>, EngineError> {
        let targets = self.resolve(&[resource_id.to_string()]).await?;
        let mut backups = Vec::new();
        for target in &targets {
            let session = self.sessions.open(&target.target).await?;
            let listed = backup::list_backups(&session, &self.options.site, self.options.step_timeout).await;
            session.close().await;
            backups = listed?;
        }
        Ok(backups)
    }

    fn validate_batch(&self, ids: &[String]) -> Result<(), EngineError> {
        if ids.is_empty() {
            return Err(EngineError::ValidationError("no target resources given".to_string()));
        }
        if ids.len() > self.options.max_batch_size {
            return Err(EngineError::ValidationError(format!(
                "batch of {} targets exceeds the limit of {}",
                ids.len(),
                self.options.max_batch_size
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(EngineError::ValidationError(format!("resource {} listed twice", dup)));
        }
        Ok(())
    }

    async fn resolve(&self, ids: &[String]) -> Result<Vec<DeployTarget>, EngineError> {
        let mut targets = Vec::with_capacity(ids.len());
        for id in ids {
            let resource = self.store.get_resource(id).await?;
            let target = resource.target();
            target.validate()?;
            targets.push(DeployTarget {
                resource_id: id.clone(),
                target,
            });
        }
        Ok(targets)
    }

    async fn run_target(&self, target: &DeployTarget, steps: Vec<PlannedStep>, deadline: Instant) -> TargetRun {
        let mut recorder = StepRecorder::new(&target.resource_id, target.label());

        if !begin(&mut recorder, CONNECT, deadline, self.options.batch_deadline) {
            return TargetRun {
                recorder,
                session: None,
                ok: false,
            };
        }
        let session = match self.sessions.open(&target.target).await {
            Ok(session) => {
                settle(recorder.succeed(format!(
                    "connected as {}@{}",
                    session.username(),
                    target.target.host_key()
                )));
                session
            }
            Err(e) => {
                settle(recorder.fail(failure_message(&e)));
                return TargetRun {
                    recorder,
                    session: None,
                    ok: false,
                };
            }
        };

        let mut ctx = StepContext::default();
        let ok = self
            .run_steps(&mut recorder, &session, &steps, &mut ctx, deadline)
            .await;
        TargetRun {
            recorder,
            session: Some(session),
            ok,
        }
    }

    /// Run `steps` in order; false once a step fails
    async fn run_steps(
        &self,
        recorder: &mut StepRecorder,
        session: &ManagedSession,
        steps: &[PlannedStep],
        ctx: &mut StepContext,
        deadline: Instant,
    ) -> bool {
        for step in steps {
            if !begin(recorder, step.name, deadline, self.options.batch_deadline) {
                return false;
            }
            match self.execute(session, step, ctx).await {
                Ok(message) => settle(recorder.succeed(message)),
                Err(e) => {
                    settle(recorder.fail(failure_message(&e)));
                    return false;
                }
            }
        }
        true
    }

    async fn execute(
        &self,
        session: &ManagedSession,
        step: &PlannedStep,
        ctx: &mut StepContext,
    ) -> Result<String, EngineError> {
        match &step.action {
            StepAction::Sequence(actions) => {
                let mut messages = Vec::with_capacity(actions.len());
                for action in actions {
                    messages.push(self.execute_action(session, step, action, ctx).await?);
                }
                Ok(messages.join("; "))
            }
            action => self.execute_action(session, step, action, ctx).await,
        }
    }

    async fn execute_action(
        &self,
        session: &ManagedSession,
        step: &PlannedStep,
        action: &StepAction,
        ctx: &mut StepContext,
    ) -> Result<String, EngineError> {
        let timeout = step.timeout;
        let step_failure = |message: String| EngineError::StepFailure {
            step: step.name.to_string(),
            message,
        };

        match action {
            StepAction::Exec(command) => {
                let out = session.exec(command, timeout).await?.into_checked()?;
                Ok(summarize(&out))
            }
            StepAction::Privileged(command) => {
                let out = session.exec_privileged(command, timeout).await?.into_checked()?;
                Ok(summarize(&out))
            }
            StepAction::Upload { contents, remote_path } => {
                session.upload(contents, remote_path, timeout).await?;
                Ok(format!("uploaded {} bytes to {}", contents.len(), remote_path))
            }
            StepAction::Expect { command, expected } => {
                let out = session.exec_privileged(command, timeout).await?.into_checked()?;
                if out.trim() == expected {
                    Ok(expected.clone())
                } else {
                    Err(step_failure(format!("expected '{}', got '{}'", expected, summarize(&out))))
                }
            }
            StepAction::HealthCheck {
                command,
                expected,
                attempts,
                interval,
            } => {
                let mut last = String::new();
                for attempt in 1..=*attempts {
                    match session.exec_privileged(command, timeout).await {
                        Ok(result) if result.stdout_trimmed() == expected => {
                            return Ok(format!("{} after {} attempt(s)", expected, attempt));
                        }
                        Ok(result) => last = summarize(&result.stdout),
                        Err(e) => last = e.to_string(),
                    }
                    if attempt < *attempts {
                        tokio::time::sleep(*interval).await;
                    }
                }
                Err(step_failure(format!(
                    "expected '{}' after {} attempts, last saw '{}'",
                    expected, attempts, last
                )))
            }
            StepAction::DetectArch => {
                let raw = session.exec("uname -m", timeout).await?.into_checked()?;
                let arch = agent::normalize_arch(&raw);
                let message = format!("{} ({})", arch, raw.trim());
                ctx.arch = Some(arch);
                Ok(message)
            }
            StepAction::UploadArchBundle { bundles, remote_path } => {
                let arch = ctx
                    .arch
                    .as_deref()
                    .ok_or_else(|| step_failure("architecture was not detected".to_string()))?;
                let bundle = agent::select_bundle(bundles, arch)
                    .ok_or_else(|| step_failure(format!("no bundle built for linux-{}", arch)))?;
                let contents = File::new(bundle).read_bytes().await?;
                session.upload(&contents, remote_path, timeout).await?;
                Ok(format!(
                    "uploaded {} ({} bytes) to {}",
                    bundle.file_name().map(|n| n.to_string_lossy()).unwrap_or_default(),
                    contents.len(),
                    remote_path
                ))
            }
            StepAction::WithRestore { command, restore } => {
                let outcome = match session.exec_privileged(command, timeout).await {
                    Ok(result) => result.into_checked(),
                    Err(e) => Err(e),
                };
                match outcome {
                    Ok(out) => Ok(summarize(&out)),
                    Err(e) => {
                        let restored = match session.exec_privileged(restore, timeout).await {
                            Ok(result) => result.into_checked().map(|_| ()),
                            Err(e) => Err(e),
                        };
                        let message = match restored {
                            Ok(()) => format!("{}; previous content restored from backup", failure_message(&e)),
                            Err(restore_err) => format!(
                                "{}; automatic restore failed: {}",
                                failure_message(&e),
                                failure_message(&restore_err)
                            ),
                        };
                        Err(step_failure(message))
                    }
                }
            }
            StepAction::Sequence(_) => Err(EngineError::Internal(format!(
                "nested sequence in step '{}'",
                step.name
            ))),
        }
    }

    /// Finish recorders and release every session still held
    async fn finish_runs(&self, runs: Vec<TargetRun>) -> Vec<DeploymentResult> {
        let mut results = Vec::with_capacity(runs.len());
        for run in runs {
            if let Some(session) = run.session {
                session.close().await;
            }
            results.push(run.recorder.finish());
        }
        results
    }

    async fn record<T: Serialize>(
        &self,
        resource_ids: &[String],
        input: &T,
        started_at: chrono::DateTime<Utc>,
        response: &DeploymentResponse,
    ) {
        let record = ExecutionRecord {
            id: generate_uuid(),
            operation: response.operation,
            resource_ids: resource_ids.to_vec(),
            status: if response.success {
                ExecutionStatus::Success
            } else {
                ExecutionStatus::Failed
            },
            started_at,
            finished_at: Utc::now(),
            steps: response
                .results
                .iter()
                .flat_map(|r| r.steps.iter().cloned())
                .collect(),
            input: serde_json::to_value(input).unwrap_or_default(),
        };
        info!(
            operation = %record.operation,
            success = response.success,
            targets = resource_ids.len(),
            "Batch finished"
        );
        if let Err(e) = self.store.append_execution_record(&record).await {
            warn!(error = %e, "Failed to append execution record");
        }
    }
}

/// Start `name` unless the batch deadline has passed, in which case the
/// step is recorded as failed without running.
fn begin(recorder: &mut StepRecorder, name: &str, deadline: Instant, budget: Duration) -> bool {
    if let Err(e) = recorder.begin(name) {
        error!(step = name, error = %e, "Step bookkeeping rejected");
        return false;
    }
    if Instant::now() >= deadline {
        settle(recorder.fail(format!(
            "batch deadline of {}s exceeded before the step started",
            budget.as_secs()
        )));
        return false;
    }
    true
}

fn settle(result: Result<(), String>) {
    if let Err(e) = result {
        error!(error = %e, "Step bookkeeping rejected");
    }
}

fn failure_message(e: &EngineError) -> String {
    match e {
        EngineError::StepFailure { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

/// Last non-empty output line, bounded
fn summarize(output: &str) -> String {
    let line = output
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("ok");
    if line.chars().count() > 200 {
        let cut: String = line.chars().take(200).collect();
        format!("{}...", cut)
    } else {
        line.to_string()
    }
}
