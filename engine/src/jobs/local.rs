//! In-process job runner

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::errors::EngineError;
use crate::jobs::queue::{JobFuture, JobQueue, JobRecord, JobStatus};
use crate::storage::settings::JobSettings;
use crate::utils::generate_uuid;

/// Job runner options
#[derive(Debug, Clone)]
pub struct Options {
    pub enabled: bool,

    /// Jobs running at once
    pub concurrency: usize,

    /// Records kept; finished jobs are evicted oldest first
    pub history_limit: usize,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            enabled: true,
            concurrency: 4,
            history_limit: 200,
        }
    }
}

impl From<&JobSettings> for Options {
    fn from(settings: &JobSettings) -> Self {
        Self {
            enabled: settings.enabled,
            concurrency: settings.concurrency,
            history_limit: settings.history_limit,
        }
    }
}

struct Shared {
    records: RwLock<VecDeque<JobRecord>>,
    history_limit: usize,
}

impl Shared {
    async fn update(&self, id: &str, apply: impl FnOnce(&mut JobRecord)) {
        let mut records = self.records.write().await;
        if let Some(record) = records.iter_mut().find(|r| r.id == id) {
            apply(record);
        }
    }

    async fn insert(&self, record: JobRecord) {
        let mut records = self.records.write().await;
        records.push_back(record);
        while records.len() > self.history_limit {
            match records.iter().position(|r| r.status.is_finished()) {
                Some(index) => {
                    records.remove(index);
                }
                None => break,
            }
        }
    }
}

/// Runs jobs as tokio tasks, at most `concurrency` at a time
pub struct LocalJobQueue {
    shared: Arc<Shared>,
    permits: Arc<Semaphore>,
    enabled: bool,
    accepting: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl LocalJobQueue {
    pub fn new(options: &Options) -> Self {
        Self {
            shared: Arc::new(Shared {
                records: RwLock::new(VecDeque::new()),
                history_limit: options.history_limit.max(1),
            }),
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
            enabled: options.enabled,
            accepting: AtomicBool::new(true),
            tasks: Mutex::new(Vec::new()),
        }
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

async fn run_job(shared: Arc<Shared>, permits: Arc<Semaphore>, id: String, name: String, job: JobFuture) {
    let _permit = match permits.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => {
            warn!(job = %id, "Job dropped before start, runner is stopping");
            shared
                .update(&id, |record| {
                    record.status = JobStatus::Failed;
                    record.finished_at = Some(Utc::now());
                    record.error = Some("job runner stopped before the job started".to_string());
                })
                .await;
            return;
        }
    };

    shared
        .update(&id, |record| {
            record.status = JobStatus::Running;
            record.started_at = Some(Utc::now());
        })
        .await;
    info!(job = %id, name = %name, "Job started");

    // a panicking job only fails its own record
    let outcome = match tokio::spawn(job).await {
        Ok(result) => result,
        Err(e) => Err(EngineError::JobError(format!("job aborted: {}", e))),
    };

    match &outcome {
        Ok(_) => info!(job = %id, name = %name, "Job succeeded"),
        Err(e) => error!(job = %id, name = %name, error = %e, "Job failed"),
    }

    shared
        .update(&id, move |record| {
            record.finished_at = Some(Utc::now());
            match outcome {
                Ok(output) => {
                    record.status = JobStatus::Succeeded;
                    record.output = Some(output);
                }
                Err(e) => {
                    record.status = JobStatus::Failed;
                    record.error = Some(e.to_string());
                }
            }
        })
        .await;
}

#[async_trait]
impl JobQueue for LocalJobQueue {
    async fn submit(&self, name: &str, job: JobFuture) -> Result<String, EngineError> {
        if !self.enabled {
            return Err(EngineError::ValidationError("background jobs are disabled".to_string()));
        }
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(EngineError::JobError("job runner is shutting down".to_string()));
        }

        let id = generate_uuid();
        self.shared.insert(JobRecord::queued(id.clone(), name)).await;

        let handle = tokio::spawn(run_job(
            self.shared.clone(),
            self.permits.clone(),
            id.clone(),
            name.to_string(),
            job,
        ));

        let mut tasks = self.tasks();
        tasks.retain(|task| !task.is_finished());
        tasks.push(handle);
        Ok(id)
    }

    async fn poll(&self, job_id: &str) -> Result<JobRecord, EngineError> {
        self.shared
            .records
            .read()
            .await
            .iter()
            .find(|record| record.id == job_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("job {}", job_id)))
    }

    async fn history(&self) -> Vec<JobRecord> {
        self.shared.records.read().await.iter().rev().cloned().collect()
    }

    async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.permits.close();

        let tasks: Vec<_> = self.tasks().drain(..).collect();
        info!("Waiting for {} background job(s)...", tasks.len());
        for task in tasks {
            if let Err(e) = task.await {
                error!("Job task failed: {}", e);
            }
        }
    }
}
