//! Job runner - bounded concurrency, cancellation and crash recovery
//!
//! Each job runs in its own task. Jobs beyond `max_concurrency`, or beyond
//! their tenant's `max_concurrency_per_tenant`, wait for a slot while still
//! `PENDING`. A job takes its tenant slot before a global one.

use crate::core::artifact::Manifest;
use crate::core::config::ResumePolicy;
use crate::core::context::FeatureFlags;
use crate::core::error::{EngineError, JobError, Result};
use crate::core::job::{CheckpointId, Job, JobId, JobType};
use crate::core::state::JobState;
use crate::execution::cancel::CancellationToken;
use crate::execution::executor::PipelineExecutor;
use crate::persistence::{CheckpointManager, JobStore, ResumePoint};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_concurrency: usize,
    pub max_concurrency_per_tenant: Option<usize>,
    /// Time a running job gets to reach a stage boundary after `cancel`
    pub cancel_grace: Duration,
    pub resume_policy: ResumePolicy,
    pub feature_flags: FeatureFlags,
}

impl Default for RunnerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            max_concurrency_per_tenant: None,
            cancel_grace: Duration::from_secs(30),
            resume_policy: ResumePolicy::Manual,
            feature_flags: FeatureFlags::new(),
        }
    }
}

/// Outcome of a job as seen by a caller
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobReport {
    pub job_id: JobId,
    pub state: JobState,
    pub progress: f64,
    pub stage: Option<String>,
    pub result: Option<Value>,
    pub manifest: Option<Manifest>,
    pub error: Option<JobError>,
}

impl From<Job> for JobReport {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            state: job.state,
            progress: job.progress,
            stage: job.stage,
            result: job.result,
            manifest: job.manifest,
            error: job.error,
        }
    }
}

/// Incomplete jobs found by `recover`
#[derive(Debug, Default)]
pub struct RecoveryReport {
    pub incomplete: Vec<Job>,
    pub resumed: Vec<JobId>,
    pub failed: Vec<(JobId, String)>,
}

struct ActiveJob {
    token: CancellationToken,
    abort: AbortHandle,
    done: watch::Receiver<bool>,
}

type ActiveMap = Arc<Mutex<HashMap<JobId, ActiveJob>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Removes the job from the active table however its task ends
struct Finished {
    job_id: JobId,
    active: ActiveMap,
    done: watch::Sender<bool>,
}

impl Drop for Finished {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.job_id);
        self.done.send_replace(true);
    }
}

pub struct JobRunner {
    executor: Arc<PipelineExecutor>,
    store: Arc<JobStore>,
    checkpoints: Arc<CheckpointManager>,
    slots: Arc<Semaphore>,
    tenant_slots: Mutex<HashMap<String, Arc<Semaphore>>>,
    active: ActiveMap,
    settings: RunnerSettings,
}

impl JobRunner {
    pub fn new(
        executor: Arc<PipelineExecutor>,
        store: Arc<JobStore>,
        checkpoints: Arc<CheckpointManager>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            executor,
            store,
            checkpoints,
            slots: Arc::new(Semaphore::new(settings.max_concurrency.max(1))),
            tenant_slots: Mutex::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            settings,
        }
    }

    pub fn settings(&self) -> &RunnerSettings {
        &self.settings
    }

    pub async fn create(&self, job_type: JobType, tenant_id: &str, params: Value) -> Result<Job> {
        self.store.create(job_type, tenant_id, params).await
    }

    /// Queue a `PENDING` job for execution
    pub async fn start(&self, job_id: JobId) -> Result<()> {
        let job = self.store.get(job_id).await?;
        if job.state != JobState::Pending {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Running,
            });
        }
        self.spawn(&job, None)
    }

    /// Create and start in one call
    pub async fn submit(&self, job_type: JobType, tenant_id: &str, params: Value) -> Result<Job> {
        let job = self.create(job_type, tenant_id, params).await?;
        self.start(job.id).await?;
        Ok(job)
    }

    pub async fn submit_with_max_runtime(
        &self,
        job_type: JobType,
        tenant_id: &str,
        params: Value,
        max_runtime: Duration,
    ) -> Result<Job> {
        let job = self
            .store
            .create_with_max_runtime(job_type, tenant_id, params, max_runtime)
            .await?;
        self.start(job.id).await?;
        Ok(job)
    }

    pub async fn status(&self, job_id: JobId) -> Result<Job> {
        self.store.get(job_id).await
    }

    pub async fn result(&self, job_id: JobId) -> Result<JobReport> {
        Ok(self.store.get(job_id).await?.into())
    }

    /// Jobs of `tenant_id` currently holding a tenant slot
    pub fn running_for_tenant(&self, tenant_id: &str) -> usize {
        match (self.settings.max_concurrency_per_tenant, lock(&self.tenant_slots).get(tenant_id)) {
            (Some(limit), Some(slots)) => limit.max(1) - slots.available_permits(),
            _ => 0,
        }
    }

    fn tenant_slots(&self, tenant_id: &str) -> Option<Arc<Semaphore>> {
        let limit = self.settings.max_concurrency_per_tenant?;
        let mut slots = lock(&self.tenant_slots);
        let semaphore = slots
            .entry(tenant_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(limit.max(1))));
        Some(semaphore.clone())
    }

    pub fn is_active(&self, job_id: JobId) -> bool {
        lock(&self.active).contains_key(&job_id)
    }

    pub fn active_jobs(&self) -> Vec<JobId> {
        lock(&self.active).keys().copied().collect()
    }

    /// Wait for the job's task to finish, then return the stored job
    pub async fn wait(&self, job_id: JobId) -> Result<Job> {
        let done = lock(&self.active).get(&job_id).map(|a| a.done.clone());
        if let Some(mut done) = done {
            // Err only means the task is gone, which is what we wait for
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.store.get(job_id).await
    }

    /// Request cancellation
    ///
    /// Queued and inactive jobs are cancelled immediately. A running job is
    /// cancelled at its next stage boundary, or forcibly once the grace
    /// period runs out.
    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        let job = self.store.get(job_id).await?;
        if job.is_terminal() {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Cancelled,
            });
        }

        let entry = lock(&self.active)
            .get(&job_id)
            .map(|a| (a.token.clone(), a.abort.clone(), a.done.clone()));

        let Some((token, abort, done)) = entry else {
            info!(job_id = %job_id, "Cancelling inactive {} job", job.state);
            return self.store.cancel(job_id).await;
        };

        token.cancel();
        if job.state == JobState::Pending {
            return match self.store.cancel(job_id).await {
                // The task may have observed the token first
                Err(EngineError::InvalidTransition { .. }) => self.store.get(job_id).await,
                other => other,
            };
        }

        info!(
            job_id = %job_id,
            stage = job.stage.as_deref().unwrap_or("-"),
            "Cancellation requested; grace period {}s",
            self.settings.cancel_grace.as_secs()
        );
        tokio::spawn(enforce_grace(
            job_id,
            self.store.clone(),
            abort,
            done,
            self.settings.cancel_grace,
        ));
        Ok(job)
    }

    /// Re-run a non-terminal job from a checkpoint
    ///
    /// Without an explicit checkpoint the latest one is used; a job without
    /// checkpoints starts from its first stage.
    pub async fn resume(&self, job_id: JobId, checkpoint_id: Option<CheckpointId>) -> Result<Option<ResumePoint>> {
        let job = self.store.get(job_id).await?;
        if job.is_terminal() {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Running,
            });
        }
        if self.is_active(job_id) {
            return Err(EngineError::Validation(format!("job {} is already running", job_id)));
        }

        let plan = self.executor.registry().plan(&self.settings.feature_flags);
        let point = match checkpoint_id {
            Some(id) => Some(self.checkpoints.resume(job_id, id, &plan).await?),
            None => self.checkpoints.resume_latest(job_id, &plan).await?,
        };

        match &point {
            Some(p) => info!(job_id = %job_id, "Resuming from checkpoint {} ({})", p.checkpoint.id, p.checkpoint.stage),
            None => info!(job_id = %job_id, "No checkpoint; restarting from the first stage"),
        }

        self.spawn(&job, point.clone())?;
        Ok(point)
    }

    /// Find jobs left incomplete by a previous process
    ///
    /// Under `ResumePolicy::Automatic` each one is resumed from its latest
    /// checkpoint; under `Manual` they are only reported.
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for job in self.store.incomplete().await? {
            if self.is_active(job.id) {
                continue;
            }
            report.incomplete.push(job);
        }

        if report.incomplete.is_empty() {
            debug!("No incomplete jobs to recover");
            return Ok(report);
        }

        if self.settings.resume_policy == ResumePolicy::Manual {
            for job in &report.incomplete {
                warn!(
                    job_id = %job.id,
                    "Incomplete {} job left in {} (stage: {}); resume manually",
                    job.job_type,
                    job.state,
                    job.stage.as_deref().unwrap_or("-")
                );
            }
            return Ok(report);
        }

        let ids: Vec<JobId> = report.incomplete.iter().map(|j| j.id).collect();
        for job_id in ids {
            match self.resume(job_id, None).await {
                Ok(_) => report.resumed.push(job_id),
                Err(e) => {
                    error!(job_id = %job_id, "Could not resume job: {}", e);
                    report.failed.push((job_id, e.to_string()));
                }
            }
        }

        info!(
            "Recovered {} of {} incomplete job(s)",
            report.resumed.len(),
            report.incomplete.len()
        );
        Ok(report)
    }

    fn spawn(&self, job: &Job, resume: Option<ResumePoint>) -> Result<()> {
        let job_id = job.id;
        let tenant_slots = self.tenant_slots(&job.tenant_id);
        let mut active = lock(&self.active);
        if active.contains_key(&job_id) {
            return Err(EngineError::Validation(format!("job {} is already running", job_id)));
        }

        let token = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let finished = Finished {
            job_id,
            active: self.active.clone(),
            done: done_tx,
        };

        let executor = self.executor.clone();
        let slots = self.slots.clone();
        let flags = self.settings.feature_flags.clone();
        let job_token = token.clone();

        let handle = tokio::spawn(async move {
            let _finished = finished;
            let _tenant_slot = match tenant_slots {
                Some(tenant_slots) => match tenant_slots.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(_) => {
                        error!(job_id = %job_id, "Runner is shut down; job not executed");
                        return;
                    }
                },
                None => None,
            };
            let _slot = match slots.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    error!(job_id = %job_id, "Runner is shut down; job not executed");
                    return;
                }
            };

            if job_token.is_cancelled() && resume.is_none() {
                debug!(job_id = %job_id, "Job cancelled while queued");
                return;
            }

            match executor.execute(job_id, &flags, resume, &job_token).await {
                Ok(result) => debug!(job_id = %job_id, "Job finished: {:?}", result.outcome),
                Err(e) => error!(job_id = %job_id, "Job execution failed: {}", e),
            }
        });

        active.insert(
            job_id,
            ActiveJob {
                token,
                abort: handle.abort_handle(),
                done: done_rx,
            },
        );
        Ok(())
    }
}

/// Force `CANCELLED` if the job task has not stopped within `grace`
async fn enforce_grace(
    job_id: JobId,
    store: Arc<JobStore>,
    abort: AbortHandle,
    mut done: watch::Receiver<bool>,
    grace: Duration,
) {
    if tokio::time::timeout(grace, done.wait_for(|finished| *finished))
        .await
        .is_ok()
    {
        return;
    }

    warn!(
        job_id = %job_id,
        "Job did not stop within {}s of cancellation; aborting",
        grace.as_secs()
    );

    // Record the cancellation before the task goes away so waiters see it
    match store.cancel(job_id).await {
        Ok(_) => info!(job_id = %job_id, "Job forcibly cancelled"),
        Err(EngineError::InvalidTransition { from, .. }) => {
            debug!(job_id = %job_id, "Job already {} when grace period ended", from);
        }
        Err(e) => error!(job_id = %job_id, "Could not record forced cancellation: {}", e),
    }
    abort.abort();
}
