//! Job store: the only writer of job records
//!
//! Every state change is checked against the transition table, persisted,
//! counted, and published as an event. Transitions are serialized so two
//! racing terminal transitions (say `cancel` and `complete`) cannot both
//! apply; the loser gets `InvalidTransition`.

use crate::core::artifact::Manifest;
use crate::core::error::{EngineError, ErrorKind, JobError, Result};
use crate::core::job::{Job, JobId, JobType};
use crate::core::params::validate_params;
use crate::core::state::{ensure_transition, JobState};
use crate::events::{EventPublisher, JobEvent};
use crate::persistence::{JobBackend, JobFilter};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub struct JobStore {
    backend: Arc<dyn JobBackend>,
    events: EventPublisher,
    default_max_runtime: Duration,
    transitions: Mutex<()>,
}

impl JobStore {
    pub fn new(backend: Arc<dyn JobBackend>, events: EventPublisher, default_max_runtime: Duration) -> Self {
        Self {
            backend,
            events,
            default_max_runtime,
            transitions: Mutex::new(()),
        }
    }

    pub fn backend(&self) -> &Arc<dyn JobBackend> {
        &self.backend
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    /// Validate and insert a new `PENDING` job
    pub async fn create(&self, job_type: JobType, tenant_id: &str, params: Value) -> Result<Job> {
        self.create_with_max_runtime(job_type, tenant_id, params, self.default_max_runtime)
            .await
    }

    pub async fn create_with_max_runtime(
        &self,
        job_type: JobType,
        tenant_id: &str,
        params: Value,
        max_runtime: Duration,
    ) -> Result<Job> {
        if tenant_id.trim().is_empty() {
            return Err(EngineError::Validation("tenant id must not be empty".to_string()));
        }
        if max_runtime.as_secs() == 0 {
            return Err(EngineError::Validation("max runtime must be at least one second".to_string()));
        }
        validate_params(job_type, &params)?;

        let job = Job::new(job_type, tenant_id, params, max_runtime);
        self.backend.insert_job(&job).await?;

        crate::metrics::record_transition(job.job_type, JobState::Pending);
        info!(job_id = %job.id, tenant_id, "Created {} job", job_type);
        self.events.publish(JobEvent::created(&job));
        Ok(job)
    }

    pub async fn find(&self, job_id: JobId) -> Result<Option<Job>> {
        Ok(self.backend.load_job(job_id).await?)
    }

    pub async fn get(&self, job_id: JobId) -> Result<Job> {
        self.find(job_id)
            .await?
            .ok_or(EngineError::JobNotFound(job_id))
    }

    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        Ok(self.backend.list_jobs(filter).await?)
    }

    /// Jobs that never reached a terminal state
    pub async fn incomplete(&self) -> Result<Vec<Job>> {
        let filter = JobFilter::new()
            .state(JobState::Pending)
            .state(JobState::Running);
        self.list(&filter).await
    }

    /// `PENDING → RUNNING`
    pub async fn start(&self, job_id: JobId) -> Result<Job> {
        self.transition(job_id, JobState::Running, |job| {
            job.started_at = Some(Utc::now());
        })
        .await
    }

    /// Record the stage now executing and overall progress
    ///
    /// Only valid while running. Neither progress nor stage order moves
    /// backwards: a lower value is logged and the stored one kept.
    pub async fn advance(&self, job_id: JobId, stage: &str, stage_order: u32, progress: f64) -> Result<Job> {
        let _guard = self.transitions.lock().await;
        let mut job = self.get(job_id).await?;

        if job.state != JobState::Running {
            return Err(EngineError::InvalidTransition {
                job_id,
                from: job.state,
                to: JobState::Running,
            });
        }

        let progress = progress.clamp(0.0, 1.0);
        if progress < job.progress {
            warn!(
                job_id = %job_id,
                stage,
                "Progress regressed from {:.2} to {:.2}; keeping {:.2}",
                job.progress,
                progress,
                job.progress
            );
        } else {
            job.progress = progress;
        }

        match (job.stage.as_deref(), job.stage_order) {
            (Some(current), Some(order)) if stage_order < order => {
                warn!(
                    job_id = %job_id,
                    stage,
                    "Stage order regressed from '{}' ({}) to {}; keeping '{}'",
                    current,
                    order,
                    stage_order,
                    current
                );
            }
            _ => {
                job.stage = Some(stage.to_string());
                job.stage_order = Some(stage_order);
            }
        }

        self.backend.save_job(&job).await?;
        debug!(job_id = %job_id, stage, "Progress {:.2}", job.progress);
        Ok(job)
    }

    /// `RUNNING → SUCCEEDED`
    pub async fn complete(&self, job_id: JobId, result: Value, manifest: Manifest) -> Result<Job> {
        self.transition(job_id, JobState::Succeeded, |job| {
            job.result = Some(result);
            job.manifest = Some(manifest);
            job.progress = 1.0;
        })
        .await
    }

    /// `RUNNING → FAILED`, keeping whatever artifacts were produced
    pub async fn fail(&self, job_id: JobId, error: JobError, manifest: Option<Manifest>) -> Result<Job> {
        self.transition(job_id, JobState::Failed, |job| {
            job.error = Some(error);
            if manifest.is_some() {
                job.manifest = manifest;
            }
        })
        .await
    }

    /// `{PENDING, RUNNING} → CANCELLED`
    pub async fn cancel(&self, job_id: JobId) -> Result<Job> {
        self.cancel_with(job_id, None).await
    }

    /// Cancel, attaching the artifacts produced before the stop
    pub async fn cancel_with(&self, job_id: JobId, manifest: Option<Manifest>) -> Result<Job> {
        self.transition(job_id, JobState::Cancelled, |job| {
            let mut error = JobError::new(ErrorKind::CancellationRequested, "job was cancelled");
            if let Some(stage) = &job.stage {
                error = error.with_stage(stage.clone());
            }
            job.error = Some(error);
            if manifest.is_some() {
                job.manifest = manifest;
            }
        })
        .await
    }

    /// `RUNNING → TIMEOUT`, keeping whatever artifacts were produced
    pub async fn timeout(&self, job_id: JobId, manifest: Option<Manifest>) -> Result<Job> {
        self.transition(job_id, JobState::Timeout, |job| {
            let limit = EngineError::JobTimeout {
                job_id: job.id,
                max_runtime: job.max_runtime(),
            };
            job.error = Some(JobError::from_engine(&limit, job.stage.as_deref()));
            if manifest.is_some() {
                job.manifest = manifest;
            }
        })
        .await
    }

    async fn transition<F>(&self, job_id: JobId, to: JobState, apply: F) -> Result<Job>
    where
        F: FnOnce(&mut Job),
    {
        let _guard = self.transitions.lock().await;
        let mut job = self.get(job_id).await?;
        let from = job.state;

        if let Err(e) = ensure_transition(job_id, from, to) {
            warn!(job_id = %job_id, "Rejected transition {} -> {}", from, to);
            return Err(e);
        }

        job.state = to;
        apply(&mut job);
        if to.is_terminal() {
            job.finished_at = Some(Utc::now());
        }

        self.backend.save_job(&job).await?;

        crate::metrics::record_transition(job.job_type, to);
        if to.is_terminal() {
            crate::metrics::record_job_finished(&job);
        }

        match &job.error {
            Some(error) if to.is_terminal() => info!(job_id = %job_id, "Job {} -> {}: {}", from, to, error),
            _ => info!(job_id = %job_id, "Job {} -> {}", from, to),
        }
        self.events.publish(JobEvent::state_changed(&job, from));
        Ok(job)
    }
}
