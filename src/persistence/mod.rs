//! Persistence layer for jobs and checkpoints

pub mod checkpoint;
pub mod job_store;
#[cfg(feature = "sqlite")]
pub mod store;

pub use checkpoint::{Checkpoint, CheckpointManager, ResumePoint, Snapshot};
pub use job_store::JobStore;
#[cfg(feature = "sqlite")]
pub use store::SqliteBackend;

use crate::core::job::{CheckpointId, Job, JobId, JobType};
use crate::core::state::JobState;
use anyhow::{bail, Result};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Which jobs `list_jobs` returns
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub tenant_id: Option<String>,
    /// Empty means every state
    pub states: Vec<JobState>,
    pub job_type: Option<JobType>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    pub fn state(mut self, state: JobState) -> Self {
        self.states.push(state);
        self
    }

    pub fn job_type(mut self, job_type: JobType) -> Self {
        self.job_type = Some(job_type);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.tenant_id.as_deref().map_or(true, |t| t == job.tenant_id)
            && (self.states.is_empty() || self.states.contains(&job.state))
            && self.job_type.map_or(true, |t| t == job.job_type)
    }
}

/// Trait for persistence backends
///
/// `Job.checkpoints` is never trusted on write; backends derive it from the
/// stored checkpoints when a job is loaded.
#[async_trait::async_trait]
pub trait JobBackend: Send + Sync {
    /// Insert a new job; fails if the id already exists
    async fn insert_job(&self, job: &Job) -> Result<()>;

    /// Overwrite an existing job
    async fn save_job(&self, job: &Job) -> Result<()>;

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>>;

    /// Matching jobs, most recently created first
    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Checkpoints of a job in stage order
    async fn list_checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>>;

    async fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<Checkpoint>>;
}

/// In-memory persistence (for testing or ephemeral use)
#[derive(Default)]
pub struct InMemoryBackend {
    jobs: RwLock<HashMap<JobId, Job>>,
    /// Insertion order of job ids
    order: RwLock<Vec<JobId>>,
    checkpoints: RwLock<Vec<Checkpoint>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    async fn with_checkpoint_ids(&self, mut job: Job) -> Job {
        job.checkpoints = self
            .list_checkpoints(job.id)
            .await
            .map(|checkpoints| checkpoints.iter().map(|c| c.id).collect())
            .unwrap_or_default();
        job
    }
}

#[async_trait::async_trait]
impl JobBackend for InMemoryBackend {
    async fn insert_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        if jobs.contains_key(&job.id) {
            bail!("Job {} already exists", job.id);
        }
        jobs.insert(job.id, job.clone());
        self.order.write().await.push(job.id);
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> Result<()> {
        let mut jobs = self.jobs.write().await;
        match jobs.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => bail!("Job {} does not exist", job.id),
        }
    }

    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>> {
        let job = self.jobs.read().await.get(&job_id).cloned();
        match job {
            Some(job) => Ok(Some(self.with_checkpoint_ids(job).await)),
            None => Ok(None),
        }
    }

    async fn list_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        let matching: Vec<Job> = {
            let jobs = self.jobs.read().await;
            let order = self.order.read().await;
            order
                .iter()
                .rev()
                .filter_map(|id| jobs.get(id))
                .filter(|job| filter.matches(job))
                .take(filter.limit.unwrap_or(usize::MAX))
                .cloned()
                .collect()
        };

        let mut result = Vec::with_capacity(matching.len());
        for job in matching {
            result.push(self.with_checkpoint_ids(job).await);
        }
        Ok(result)
    }

    async fn append_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let mut checkpoints = self.checkpoints.write().await;
        if checkpoints
            .iter()
            .any(|c| c.job_id == checkpoint.job_id && c.stage_order == checkpoint.stage_order)
        {
            bail!(
                "Job {} already has a checkpoint at stage order {}",
                checkpoint.job_id,
                checkpoint.stage_order
            );
        }
        checkpoints.push(checkpoint.clone());
        Ok(())
    }

    async fn list_checkpoints(&self, job_id: JobId) -> Result<Vec<Checkpoint>> {
        let mut result: Vec<Checkpoint> = self
            .checkpoints
            .read()
            .await
            .iter()
            .filter(|c| c.job_id == job_id)
            .cloned()
            .collect();
        result.sort_by_key(|c| c.stage_order);
        Ok(result)
    }

    async fn load_checkpoint(&self, checkpoint_id: CheckpointId) -> Result<Option<Checkpoint>> {
        Ok(self
            .checkpoints
            .read()
            .await
            .iter()
            .find(|c| c.id == checkpoint_id)
            .cloned())
    }
}
