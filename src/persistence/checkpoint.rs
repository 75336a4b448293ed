//! Checkpoints: durable "stage N completed" records
//!
//! A checkpoint is appended after every successful stage and before the
//! next stage starts. Checkpoints are never modified. Resuming picks a
//! checkpoint, verifies its snapshot, and continues with the stage after it.

use crate::core::error::{EngineError, Result};
use crate::core::job::{CheckpointId, JobId};
use crate::execution::result::StageSnapshot;
use crate::persistence::JobBackend;
use crate::registry::ExecutionPlan;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Versioned snapshot payload with an integrity digest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot version of the stage that wrote it
    pub schema_version: u32,
    pub payload: Value,
    /// Hex SHA-256 of the serialized payload
    pub digest: String,
}

impl Snapshot {
    pub fn new(schema_version: u32, payload: Value) -> Result<Self> {
        let digest = digest(&payload)?;
        Ok(Self {
            schema_version,
            payload,
            digest,
        })
    }

    pub fn encode<T: Serialize>(schema_version: u32, state: &T) -> Result<Self> {
        Self::new(schema_version, serde_json::to_value(state)?)
    }

    /// Whether the payload still matches its digest
    pub fn verify(&self) -> bool {
        digest(&self.payload).map_or(false, |d| d == self.digest)
    }

    pub fn decode<T: DeserializeOwned>(&self) -> std::result::Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

fn digest(payload: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(payload)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub job_id: JobId,
    pub stage: String,
    /// Position of `stage` in the registry's execution order
    pub stage_order: u32,
    pub snapshot: Snapshot,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(job_id: JobId, stage: impl Into<String>, stage_order: u32, snapshot: Snapshot) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            stage: stage.into(),
            stage_order,
            snapshot,
            created_at: Utc::now(),
        }
    }
}

/// Where a resumed run picks up
#[derive(Debug, Clone)]
pub struct ResumePoint {
    pub checkpoint: Checkpoint,
    /// Results and stage state recorded up to the checkpoint
    pub snapshot: StageSnapshot,
    /// First stage that will run; `None` when the checkpoint was the last stage
    pub next_stage: Option<String>,
}

impl ResumePoint {
    /// Stage order of the last completed stage
    pub fn completed_through(&self) -> u32 {
        self.checkpoint.stage_order
    }
}

pub struct CheckpointManager {
    backend: Arc<dyn JobBackend>,
}

impl CheckpointManager {
    pub fn new(backend: Arc<dyn JobBackend>) -> Self {
        Self { backend }
    }

    /// Durably record that `stage` completed
    ///
    /// Returns only after the backend has stored the checkpoint.
    pub async fn checkpoint(
        &self,
        job_id: JobId,
        stage: &str,
        stage_order: u32,
        snapshot: Snapshot,
    ) -> Result<Checkpoint> {
        if let Some(last) = self.latest(job_id).await? {
            if stage_order <= last.stage_order {
                return Err(EngineError::Validation(format!(
                    "checkpoint for stage '{}' (order {}) does not follow '{}' (order {})",
                    stage, stage_order, last.stage, last.stage_order
                )));
            }
        }

        let checkpoint = Checkpoint::new(job_id, stage, stage_order, snapshot);
        self.backend.append_checkpoint(&checkpoint).await?;
        crate::metrics::record_checkpoint();

        debug!(job_id = %job_id, stage, "Checkpoint {} written", checkpoint.id);
        Ok(checkpoint)
    }

    pub async fn list(&self, job_id: JobId) -> Result<Vec<Checkpoint>> {
        Ok(self.backend.list_checkpoints(job_id).await?)
    }

    pub async fn latest(&self, job_id: JobId) -> Result<Option<Checkpoint>> {
        Ok(self.backend.list_checkpoints(job_id).await?.pop())
    }

    /// A checkpoint that must belong to `job_id`
    pub async fn get(&self, job_id: JobId, checkpoint_id: CheckpointId) -> Result<Checkpoint> {
        match self.backend.load_checkpoint(checkpoint_id).await? {
            Some(checkpoint) if checkpoint.job_id == job_id => Ok(checkpoint),
            _ => Err(EngineError::CheckpointNotFound {
                job_id,
                checkpoint_id,
            }),
        }
    }

    /// Resume from an explicit checkpoint
    ///
    /// Only the job's latest checkpoint can be resumed from.
    pub async fn resume(
        &self,
        job_id: JobId,
        checkpoint_id: CheckpointId,
        plan: &ExecutionPlan,
    ) -> Result<ResumePoint> {
        let checkpoint = self.get(job_id, checkpoint_id).await?;
        self.ensure_latest(&checkpoint).await?;
        resume_point(checkpoint, plan)
    }

    /// Resume from the most recent checkpoint, if any
    pub async fn resume_latest(&self, job_id: JobId, plan: &ExecutionPlan) -> Result<Option<ResumePoint>> {
        match self.latest(job_id).await? {
            Some(checkpoint) => Ok(Some(resume_point(checkpoint, plan)?)),
            None => Ok(None),
        }
    }

    /// Resume from the highest checkpoint at or before `stage`
    ///
    /// Fails with `StaleCheckpoint` if a later stage has been checkpointed.
    pub async fn resume_at(&self, job_id: JobId, stage: &str, plan: &ExecutionPlan) -> Result<Option<ResumePoint>> {
        let limit = plan
            .get(stage)
            .ok_or_else(|| EngineError::Validation(format!("stage '{}' is not in the execution plan", stage)))?
            .sequence;

        let checkpoint = self
            .list(job_id)
            .await?
            .into_iter()
            .filter(|c| c.stage_order <= limit)
            .last();

        match checkpoint {
            Some(checkpoint) => {
                self.ensure_latest(&checkpoint).await?;
                Ok(Some(resume_point(checkpoint, plan)?))
            }
            None => Ok(None),
        }
    }

    /// Stages after `checkpoint` that were already checkpointed must not run again
    async fn ensure_latest(&self, checkpoint: &Checkpoint) -> Result<()> {
        match self.latest(checkpoint.job_id).await? {
            Some(latest) if latest.stage_order > checkpoint.stage_order => {
                warn!(
                    job_id = %checkpoint.job_id,
                    "Refusing to resume from '{}'; '{}' is already checkpointed",
                    checkpoint.stage,
                    latest.stage
                );
                Err(EngineError::StaleCheckpoint {
                    checkpoint_id: checkpoint.id,
                    stage: checkpoint.stage.clone(),
                    latest_stage: latest.stage,
                })
            }
            _ => Ok(()),
        }
    }
}

fn resume_point(checkpoint: Checkpoint, plan: &ExecutionPlan) -> Result<ResumePoint> {
    let checkpoint_id = checkpoint.id;
    let corrupt = move |reason: String| EngineError::CheckpointCorruption {
        checkpoint_id,
        reason,
    };

    if !checkpoint.snapshot.verify() {
        warn!(job_id = %checkpoint.job_id, stage = %checkpoint.stage, "Checkpoint digest mismatch");
        return Err(corrupt("snapshot digest does not match payload".to_string()));
    }

    let stage = plan.get(&checkpoint.stage).ok_or_else(|| {
        corrupt(format!(
            "stage '{}' is not part of the current execution plan",
            checkpoint.stage
        ))
    })?;

    let expected = stage.definition.snapshot_version;
    if checkpoint.snapshot.schema_version != expected {
        return Err(corrupt(format!(
            "snapshot version {} does not match stage version {}",
            checkpoint.snapshot.schema_version, expected
        )));
    }

    let snapshot: StageSnapshot = checkpoint
        .snapshot
        .decode()
        .map_err(|e| corrupt(format!("snapshot does not decode: {}", e)))?;

    let next_stage = plan
        .stages()
        .iter()
        .find(|s| s.sequence > checkpoint.stage_order)
        .map(|s| s.name().to_string());

    Ok(ResumePoint {
        checkpoint,
        snapshot,
        next_stage,
    })
}
