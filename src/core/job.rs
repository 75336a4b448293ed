//! Job domain model

use crate::core::artifact::Manifest;
use crate::core::error::{EngineError, JobError, Result};
use crate::core::state::JobState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

pub type JobId = Uuid;
pub type CheckpointId = Uuid;

/// Kind of work a job performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Ingest,
    Profile,
    Quality,
    Kpi,
    Analyze,
    Preset,
}

impl JobType {
    pub const ALL: [JobType; 6] = [
        JobType::Ingest,
        JobType::Profile,
        JobType::Quality,
        JobType::Kpi,
        JobType::Analyze,
        JobType::Preset,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::Ingest => "ingest",
            JobType::Profile => "profile",
            JobType::Quality => "quality",
            JobType::Kpi => "kpi",
            JobType::Analyze => "analyze",
            JobType::Preset => "preset",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        JobType::ALL
            .into_iter()
            .find(|job_type| job_type.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::Validation(format!("unknown job type '{}'", s)))
    }
}

/// One tracked execution of a multi-stage pipeline
///
/// Owned by the job store; every state change goes through a validated
/// transition there.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: String,
    pub job_type: JobType,
    pub state: JobState,

    /// Fraction of stages finished (0.0 to 1.0)
    pub progress: f64,

    /// Name of the stage most recently reported through `advance`
    pub stage: Option<String>,

    /// Execution-order position of `stage`; never moves backwards
    #[serde(default)]
    pub stage_order: Option<u32>,

    pub params: Value,

    /// Set only when the job succeeds
    pub result: Option<Value>,

    pub error: Option<JobError>,

    /// Artifacts produced so far; kept on failure and timeout too
    pub manifest: Option<Manifest>,

    pub max_runtime_secs: u64,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,

    /// Checkpoint ids in stage execution order
    #[serde(default)]
    pub checkpoints: Vec<CheckpointId>,
}

impl Job {
    pub fn new(job_type: JobType, tenant_id: impl Into<String>, params: Value, max_runtime: Duration) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            job_type,
            state: JobState::Pending,
            progress: 0.0,
            stage: None,
            stage_order: None,
            params,
            result: None,
            error: None,
            manifest: None,
            max_runtime_secs: max_runtime.as_secs(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            checkpoints: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }

    /// Runtime budget left, measured from the first start
    ///
    /// A job that has not started yet has its whole budget.
    pub fn remaining_runtime(&self) -> Duration {
        match self.elapsed().and_then(|elapsed| elapsed.to_std().ok()) {
            Some(elapsed) => self.max_runtime().saturating_sub(elapsed),
            None => self.max_runtime(),
        }
    }

    /// Wall-clock time between start and finish (or now, while running)
    pub fn elapsed(&self) -> Option<chrono::Duration> {
        let started = self.started_at?;
        let end = self.finished_at.unwrap_or_else(Utc::now);
        Some(end.signed_duration_since(started))
    }
}
