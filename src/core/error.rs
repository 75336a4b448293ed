//! Error taxonomy for the job engine

use crate::core::job::JobId;
use crate::core::state::JobState;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised by the job store, checkpoint manager, registry and executor
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },

    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("core generator '{stage}' failed: {message}")]
    CoreGeneratorFailure { stage: String, message: String },

    #[error("extended generator '{stage}' failed: {message}")]
    ExtendedGeneratorFailure { stage: String, message: String },

    #[error("write lock not acquired after {}s", .waited.as_secs_f64())]
    WriteLockTimeout { waited: Duration },

    #[error("checkpoint {checkpoint_id} not found for job {job_id}")]
    CheckpointNotFound { job_id: JobId, checkpoint_id: Uuid },

    #[error("checkpoint {checkpoint_id} for stage '{stage}' is superseded by a later checkpoint for '{latest_stage}'")]
    StaleCheckpoint {
        checkpoint_id: Uuid,
        stage: String,
        latest_stage: String,
    },

    #[error("checkpoint {checkpoint_id} is corrupt: {reason}")]
    CheckpointCorruption { checkpoint_id: Uuid, reason: String },

    #[error("job {job_id} exceeded its maximum runtime of {}s", .max_runtime.as_secs())]
    JobTimeout { job_id: JobId, max_runtime: Duration },

    #[error("cancellation requested for job {0}")]
    CancellationRequested(JobId),

    #[error("registry error: {0}")]
    Registry(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    /// Classify the error for persistence on the job record
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::Config(_) | EngineError::StaleCheckpoint { .. } => {
                ErrorKind::Validation
            }
            EngineError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            EngineError::JobNotFound(_) => ErrorKind::NotFound,
            EngineError::CoreGeneratorFailure { .. } => ErrorKind::CoreGeneratorFailure,
            EngineError::ExtendedGeneratorFailure { .. } => ErrorKind::ExtendedGeneratorFailure,
            EngineError::WriteLockTimeout { .. } => ErrorKind::WriteLockTimeout,
            EngineError::CheckpointNotFound { .. } => ErrorKind::CheckpointNotFound,
            EngineError::CheckpointCorruption { .. } => ErrorKind::CheckpointCorruption,
            EngineError::JobTimeout { .. } => ErrorKind::JobTimeout,
            EngineError::CancellationRequested(_) => ErrorKind::CancellationRequested,
            EngineError::Registry(_) | EngineError::Storage(_) | EngineError::Serialization(_) => {
                ErrorKind::Internal
            }
        }
    }
}

/// Serializable error category stored in `Job.error`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    InvalidTransition,
    NotFound,
    CoreGeneratorFailure,
    ExtendedGeneratorFailure,
    WriteLockTimeout,
    CheckpointNotFound,
    CheckpointCorruption,
    JobTimeout,
    CancellationRequested,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::InvalidTransition => "invalid_transition",
            ErrorKind::NotFound => "not_found",
            ErrorKind::CoreGeneratorFailure => "core_generator_failure",
            ErrorKind::ExtendedGeneratorFailure => "extended_generator_failure",
            ErrorKind::WriteLockTimeout => "write_lock_timeout",
            ErrorKind::CheckpointNotFound => "checkpoint_not_found",
            ErrorKind::CheckpointCorruption => "checkpoint_corruption",
            ErrorKind::JobTimeout => "job_timeout",
            ErrorKind::CancellationRequested => "cancellation_requested",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a failed, cancelled or timed-out job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Stage that was executing (or about to execute) when the job stopped
    #[serde(default)]
    pub stage: Option<String>,
}

impl JobError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stage: None,
        }
    }

    pub fn with_stage(mut self, stage: impl Into<String>) -> Self {
        self.stage = Some(stage.into());
        self
    }

    /// Build a job error from an engine error, naming the stage when known
    pub fn from_engine(error: &EngineError, stage: Option<&str>) -> Self {
        let stage = match error {
            EngineError::CoreGeneratorFailure { stage, .. }
            | EngineError::ExtendedGeneratorFailure { stage, .. } => Some(stage.clone()),
            _ => stage.map(str::to_string),
        };
        Self {
            kind: error.kind(),
            message: error.to_string(),
            stage,
        }
    }
}

impl fmt::Display for JobError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            Some(stage) => write!(f, "[{}] {}: {}", self.kind, stage, self.message),
            None => write!(f, "[{}] {}", self.kind, self.message),
        }
    }
}
