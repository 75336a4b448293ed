//! Results of executing a job's pipeline

use crate::core::artifact::{ArtifactRef, Manifest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Outcome of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorResult {
    pub stage: String,
    pub success: bool,
    pub is_core: bool,
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,
    #[serde(default)]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl GeneratorResult {
    pub fn succeeded(
        stage: impl Into<String>,
        is_core: bool,
        artifacts: BTreeMap<String, ArtifactRef>,
        duration_ms: u64,
    ) -> Self {
        Self {
            stage: stage.into(),
            success: true,
            is_core,
            artifacts,
            error: None,
            duration_ms,
        }
    }

    pub fn failed(stage: impl Into<String>, is_core: bool, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            stage: stage.into(),
            success: false,
            is_core,
            artifacts: BTreeMap::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// How an execution attempt ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOutcome {
    Succeeded,
    Failed,
    Cancelled,
    TimedOut,
}

/// Everything one execution attempt produced
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineResult {
    /// True when every core stage succeeded
    pub success: bool,
    pub outcome: PipelineOutcome,
    pub manifest: Manifest,
    /// Stage results in execution order, including restored ones
    pub results: Vec<GeneratorResult>,
    /// Core stage that aborted the pipeline
    pub failed_core: Option<String>,
    /// Checkpointed stage this attempt resumed after
    pub resumed_from: Option<String>,
}

impl PipelineResult {
    pub fn result(&self, stage: &str) -> Option<&GeneratorResult> {
        self.results.iter().find(|r| r.stage == stage)
    }

    pub fn executed_stages(&self) -> Vec<&str> {
        self.results.iter().map(|r| r.stage.as_str()).collect()
    }

    pub fn failed_extended(&self) -> Vec<&GeneratorResult> {
        self.results
            .iter()
            .filter(|r| !r.success && !r.is_core)
            .collect()
    }

    /// Summary stored as the job's result on success
    pub fn summary(&self) -> Value {
        let failed: Vec<Value> = self
            .failed_extended()
            .iter()
            .map(|r| {
                serde_json::json!({
                    "stage": r.stage,
                    "error": r.error,
                })
            })
            .collect();

        serde_json::json!({
            "stages": self.executed_stages(),
            "artifactCount": self.manifest.len(),
            "failedExtended": failed,
            "resumedFrom": self.resumed_from,
        })
    }
}

/// Payload stored in every checkpoint
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageSnapshot {
    /// Every stage result up to and including the checkpointed stage
    pub results: Vec<GeneratorResult>,
    /// Opaque state emitted by stages, keyed by stage name
    #[serde(default)]
    pub stage_states: BTreeMap<String, Value>,
}
