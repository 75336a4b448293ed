//! Generator context - what a stage sees when it runs

use crate::core::job::{Job, JobId, JobType};
use crate::core::params::tables_from_params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Resolved feature-flag map
///
/// Flags that were never set are treated as disabled.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FeatureFlags(BTreeMap<String, bool>);

impl FeatureFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, enabled: bool) -> Self {
        self.set(key, enabled);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, enabled: bool) {
        self.0.insert(key.into(), enabled);
    }

    pub fn is_enabled(&self, key: &str) -> bool {
        self.0.get(key).copied().unwrap_or(false)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(key, enabled)| (key.as_str(), *enabled))
    }
}

impl From<BTreeMap<String, bool>> for FeatureFlags {
    fn from(flags: BTreeMap<String, bool>) -> Self {
        Self(flags)
    }
}

impl FromIterator<(String, bool)> for FeatureFlags {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Input handed to a generator for one stage of one job
///
/// Serialized as JSON for subprocess generators, so every field is plain data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorContext {
    pub job_id: JobId,
    pub tenant_id: String,
    pub job_type: JobType,

    /// Name of the stage being executed
    pub stage: String,

    /// Directory this stage should write artifacts into
    pub artifact_root: PathBuf,

    /// Tables named in the job parameters
    pub tables: Vec<String>,

    /// The job's own parameters
    pub params: Value,

    /// Parameters declared on the generator definition
    pub stage_params: Value,

    pub feature_flags: FeatureFlags,

    /// Opaque state emitted by earlier stages, keyed by stage name
    #[serde(default)]
    pub upstream: BTreeMap<String, Value>,
}

impl GeneratorContext {
    /// Build the context for `stage` of `job`
    pub fn for_job(job: &Job, stage: &str, artifact_root: &Path, feature_flags: &FeatureFlags) -> Self {
        Self {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            job_type: job.job_type,
            stage: stage.to_string(),
            artifact_root: artifact_dir(artifact_root, &job.tenant_id, job.id),
            tables: tables_from_params(&job.params),
            params: job.params.clone(),
            stage_params: Value::Null,
            feature_flags: feature_flags.clone(),
            upstream: BTreeMap::new(),
        }
    }

    pub fn with_stage_params(mut self, stage_params: Value) -> Self {
        self.stage_params = stage_params;
        self
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<String, Value>) -> Self {
        self.upstream = upstream;
        self
    }

    /// A job parameter by name
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// State emitted by an earlier stage
    pub fn upstream_state(&self, stage: &str) -> Option<&Value> {
        self.upstream.get(stage)
    }
}

/// Per-job artifact directory: `<root>/<tenant>/<job_id>`
pub fn artifact_dir(root: &Path, tenant_id: &str, job_id: JobId) -> PathBuf {
    root.join(tenant_id).join(job_id.to_string())
}
