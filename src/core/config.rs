//! Engine configuration from YAML

use crate::core::context::FeatureFlags;
use crate::core::error::{EngineError, Result};
use crate::registry::GeneratorCategory;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Whether incomplete jobs found at startup are resumed without an operator
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResumePolicy {
    /// Report incomplete jobs; resume only on request
    #[default]
    Manual,
    /// Resume every incomplete job from its latest checkpoint
    Automatic,
}

/// Top-level engine configuration loaded from YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Maximum number of jobs executing at once
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Maximum number of one tenant's jobs executing at once; unlimited if unset
    #[serde(default)]
    pub max_concurrency_per_tenant: Option<usize>,

    /// Runtime limit for jobs that do not declare their own
    #[serde(default = "default_max_runtime_secs")]
    pub default_max_runtime_secs: u64,

    /// How long a write stage waits for the shared store
    #[serde(default = "default_write_lock_timeout_secs")]
    pub write_lock_timeout_secs: u64,

    /// How long a running job gets to reach a stage boundary after cancel
    #[serde(default = "default_cancel_grace_secs")]
    pub cancel_grace_secs: u64,

    /// Per-sink publish deadline
    #[serde(default = "default_event_publish_timeout_secs")]
    pub event_publish_timeout_secs: u64,

    #[serde(default)]
    pub resume_policy: ResumePolicy,

    #[serde(default = "default_artifact_root")]
    pub artifact_root: PathBuf,

    /// SQLite database path; jobs are kept in memory when absent
    #[serde(default)]
    pub database: Option<PathBuf>,

    /// JSON-lines file receiving every lifecycle event
    #[serde(default)]
    pub event_log: Option<PathBuf>,

    #[serde(default)]
    pub feature_flags: BTreeMap<String, bool>,

    #[serde(default)]
    pub generators: Vec<GeneratorConfig>,
}

/// One pipeline stage as declared in YAML
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneratorConfig {
    /// Unique stage name
    pub name: String,

    /// Core stages abort the job when they fail
    #[serde(default)]
    pub core: bool,

    #[serde(default = "default_order")]
    pub order: i32,

    /// Stage runs only when this flag is enabled
    #[serde(default)]
    pub feature_flag: Option<String>,

    /// Stage must hold the write lock while it runs
    #[serde(default)]
    pub writes_store: bool,

    #[serde(default)]
    pub category: GeneratorCategory,

    #[serde(default)]
    pub description: Option<String>,

    #[serde(default = "default_snapshot_version")]
    pub snapshot_version: u32,

    /// Program and arguments; the context arrives on stdin
    pub command: Vec<String>,

    /// Extra parameters passed to the stage as `stage_params`
    #[serde(default)]
    pub params: Option<Value>,

    /// Kill the subprocess after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

fn default_max_concurrency() -> usize {
    4
}

fn default_max_runtime_secs() -> u64 {
    3600
}

fn default_write_lock_timeout_secs() -> u64 {
    300
}

fn default_cancel_grace_secs() -> u64 {
    30
}

fn default_event_publish_timeout_secs() -> u64 {
    5
}

fn default_artifact_root() -> PathBuf {
    PathBuf::from("./artifacts")
}

pub(crate) fn default_order() -> i32 {
    100
}

pub(crate) fn default_snapshot_version() -> u32 {
    1
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            max_concurrency_per_tenant: None,
            default_max_runtime_secs: default_max_runtime_secs(),
            write_lock_timeout_secs: default_write_lock_timeout_secs(),
            cancel_grace_secs: default_cancel_grace_secs(),
            event_publish_timeout_secs: default_event_publish_timeout_secs(),
            resume_policy: ResumePolicy::default(),
            artifact_root: default_artifact_root(),
            database: None,
            event_log: None,
            feature_flags: BTreeMap::new(),
            generators: Vec::new(),
        }
    }
}

impl EngineConfig {
    /// Load engine configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse engine configuration from a YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: EngineConfig =
            serde_yaml::from_str(yaml).map_err(|e| EngineError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate limits and generator declarations
    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_concurrency", self.max_concurrency as u64),
            ("default_max_runtime_secs", self.default_max_runtime_secs),
            ("write_lock_timeout_secs", self.write_lock_timeout_secs),
            ("event_publish_timeout_secs", self.event_publish_timeout_secs),
            (
                "max_concurrency_per_tenant",
                self.max_concurrency_per_tenant.map_or(1, |limit| limit as u64),
            ),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(EngineError::Config(format!("{} must be greater than zero", name)));
            }
        }

        let mut seen = HashSet::new();
        for generator in &self.generators {
            if generator.name.trim().is_empty() {
                return Err(EngineError::Config("generator name must not be empty".to_string()));
            }
            if !seen.insert(generator.name.as_str()) {
                return Err(EngineError::Config(format!(
                    "duplicate generator name: {}",
                    generator.name
                )));
            }
            if generator.command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(EngineError::Config(format!(
                    "generator '{}' has an empty command",
                    generator.name
                )));
            }
            if generator.timeout_secs == Some(0) {
                return Err(EngineError::Config(format!(
                    "generator '{}' timeout_secs must be greater than zero",
                    generator.name
                )));
            }
        }

        Ok(())
    }

    pub fn flags(&self) -> FeatureFlags {
        FeatureFlags::from(self.feature_flags.clone())
    }

    pub fn default_max_runtime(&self) -> Duration {
        Duration::from_secs(self.default_max_runtime_secs)
    }

    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.write_lock_timeout_secs)
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_secs)
    }

    pub fn event_publish_timeout(&self) -> Duration {
        Duration::from_secs(self.event_publish_timeout_secs)
    }
}
