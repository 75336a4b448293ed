//! Generator registry
//!
//! Generators are the units of pipeline work. They are registered once when
//! the engine is built and never change afterwards; every job reads the same
//! table. Execution order is `order` ascending, ties broken by registration
//! order.

pub mod command;

use crate::core::artifact::ArtifactRef;
use crate::core::context::{FeatureFlags, GeneratorContext};
use crate::core::error::{EngineError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::debug;

pub use command::CommandGenerator;

/// Executable contract of a stage
///
/// Implementations produce artifacts and must not touch job state or the
/// write lock; the executor owns both.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, ctx: &GeneratorContext) -> anyhow::Result<GeneratorOutput>;
}

/// What a generator hands back on success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneratorOutput {
    /// Artifact key → location and metadata
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactRef>,

    /// Opaque state carried into the checkpoint and later stages' context
    #[serde(default)]
    pub state: Option<Value>,
}

impl GeneratorOutput {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_artifact(mut self, key: impl Into<String>, artifact: ArtifactRef) -> Self {
        self.artifacts.insert(key.into(), artifact);
        self
    }

    pub fn with_state(mut self, state: Value) -> Self {
        self.state = Some(state);
        self
    }
}

/// Whether a stage writes to the shared analytical store
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreAccess {
    #[default]
    ReadOnly,
    Write,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorCategory {
    Ingestion,
    Statistics,
    DataQuality,
    Kpi,
    Visualization,
    Report,
    Security,
    #[default]
    Other,
}

impl GeneratorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeneratorCategory::Ingestion => "ingestion",
            GeneratorCategory::Statistics => "statistics",
            GeneratorCategory::DataQuality => "data_quality",
            GeneratorCategory::Kpi => "kpi",
            GeneratorCategory::Visualization => "visualization",
            GeneratorCategory::Report => "report",
            GeneratorCategory::Security => "security",
            GeneratorCategory::Other => "other",
        }
    }
}

impl fmt::Display for GeneratorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered stage: metadata plus the generator that runs it
#[derive(Clone)]
pub struct GeneratorDefinition {
    pub name: String,
    pub is_core: bool,
    pub order: i32,
    pub feature_flag: Option<String>,
    pub store_access: StoreAccess,
    pub category: GeneratorCategory,
    pub description: Option<String>,
    /// Version of the state this stage writes into checkpoints
    pub snapshot_version: u32,
    /// Passed to the generator as `GeneratorContext::stage_params`
    pub params: Value,
    pub generator: Arc<dyn Generator>,
}

impl GeneratorDefinition {
    /// An extended, read-only stage with order 100
    pub fn new(name: impl Into<String>, generator: Arc<dyn Generator>) -> Self {
        Self {
            name: name.into(),
            is_core: false,
            order: crate::core::config::default_order(),
            feature_flag: None,
            store_access: StoreAccess::ReadOnly,
            category: GeneratorCategory::Other,
            description: None,
            snapshot_version: crate::core::config::default_snapshot_version(),
            params: Value::Null,
            generator,
        }
    }

    pub fn core(mut self) -> Self {
        self.is_core = true;
        self
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn feature_flag(mut self, flag: impl Into<String>) -> Self {
        self.feature_flag = Some(flag.into());
        self
    }

    pub fn writes_store(mut self) -> Self {
        self.store_access = StoreAccess::Write;
        self
    }

    pub fn category(mut self, category: GeneratorCategory) -> Self {
        self.category = category;
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn snapshot_version(mut self, version: u32) -> Self {
        self.snapshot_version = version;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    pub fn is_enabled(&self, flags: &FeatureFlags) -> bool {
        self.feature_flag
            .as_deref()
            .map_or(true, |flag| flags.is_enabled(flag))
    }

    pub fn writes(&self) -> bool {
        self.store_access == StoreAccess::Write
    }
}

impl fmt::Debug for GeneratorDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GeneratorDefinition")
            .field("name", &self.name)
            .field("is_core", &self.is_core)
            .field("order", &self.order)
            .field("feature_flag", &self.feature_flag)
            .field("store_access", &self.store_access)
            .field("category", &self.category)
            .field("snapshot_version", &self.snapshot_version)
            .finish_non_exhaustive()
    }
}

/// Adapter turning an async closure into a `Generator`
struct FnGenerator<F> {
    func: F,
}

#[async_trait]
impl<F, Fut> Generator for FnGenerator<F>
where
    F: Fn(GeneratorContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<GeneratorOutput>> + Send,
{
    async fn generate(&self, ctx: &GeneratorContext) -> anyhow::Result<GeneratorOutput> {
        (self.func)(ctx.clone()).await
    }
}

/// Immutable table of generator definitions
#[derive(Debug, Default)]
pub struct Registry {
    definitions: Vec<Arc<GeneratorDefinition>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a definition; names must be unique
    pub fn register(&mut self, definition: GeneratorDefinition) -> Result<()> {
        if definition.name.trim().is_empty() {
            return Err(EngineError::Registry("generator name must not be empty".to_string()));
        }
        if self.get(&definition.name).is_some() {
            return Err(EngineError::Registry(format!(
                "generator '{}' is already registered",
                definition.name
            )));
        }

        debug!(
            "Registered generator '{}' (core: {}, order: {})",
            definition.name, definition.is_core, definition.order
        );
        self.definitions.push(Arc::new(definition));
        Ok(())
    }

    /// Register an async closure as a generator
    pub fn register_fn<F, Fut>(
        &mut self,
        name: &str,
        is_core: bool,
        feature_flag: Option<&str>,
        order: i32,
        func: F,
    ) -> Result<()>
    where
        F: Fn(GeneratorContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<GeneratorOutput>> + Send + 'static,
    {
        let mut definition = GeneratorDefinition::new(name, Arc::new(FnGenerator { func })).order(order);
        definition.is_core = is_core;
        definition.feature_flag = feature_flag.map(str::to_string);
        self.register(definition)
    }

    pub fn get(&self, name: &str) -> Option<&Arc<GeneratorDefinition>> {
        self.definitions.iter().find(|definition| definition.name == name)
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }

    /// Every definition in execution order, ignoring feature flags
    pub fn sorted(&self) -> Vec<Arc<GeneratorDefinition>> {
        let mut sorted = self.definitions.clone();
        // sort_by_key is stable, so equal orders keep registration order
        sorted.sort_by_key(|definition| definition.order);
        sorted
    }

    /// Definitions of one category, in execution order
    pub fn by_category(&self, category: GeneratorCategory) -> Vec<Arc<GeneratorDefinition>> {
        self.sorted()
            .into_iter()
            .filter(|definition| definition.category == category)
            .collect()
    }

    /// Resolve the stages a job runs under `flags`
    pub fn plan(&self, flags: &FeatureFlags) -> ExecutionPlan {
        let stages = self
            .sorted()
            .into_iter()
            .enumerate()
            .filter(|(_, definition)| definition.is_enabled(flags))
            .map(|(sequence, definition)| PlannedStage {
                sequence: sequence as u32,
                definition,
            })
            .collect();
        ExecutionPlan { stages }
    }
}

/// A stage selected for execution
#[derive(Debug, Clone)]
pub struct PlannedStage {
    /// Position in the full sorted registry, independent of feature flags
    pub sequence: u32,
    pub definition: Arc<GeneratorDefinition>,
}

impl PlannedStage {
    pub fn name(&self) -> &str {
        &self.definition.name
    }
}

/// Ordered stages for one job execution
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    stages: Vec<PlannedStage>,
}

impl ExecutionPlan {
    pub fn stages(&self) -> &[PlannedStage] {
        &self.stages
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(PlannedStage::name).collect()
    }

    pub fn get(&self, name: &str) -> Option<&PlannedStage> {
        self.stages.iter().find(|stage| stage.name() == name)
    }

    /// Index of `name` within this plan
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|stage| stage.name() == name)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}
