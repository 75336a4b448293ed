//! Engine - wires every component together from an `EngineConfig`

use crate::core::config::EngineConfig;
use crate::core::error::{EngineError, Result};
use crate::events::{EventPublisher, EventSink, JsonLinesSink, LogSink};
use crate::execution::executor::{ExecutorSettings, PipelineExecutor};
use crate::execution::scheduler::{JobRunner, RunnerSettings};
use crate::execution::write_queue::WriteQueue;
use crate::persistence::{CheckpointManager, InMemoryBackend, JobBackend, JobStore};
use crate::registry::{ExecutionPlan, Registry};
use std::sync::Arc;
use tracing::info;

/// A fully wired job engine
///
/// One registry, one write queue and one event publisher are shared by every
/// job the engine runs.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<Registry>,
    store: Arc<JobStore>,
    checkpoints: Arc<CheckpointManager>,
    events: EventPublisher,
    write_queue: WriteQueue,
    runner: Arc<JobRunner>,
}

impl Engine {
    /// Build an engine around an explicit registry, backend and sinks
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        registry: Registry,
        backend: Arc<dyn JobBackend>,
        sinks: Vec<Arc<dyn EventSink>>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        crate::metrics::describe();

        let registry = Arc::new(registry);
        let events = EventPublisher::new(sinks, config.event_publish_timeout());
        let store = Arc::new(JobStore::new(
            backend.clone(),
            events.clone(),
            config.default_max_runtime(),
        ));
        let checkpoints = Arc::new(CheckpointManager::new(backend));
        let write_queue = WriteQueue::new();

        let executor = Arc::new(PipelineExecutor::new(
            registry.clone(),
            store.clone(),
            checkpoints.clone(),
            write_queue.clone(),
            ExecutorSettings {
                write_lock_timeout: config.write_lock_timeout(),
                artifact_root: config.artifact_root.clone(),
            },
        ));
        let runner = Arc::new(JobRunner::new(
            executor,
            store.clone(),
            checkpoints.clone(),
            RunnerSettings {
                max_concurrency: config.max_concurrency,
                max_concurrency_per_tenant: config.max_concurrency_per_tenant,
                cancel_grace: config.cancel_grace(),
                resume_policy: config.resume_policy,
                feature_flags: config.flags(),
            },
        ));

        info!(
            "Engine ready: {} generator(s), max concurrency {}",
            registry.len(),
            config.max_concurrency
        );

        Ok(Self {
            config,
            registry,
            store,
            checkpoints,
            events,
            write_queue,
            runner,
        })
    }

    /// Build an engine whose generators all come from the config file
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let registry = Registry::from_config(&config)?;
        Self::with_registry(config, registry).await
    }

    /// Build an engine with the configured backend and sinks but a caller-supplied registry
    pub async fn with_registry(config: EngineConfig, registry: Registry) -> Result<Self> {
        let backend = open_backend(&config).await?;

        let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(LogSink)];
        if let Some(path) = &config.event_log {
            let sink = JsonLinesSink::open(path)
                .await
                .map_err(|e| EngineError::Config(format!("event log {}: {:#}", path.display(), e)))?;
            sinks.push(Arc::new(sink));
        }

        Self::new(registry, backend, sinks, config)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn store(&self) -> &Arc<JobStore> {
        &self.store
    }

    pub fn checkpoints(&self) -> &Arc<CheckpointManager> {
        &self.checkpoints
    }

    pub fn events(&self) -> &EventPublisher {
        &self.events
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Stages that run under the configured feature flags
    pub fn plan(&self) -> ExecutionPlan {
        self.registry.plan(&self.config.flags())
    }
}

#[cfg(feature = "sqlite")]
async fn open_backend(config: &EngineConfig) -> Result<Arc<dyn JobBackend>> {
    match &config.database {
        Some(path) => {
            info!("Using job database {}", path.display());
            let backend = crate::persistence::SqliteBackend::open(path).await?;
            Ok(Arc::new(backend))
        }
        None => Ok(Arc::new(InMemoryBackend::new())),
    }
}

#[cfg(not(feature = "sqlite"))]
async fn open_backend(config: &EngineConfig) -> Result<Arc<dyn JobBackend>> {
    if config.database.is_some() {
        return Err(EngineError::Config(
            "database requires the 'sqlite' feature".to_string(),
        ));
    }
    Ok(Arc::new(InMemoryBackend::new()))
}
