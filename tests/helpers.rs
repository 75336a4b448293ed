//! Test utility functions for jobflow
#![allow(dead_code)]

use async_trait::async_trait;
use jobflow::core::config::EngineConfig;
use jobflow::events::{EventSink, MemorySink};
use jobflow::execution::{ExecutorSettings, PipelineExecutor};
use jobflow::{
    ArtifactRef, Engine, Generator, GeneratorContext, GeneratorDefinition, GeneratorOutput, InMemoryBackend, Job, JobBackend, JobEvent,
    JobId, JobState, Registry,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

/// Shared log of which stages ran, in order
#[derive(Clone, Default)]
pub struct Recorder {
    calls: Arc<Mutex<Vec<String>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, stage: &str) {
        self.calls.lock().unwrap().push(stage.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, stage: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == stage).count()
    }
}

/// What a scripted stage does when invoked
#[derive(Clone)]
pub enum Behavior {
    /// Produce one artifact named after the stage
    Succeed,
    /// Produce the given artifact keys
    Artifacts(Vec<&'static str>),
    Fail(&'static str),
    Sleep(Duration),
    Panic,
}

/// Generator driven by a `Behavior`, recording every invocation
pub struct ScriptedGenerator {
    name: String,
    behavior: Behavior,
    recorder: Recorder,
}

impl ScriptedGenerator {
    pub fn new(name: &str, behavior: Behavior, recorder: &Recorder) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            behavior,
            recorder: recorder.clone(),
        })
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, ctx: &GeneratorContext) -> anyhow::Result<GeneratorOutput> {
        self.recorder.record(&self.name);

        let artifact = |key: &str| ArtifactRef::new(ctx.artifact_root.join(format!("{}.json", key)).display().to_string());
        let state = json!({ "stage": self.name, "upstream": ctx.upstream.keys().collect::<Vec<_>>() });

        match &self.behavior {
            Behavior::Succeed => Ok(GeneratorOutput::new()
                .with_artifact(self.name.clone(), artifact(&self.name))
                .with_state(state)),
            Behavior::Artifacts(keys) => {
                let mut output = GeneratorOutput::new().with_state(state);
                for key in keys {
                    output = output.with_artifact(*key, artifact(*key));
                }
                Ok(output)
            }
            Behavior::Fail(message) => Err(anyhow::anyhow!("{}", message)),
            Behavior::Sleep(delay) => {
                tokio::time::sleep(*delay).await;
                Ok(GeneratorOutput::new()
                    .with_artifact(self.name.clone(), artifact(&self.name))
                    .with_state(state))
            }
            Behavior::Panic => panic!("{} blew up", self.name),
        }
    }
}

/// Tracks how many write stages hold the store at once
#[derive(Clone, Default)]
pub struct WriteTracker {
    current: Arc<AtomicUsize>,
    max: Arc<AtomicUsize>,
}

impl WriteTracker {
    pub fn max_concurrent(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

/// Write stage that sleeps while counting concurrent holders
pub struct TrackedWriter {
    tracker: WriteTracker,
    hold: Duration,
}

impl TrackedWriter {
    pub fn new(tracker: &WriteTracker, hold: Duration) -> Arc<Self> {
        Arc::new(Self {
            tracker: tracker.clone(),
            hold,
        })
    }
}

#[async_trait]
impl Generator for TrackedWriter {
    async fn generate(&self, _ctx: &GeneratorContext) -> anyhow::Result<GeneratorOutput> {
        let now = self.tracker.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.tracker.max.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.hold).await;
        self.tracker.current.fetch_sub(1, Ordering::SeqCst);
        Ok(GeneratorOutput::new())
    }
}

/// Sink that always fails
pub struct BrokenSink;

#[async_trait]
impl EventSink for BrokenSink {
    fn name(&self) -> &str {
        "broken"
    }

    async fn publish(&self, _event: &JobEvent) -> anyhow::Result<()> {
        anyhow::bail!("bus unavailable")
    }
}

/// An engine over an in-memory backend with a recording event sink
pub struct TestEngine {
    pub engine: Engine,
    pub backend: Arc<dyn JobBackend>,
    pub sink: Arc<MemorySink>,
    pub dir: TempDir,
}

impl TestEngine {
    pub fn new(registry: Registry) -> Self {
        Self::with_config(registry, |_| {})
    }

    pub fn with_config(registry: Registry, tweak: impl FnOnce(&mut EngineConfig)) -> Self {
        let backend: Arc<dyn JobBackend> = Arc::new(InMemoryBackend::new());
        Self::on_backend(registry, backend, tweak)
    }

    /// A second engine over an existing backend, as after a process restart
    pub fn on_backend(
        registry: Registry,
        backend: Arc<dyn JobBackend>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        Self::with_sinks(registry, backend, Vec::new(), tweak)
    }

    pub fn with_sinks(
        registry: Registry,
        backend: Arc<dyn JobBackend>,
        extra_sinks: Vec<Arc<dyn EventSink>>,
        tweak: impl FnOnce(&mut EngineConfig),
    ) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig {
            artifact_root: dir.path().to_path_buf(),
            write_lock_timeout_secs: 5,
            cancel_grace_secs: 5,
            ..EngineConfig::default()
        };
        tweak(&mut config);

        let sink = Arc::new(MemorySink::new());
        let mut sinks: Vec<Arc<dyn EventSink>> = vec![sink.clone() as Arc<dyn EventSink>];
        sinks.extend(extra_sinks);

        let engine = Engine::new(registry, backend.clone(), sinks, config).unwrap();
        Self {
            engine,
            backend,
            sink,
            dir,
        }
    }

    /// Submit a job and wait for it to finish
    pub async fn run(&self, params: Value) -> Job {
        let job = self
            .engine
            .runner()
            .submit(jobflow::JobType::Analyze, "acme", params)
            .await
            .unwrap();
        self.wait(job.id).await
    }

    pub async fn wait(&self, job_id: JobId) -> Job {
        tokio::time::timeout(Duration::from_secs(10), self.engine.runner().wait(job_id))
            .await
            .expect("job did not finish in time")
            .unwrap()
    }

    /// Executor outside the runner, so a test can abort it mid-stage
    pub fn detached_executor(&self) -> PipelineExecutor {
        PipelineExecutor::new(
            self.engine.registry().clone(),
            self.engine.store().clone(),
            self.engine.checkpoints().clone(),
            self.engine.write_queue().clone(),
            ExecutorSettings {
                write_lock_timeout: Duration::from_secs(5),
                artifact_root: self.dir.path().to_path_buf(),
            },
        )
    }

    /// Events for one job, after every queued event reached the sinks
    pub async fn events_for(&self, job_id: JobId) -> Vec<JobEvent> {
        self.engine.events().flush().await;
        self.sink
            .events()
            .await
            .into_iter()
            .filter(|e| e.job_id == job_id)
            .collect()
    }
}

/// Register a scripted stage
pub fn stage(registry: &mut Registry, name: &str, is_core: bool, order: i32, behavior: Behavior, recorder: &Recorder) {
    let mut definition = GeneratorDefinition::new(name, ScriptedGenerator::new(name, behavior, recorder)).order(order);
    if is_core {
        definition = definition.core();
    }
    registry.register(definition).unwrap();
}

pub fn analyze_params() -> Value {
    json!({ "source_id": "warehouse", "tables": ["orders", "customers"] })
}

pub fn ingest_params() -> Value {
    json!({ "source_id": "warehouse", "mode": "full" })
}

/// Register a core stage that holds the write lock while it runs
pub fn write_stage(registry: &mut Registry, name: &str, order: i32, tracker: &WriteTracker, hold: Duration) {
    registry
        .register(
            GeneratorDefinition::new(name, TrackedWriter::new(tracker, hold))
                .core()
                .order(order)
                .writes_store(),
        )
        .unwrap();
}

/// Poll until `check` holds or the timeout expires
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// Assertions

pub fn assert_job_state(job: &Job, expected: JobState) {
    assert_eq!(
        job.state, expected,
        "job {} ended as {} (error: {:?})",
        job.id, job.state, job.error
    );
}

pub fn assert_execution_order(recorder: &Recorder, expected: &[&str]) {
    let calls = recorder.calls();
    let calls: Vec<&str> = calls.iter().map(String::as_str).collect();
    assert_eq!(calls, expected, "unexpected execution order");
}

pub fn assert_manifest_keys(job: &Job, expected: &[&str]) {
    let manifest = job.manifest.as_ref().expect("job has no manifest");
    assert_eq!(manifest.keys(), expected, "unexpected manifest keys");
}

/// Every observed state change is an allowed transition, in lifecycle order
pub fn assert_valid_transitions(events: &[JobEvent]) {
    let mut current = JobState::Pending;
    for event in events.iter().filter(|e| e.event_type == jobflow::events::EventType::StateChanged) {
        let from: JobState = event
            .extra_str("from")
            .expect("state change without 'from'")
            .parse()
            .unwrap();
        assert_eq!(from, current, "event sequence skipped a state");
        assert!(
            from.can_transition_to(event.state),
            "invalid transition {} -> {}",
            from,
            event.state
        );
        current = event.state;
    }
}
