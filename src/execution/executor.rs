//! Pipeline executor - runs a job's stages in order

use crate::core::context::{FeatureFlags, GeneratorContext};
use crate::core::error::{EngineError, ErrorKind, JobError, Result};
use crate::core::job::{Job, JobId};
use crate::core::state::JobState;
use crate::events::JobEvent;
use crate::execution::cancel::CancellationToken;
use crate::execution::manifest::ManifestAssembler;
use crate::execution::result::{GeneratorResult, PipelineOutcome, PipelineResult, StageSnapshot};
use crate::execution::write_queue::WriteQueue;
use crate::persistence::{CheckpointManager, JobStore, ResumePoint, Snapshot};
use crate::registry::{GeneratorOutput, PlannedStage, Registry};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Knobs the executor needs from the engine configuration
#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub write_lock_timeout: Duration,
    pub artifact_root: PathBuf,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            write_lock_timeout: Duration::from_secs(300),
            artifact_root: PathBuf::from("./artifacts"),
        }
    }
}

/// Why a stage did not produce output
#[derive(Debug)]
enum StageError {
    /// The generator returned an error or panicked
    Generator(String),
    /// The write lock could not be acquired in time
    Lock(EngineError),
    /// The job's deadline passed while waiting or running
    Deadline,
    /// Cancellation fired while waiting for the write lock
    Cancelled,
}

/// Aborts the generator task if the stage is abandoned
struct StageTask(JoinHandle<anyhow::Result<GeneratorOutput>>);

impl Drop for StageTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Mutable state of one execution attempt
struct Run {
    job: Job,
    results: Vec<GeneratorResult>,
    stage_states: BTreeMap<String, Value>,
    resumed_from: Option<String>,
}

impl Run {
    fn snapshot(&self) -> StageSnapshot {
        StageSnapshot {
            results: self.results.clone(),
            stage_states: self.stage_states.clone(),
        }
    }
}

/// Executes the registered stages of one job
///
/// Stages run strictly one after another. Every successful stage is
/// checkpointed before the next one starts.
pub struct PipelineExecutor {
    registry: Arc<Registry>,
    store: Arc<JobStore>,
    checkpoints: Arc<CheckpointManager>,
    write_queue: WriteQueue,
    assembler: ManifestAssembler,
    settings: ExecutorSettings,
}

impl PipelineExecutor {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<JobStore>,
        checkpoints: Arc<CheckpointManager>,
        write_queue: WriteQueue,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            registry,
            store,
            checkpoints,
            write_queue,
            assembler: ManifestAssembler::new(),
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn write_queue(&self) -> &WriteQueue {
        &self.write_queue
    }

    /// Run (or resume) the pipeline of `job_id` to a terminal state
    ///
    /// A `PENDING` job is started first. With a `ResumePoint`, stages at or
    /// before the checkpoint are skipped and their results restored.
    ///
    /// The runtime budget runs from the job's first start, so a continued
    /// job only gets what earlier attempts left over.
    pub async fn execute(
        &self,
        job_id: JobId,
        flags: &FeatureFlags,
        resume: Option<ResumePoint>,
        cancel: &CancellationToken,
    ) -> Result<PipelineResult> {
        let mut job = self.store.get(job_id).await?;

        match job.state {
            JobState::Pending if cancel.is_cancelled() => {
                info!(job_id = %job_id, "Job cancelled before it started");
                self.store.cancel(job_id).await?;
                return Ok(self.result(PipelineOutcome::Cancelled, Vec::new(), None, None));
            }
            JobState::Pending => job = self.store.start(job_id).await?,
            JobState::Running => {
                info!(job_id = %job_id, "Continuing job that is already running");
            }
            state => {
                return Err(EngineError::InvalidTransition {
                    job_id,
                    from: state,
                    to: JobState::Running,
                });
            }
        }

        let remaining = job.remaining_runtime();
        if remaining < job.max_runtime() {
            debug!(job_id = %job_id, "{:.1}s of runtime budget left", remaining.as_secs_f64());
        }
        let deadline = Instant::now() + remaining;
        let plan = self.registry.plan(flags);
        let total = plan.len().max(1) as f64;

        let mut run = Run {
            job,
            results: Vec::new(),
            stage_states: BTreeMap::new(),
            resumed_from: None,
        };
        let mut completed_through = None;
        if let Some(point) = resume {
            info!(
                job_id = %job_id,
                "Resuming after stage '{}' (next: {})",
                point.checkpoint.stage,
                point.next_stage.as_deref().unwrap_or("none")
            );
            completed_through = Some(point.completed_through());
            run.resumed_from = Some(point.checkpoint.stage.clone());
            run.results = point.snapshot.results;
            run.stage_states = point.snapshot.stage_states;
        }

        info!(job_id = %job_id, "Executing {} stage(s): {}", plan.len(), plan.names().join(", "));

        for (index, stage) in plan.stages().iter().enumerate() {
            let name = stage.name();

            if completed_through.is_some_and(|through| stage.sequence <= through) {
                debug!(job_id = %job_id, stage = name, "Skipping checkpointed stage");
                continue;
            }

            if cancel.is_cancelled() {
                return self.finish_cancelled(run, Some(name)).await;
            }
            if Instant::now() >= deadline {
                return self.finish_timed_out(run, name).await;
            }

            run.job = self
                .store
                .advance(job_id, name, stage.sequence, index as f64 / total)
                .await?;

            let started = Instant::now();
            let outcome = self.run_stage(&run, stage, flags, deadline, cancel).await;
            let elapsed = started.elapsed();
            crate::metrics::record_stage_duration(name, elapsed);
            let duration_ms = elapsed.as_millis() as u64;
            let is_core = stage.definition.is_core;

            let (kind, message) = match outcome {
                Ok(output) => {
                    info!(job_id = %job_id, stage = name, "Stage completed in {}ms", duration_ms);
                    run.results
                        .push(GeneratorResult::succeeded(name, is_core, output.artifacts, duration_ms));
                    if let Some(state) = output.state {
                        run.stage_states.insert(name.to_string(), state);
                    }

                    if let Err(e) = self.checkpoint(&run, stage).await {
                        return self.abort(run, name, e).await;
                    }

                    run.job = self
                        .store
                        .advance(job_id, name, stage.sequence, (index + 1) as f64 / total)
                        .await?;
                    self.store
                        .events()
                        .publish(JobEvent::stage_completed(&run.job, name, true, None, elapsed));
                    continue;
                }
                Err(StageError::Deadline) => {
                    warn!(job_id = %job_id, stage = name, "Job deadline reached while stage was running");
                    return self.finish_timed_out(run, name).await;
                }
                Err(StageError::Cancelled) => return self.finish_cancelled(run, Some(name)).await,
                Err(StageError::Lock(e)) => (e.kind(), e.to_string()),
                Err(StageError::Generator(message)) if is_core => (ErrorKind::CoreGeneratorFailure, message),
                Err(StageError::Generator(message)) => (ErrorKind::ExtendedGeneratorFailure, message),
            };

            run.results
                .push(GeneratorResult::failed(name, is_core, message.clone(), duration_ms));
            self.store.events().publish(JobEvent::stage_completed(
                &run.job,
                name,
                false,
                Some(&message),
                elapsed,
            ));

            if is_core {
                error!(job_id = %job_id, stage = name, "Core stage failed: {}", message);
                return self
                    .finish_failed(run, name, JobError::new(kind, message).with_stage(name))
                    .await;
            }
            warn!(job_id = %job_id, stage = name, "Extended stage failed, continuing: {}", message);
        }

        let result = self.result(PipelineOutcome::Succeeded, run.results, None, run.resumed_from);
        self.store
            .complete(job_id, result.summary(), result.manifest.clone())
            .await?;

        info!(job_id = %job_id, "Pipeline succeeded with {} artifact(s)", result.manifest.len());
        Ok(result)
    }

    async fn run_stage(
        &self,
        run: &Run,
        stage: &PlannedStage,
        flags: &FeatureFlags,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> std::result::Result<GeneratorOutput, StageError> {
        let definition = &stage.definition;
        let ctx = GeneratorContext::for_job(&run.job, stage.name(), &self.settings.artifact_root, flags)
            .with_stage_params(definition.params.clone())
            .with_upstream(run.stage_states.clone());

        tokio::fs::create_dir_all(&ctx.artifact_root).await.map_err(|e| {
            StageError::Generator(format!(
                "failed to create artifact directory {}: {}",
                ctx.artifact_root.display(),
                e
            ))
        })?;

        let _lease = if definition.writes() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let wait = self.settings.write_lock_timeout.min(remaining);
            match self
                .write_queue
                .acquire_cancellable(run.job.id, stage.name(), wait, cancel)
                .await
            {
                Ok(lease) => Some(lease),
                Err(EngineError::WriteLockTimeout { .. }) if Instant::now() >= deadline => {
                    return Err(StageError::Deadline);
                }
                Err(EngineError::CancellationRequested(_)) => return Err(StageError::Cancelled),
                Err(e) => return Err(StageError::Lock(e)),
            }
        } else {
            None
        };

        let generator = definition.generator.clone();
        let mut task = StageTask(tokio::spawn(async move { generator.generate(&ctx).await }));

        match tokio::time::timeout_at(deadline, &mut task.0).await {
            Ok(Ok(Ok(output))) => Ok(output),
            Ok(Ok(Err(e))) => Err(StageError::Generator(format!("{:#}", e))),
            Ok(Err(join_error)) if join_error.is_panic() => {
                Err(StageError::Generator("generator panicked".to_string()))
            }
            Ok(Err(_)) => Err(StageError::Generator("generator task was aborted".to_string())),
            Err(_) => Err(StageError::Deadline),
        }
    }

    async fn checkpoint(&self, run: &Run, stage: &PlannedStage) -> Result<()> {
        let snapshot = Snapshot::encode(stage.definition.snapshot_version, &run.snapshot())?;
        self.checkpoints
            .checkpoint(run.job.id, stage.name(), stage.sequence, snapshot)
            .await?;
        Ok(())
    }

    fn result(
        &self,
        outcome: PipelineOutcome,
        results: Vec<GeneratorResult>,
        failed_core: Option<String>,
        resumed_from: Option<String>,
    ) -> PipelineResult {
        PipelineResult {
            success: outcome == PipelineOutcome::Succeeded,
            outcome,
            manifest: self.assembler.assemble(&results),
            results,
            failed_core,
            resumed_from,
        }
    }

    async fn finish_failed(&self, run: Run, stage: &str, error: JobError) -> Result<PipelineResult> {
        let result = self.result(
            PipelineOutcome::Failed,
            run.results,
            Some(stage.to_string()),
            run.resumed_from,
        );
        self.store
            .fail(run.job.id, error, Some(result.manifest.clone()))
            .await?;
        Ok(result)
    }

    async fn finish_cancelled(&self, run: Run, next_stage: Option<&str>) -> Result<PipelineResult> {
        info!(
            job_id = %run.job.id,
            "Cancellation observed before stage '{}'",
            next_stage.unwrap_or("-")
        );
        let result = self.result(PipelineOutcome::Cancelled, run.results, None, run.resumed_from);
        self.store
            .cancel_with(run.job.id, Some(result.manifest.clone()))
            .await?;
        Ok(result)
    }

    async fn finish_timed_out(&self, run: Run, stage: &str) -> Result<PipelineResult> {
        warn!(
            job_id = %run.job.id,
            stage,
            "Job exceeded its maximum runtime of {}s",
            run.job.max_runtime_secs
        );
        let result = self.result(PipelineOutcome::TimedOut, run.results, None, run.resumed_from);
        self.store
            .timeout(run.job.id, Some(result.manifest.clone()))
            .await?;
        Ok(result)
    }

    /// Fail the job after an engine error (for example a checkpoint write)
    async fn abort(&self, run: Run, stage: &str, cause: EngineError) -> Result<PipelineResult> {
        error!(job_id = %run.job.id, stage, "Aborting job: {}", cause);
        let manifest = self.assembler.assemble(&run.results);
        if let Err(e) = self
            .store
            .fail(run.job.id, JobError::from_engine(&cause, Some(stage)), Some(manifest))
            .await
        {
            error!(job_id = %run.job.id, stage, "Could not record failure: {}", e);
        }
        Err(cause)
    }
}
