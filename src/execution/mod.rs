//! Pipeline execution: stage loop, write serialization, job runner

pub mod cancel;
pub mod engine;
pub mod executor;
pub mod manifest;
pub mod result;
pub mod scheduler;
pub mod write_queue;

pub use cancel::CancellationToken;
pub use engine::Engine;
pub use executor::{ExecutorSettings, PipelineExecutor};
pub use manifest::ManifestAssembler;
pub use result::{GeneratorResult, PipelineOutcome, PipelineResult, StageSnapshot};
pub use scheduler::{JobReport, JobRunner, RecoveryReport, RunnerSettings};
pub use write_queue::{WriteHolder, WriteLease, WriteQueue};
