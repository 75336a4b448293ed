//! jobflow - durable job lifecycle and generator pipeline orchestration

pub mod cli;
pub mod core;
pub mod events;
pub mod execution;
pub mod metrics;
pub mod persistence;
pub mod registry;

// Re-export commonly used types
pub use core::{ArtifactRef, EngineError, FeatureFlags, GeneratorContext, Job, JobError, JobId, JobState, JobType, Manifest};
pub use core::config::EngineConfig;
pub use events::{EventPublisher, EventSink, JobEvent};
pub use execution::{CancellationToken, Engine, JobRunner, PipelineExecutor, PipelineResult, WriteQueue};
pub use persistence::{CheckpointManager, InMemoryBackend, JobBackend, JobStore};
pub use registry::{Generator, GeneratorDefinition, GeneratorOutput, Registry};
