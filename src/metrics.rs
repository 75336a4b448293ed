//! Metric names and recording helpers
//!
//! Everything goes through the `metrics` facade. Without an installed
//! recorder the calls are no-ops, so the engine never depends on an exporter.

use crate::core::job::{Job, JobType};
use crate::core::state::JobState;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit};
use std::time::Duration;

pub const JOBS_TOTAL: &str = "jobflow_jobs_total";
pub const JOB_DURATION_SECONDS: &str = "jobflow_job_duration_seconds";
pub const STAGE_DURATION_SECONDS: &str = "jobflow_stage_duration_seconds";
pub const WRITE_QUEUE_DEPTH: &str = "jobflow_write_queue_depth";
pub const WRITE_LOCK_HOLD_SECONDS: &str = "jobflow_write_lock_hold_seconds";
pub const CHECKPOINTS_PER_JOB: &str = "jobflow_checkpoints_per_job";
pub const CHECKPOINTS_TOTAL: &str = "jobflow_checkpoints_total";
pub const EVENT_PUBLISH_FAILURES_TOTAL: &str = "jobflow_event_publish_failures_total";

/// Register descriptions with whatever recorder is installed
pub fn describe() {
    describe_counter!(JOBS_TOTAL, "Job state transitions by job type and target state");
    describe_histogram!(JOB_DURATION_SECONDS, Unit::Seconds, "Wall-clock time from start to terminal state");
    describe_histogram!(STAGE_DURATION_SECONDS, Unit::Seconds, "Time spent inside one generator");
    describe_gauge!(WRITE_QUEUE_DEPTH, "Stages waiting for the write lock");
    describe_histogram!(WRITE_LOCK_HOLD_SECONDS, Unit::Seconds, "How long the write lock was held");
    describe_histogram!(CHECKPOINTS_PER_JOB, "Checkpoints written by a job when it finished");
    describe_counter!(CHECKPOINTS_TOTAL, "Checkpoints written");
    describe_counter!(EVENT_PUBLISH_FAILURES_TOTAL, "Events a sink failed to accept");
}

pub fn record_transition(job_type: JobType, state: JobState) {
    counter!(JOBS_TOTAL, "type" => job_type.as_str(), "state" => state.as_str()).increment(1);
}

/// Duration and checkpoint count for a job that just reached a terminal state
pub fn record_job_finished(job: &Job) {
    if let Some(elapsed) = job.elapsed().and_then(|d| d.to_std().ok()) {
        histogram!(JOB_DURATION_SECONDS, "type" => job.job_type.as_str()).record(elapsed.as_secs_f64());
    }
    histogram!(CHECKPOINTS_PER_JOB, "type" => job.job_type.as_str()).record(job.checkpoints.len() as f64);
}

pub fn record_stage_duration(stage: &str, elapsed: Duration) {
    histogram!(STAGE_DURATION_SECONDS, "stage" => stage.to_string()).record(elapsed.as_secs_f64());
}

pub fn set_write_queue_depth(depth: usize) {
    gauge!(WRITE_QUEUE_DEPTH).set(depth as f64);
}

pub fn record_write_lock_hold(held: Duration) {
    histogram!(WRITE_LOCK_HOLD_SECONDS).record(held.as_secs_f64());
}

pub fn record_checkpoint() {
    counter!(CHECKPOINTS_TOTAL).increment(1);
}

pub fn record_publish_failure(sink: &str) {
    counter!(EVENT_PUBLISH_FAILURES_TOTAL, "sink" => sink.to_string()).increment(1);
}
