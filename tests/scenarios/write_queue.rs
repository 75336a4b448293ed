//! Test: write stages are serialized across jobs

use crate::helpers::*;
use jobflow::core::error::ErrorKind;
use jobflow::{JobId, JobState, JobType, Registry};
use std::time::Duration;

#[tokio::test]
async fn test_write_stages_never_overlap() {
    let tracker = WriteTracker::default();
    let mut registry = Registry::new();
    write_stage(&mut registry, "load", 10, &tracker, Duration::from_millis(300));

    let t = TestEngine::new(registry);
    let runner = t.engine.runner();
    let mut jobs = Vec::new();
    for _ in 0..3 {
        jobs.push(runner.submit(JobType::Ingest, "acme", ingest_params()).await.unwrap());
    }

    let queue = t.engine.write_queue().clone();
    let queued = eventually(Duration::from_secs(2), || {
        let queue = queue.clone();
        async move { queue.depth() >= 1 }
    })
    .await;
    assert!(queued, "no job ever waited for the write lock");

    for job in jobs {
        assert_job_state(&t.wait(job.id).await, JobState::Succeeded);
    }
    assert_eq!(tracker.max_concurrent(), 1);
    assert!(!queue.is_held());
    assert_eq!(queue.depth(), 0);
}

#[tokio::test]
async fn test_read_only_stages_ignore_the_write_lock() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "quality", false, 20, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let lease = t
        .engine
        .write_queue()
        .acquire(JobId::new_v4(), "external", Duration::from_secs(1))
        .await
        .unwrap();

    let job = t.run(analyze_params()).await;
    assert_job_state(&job, JobState::Succeeded);
    assert!(t.engine.write_queue().is_held());
    drop(lease);
}

#[tokio::test]
async fn test_lock_timeout_fails_core_write_stage() {
    let tracker = WriteTracker::default();
    let mut registry = Registry::new();
    write_stage(&mut registry, "load", 10, &tracker, Duration::ZERO);

    let t = TestEngine::with_config(registry, |config| config.write_lock_timeout_secs = 1);
    let _lease = t
        .engine
        .write_queue()
        .acquire(JobId::new_v4(), "external", Duration::from_secs(1))
        .await
        .unwrap();

    let job = t.engine.runner().submit(JobType::Ingest, "acme", ingest_params()).await.unwrap();
    let job = t.wait(job.id).await;

    assert_job_state(&job, JobState::Failed);
    let error = job.error.unwrap();
    assert_eq!(error.kind, ErrorKind::WriteLockTimeout);
    assert_eq!(error.stage.as_deref(), Some("load"));
    assert_eq!(tracker.max_concurrent(), 0);
}
