//! Test: jobs exceeding their maximum runtime end in TIMEOUT

use crate::helpers::*;
use jobflow::core::error::ErrorKind;
use jobflow::{JobBackend, JobState, JobType, Registry};
use std::time::Duration;

#[tokio::test]
async fn test_long_stage_times_out_and_keeps_artifacts() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "kpi", true, 20, Behavior::Sleep(Duration::from_secs(30)), &recorder);
    stage(&mut registry, "report", false, 30, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let job = t
        .engine
        .runner()
        .submit_with_max_runtime(JobType::Analyze, "acme", analyze_params(), Duration::from_secs(1))
        .await
        .unwrap();
    let job = t.wait(job.id).await;

    assert_job_state(&job, JobState::Timeout);
    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::JobTimeout);
    assert_eq!(error.stage.as_deref(), Some("kpi"));

    assert_manifest_keys(&job, &["profile"]);
    assert_eq!(recorder.count("report"), 0);
    assert!(job.result.is_none());
}

#[tokio::test]
async fn test_waiting_for_write_lock_counts_against_runtime() {
    let tracker = WriteTracker::default();
    let mut registry = Registry::new();
    write_stage(&mut registry, "load", 10, &tracker, Duration::from_secs(4));

    // Lock timeout is longer than the job's runtime budget
    let t = TestEngine::with_config(registry, |config| {
        config.write_lock_timeout_secs = 30;
    });

    let holder = t.engine.runner().submit(JobType::Ingest, "acme", ingest_params()).await.unwrap();
    let queue = t.engine.write_queue().clone();
    assert!(eventually(Duration::from_secs(2), || {
        let queue = queue.clone();
        async move { queue.is_held() }
    })
    .await);

    let waiter = t
        .engine
        .runner()
        .submit_with_max_runtime(JobType::Ingest, "acme", ingest_params(), Duration::from_secs(1))
        .await
        .unwrap();

    let waiter = t.wait(waiter.id).await;
    assert_job_state(&waiter, JobState::Timeout);
    assert_eq!(waiter.error.unwrap().kind, ErrorKind::JobTimeout);

    assert_job_state(&t.wait(holder.id).await, JobState::Succeeded);
}

#[tokio::test]
async fn test_resumed_job_keeps_its_original_budget() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "kpi", true, 20, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let store = t.engine.store();
    let job = store
        .create_with_max_runtime(JobType::Analyze, "acme", analyze_params(), Duration::from_secs(2))
        .await
        .unwrap();
    store.start(job.id).await.unwrap();

    // A previous process started it long ago and died
    let mut stale = store.get(job.id).await.unwrap();
    stale.started_at = Some(chrono::Utc::now() - chrono::Duration::seconds(10));
    t.backend.save_job(&stale).await.unwrap();

    t.engine.runner().resume(job.id, None).await.unwrap();
    let job = t.wait(job.id).await;

    assert_job_state(&job, JobState::Timeout);
    assert_eq!(job.error.unwrap().kind, ErrorKind::JobTimeout);
    assert!(recorder.calls().is_empty());
}

#[tokio::test]
async fn test_fast_jobs_finish_within_budget() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Sleep(Duration::from_millis(50)), &recorder);

    let t = TestEngine::new(registry);
    let job = t
        .engine
        .runner()
        .submit_with_max_runtime(JobType::Analyze, "acme", analyze_params(), Duration::from_secs(5))
        .await
        .unwrap();

    assert_job_state(&t.wait(job.id).await, JobState::Succeeded);
}
