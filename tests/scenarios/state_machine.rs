//! Test: the job store enforces the lifecycle state machine

use crate::helpers::*;
use jobflow::core::error::{EngineError, JobError, ErrorKind};
use jobflow::persistence::JobFilter;
use jobflow::{JobState, JobType, Manifest, Registry};
use serde_json::json;

#[tokio::test]
async fn test_pending_job_cannot_complete() {
    let t = TestEngine::new(Registry::new());
    let store = t.engine.store();
    let job = store.create(JobType::Analyze, "acme", analyze_params()).await.unwrap();

    let err = store.complete(job.id, json!({}), Manifest::new()).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::InvalidTransition {
            from: JobState::Pending,
            to: JobState::Succeeded,
            ..
        }
    ));
    assert_eq!(store.get(job.id).await.unwrap().state, JobState::Pending);
}

#[tokio::test]
async fn test_terminal_states_are_final() {
    let t = TestEngine::new(Registry::new());
    let store = t.engine.store();
    let job = store.create(JobType::Profile, "acme", json!({ "source_id": "pg" })).await.unwrap();
    store.start(job.id).await.unwrap();
    store
        .fail(job.id, JobError::new(ErrorKind::CoreGeneratorFailure, "boom"), None)
        .await
        .unwrap();

    assert!(store.start(job.id).await.is_err());
    assert!(store.cancel(job.id).await.is_err());
    assert!(store.timeout(job.id, None).await.is_err());
    assert!(store.advance(job.id, "profile", 0, 0.5).await.is_err());

    let job = store.get(job.id).await.unwrap();
    assert_eq!(job.state, JobState::Failed);
    assert_eq!(job.error.unwrap().message, "boom");
}

#[tokio::test]
async fn test_invalid_params_are_rejected_before_storing() {
    let t = TestEngine::new(Registry::new());
    let store = t.engine.store();

    let cases = [
        (JobType::Analyze, json!({})),
        (JobType::Analyze, json!({ "source_id": "pg", "sample_size": 5 })),
        (JobType::Kpi, json!({ "source_id": "pg" })),
        (JobType::Ingest, json!({ "source_id": "pg", "mode": "sometimes" })),
        (JobType::Analyze, json!("not an object")),
    ];
    for (job_type, params) in cases {
        let err = store.create(job_type, "acme", params.clone()).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)), "{} accepted {}", job_type, params);
    }

    assert!(store.list(&JobFilter::new()).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_progress_is_monotonic() {
    let t = TestEngine::new(Registry::new());
    let store = t.engine.store();
    let job = store.create(JobType::Analyze, "acme", analyze_params()).await.unwrap();
    store.start(job.id).await.unwrap();

    store.advance(job.id, "profile", 0, 0.6).await.unwrap();
    let job = store.advance(job.id, "kpi", 1, 0.3).await.unwrap();
    assert_eq!(job.progress, 0.6);
    assert_eq!(job.stage.as_deref(), Some("kpi"));

    let job = store.advance(job.id, "profile", 0, 0.9).await.unwrap();
    assert_eq!(job.progress, 0.9);
    assert_eq!(job.stage.as_deref(), Some("kpi"));
}

#[tokio::test]
async fn test_history_filters_by_tenant_and_state() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let done = t.run(analyze_params()).await;
    let pending = t
        .engine
        .store()
        .create(JobType::Analyze, "globex", analyze_params())
        .await
        .unwrap();

    let store = t.engine.store();
    let acme = store.list(&JobFilter::new().tenant("acme")).await.unwrap();
    assert_eq!(acme.len(), 1);
    assert_eq!(acme[0].id, done.id);

    let incomplete = store.incomplete().await.unwrap();
    assert_eq!(incomplete.len(), 1);
    assert_eq!(incomplete[0].id, pending.id);

    let succeeded = store
        .list(&JobFilter::new().state(JobState::Succeeded).limit(10))
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 1);
}
