//! Test: core failures abort the job, extended failures are isolated

use crate::helpers::*;
use jobflow::core::error::ErrorKind;
use jobflow::{JobState, Registry};

#[tokio::test]
async fn test_core_failure_aborts_and_keeps_prior_artifacts() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "kpi", true, 20, Behavior::Fail("division by zero in kpi"), &recorder);
    stage(&mut registry, "charts", false, 60, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Failed);
    assert_execution_order(&recorder, &["profile", "kpi"]);
    assert_eq!(recorder.count("charts"), 0);

    let error = job.error.as_ref().unwrap();
    assert_eq!(error.kind, ErrorKind::CoreGeneratorFailure);
    assert_eq!(error.stage.as_deref(), Some("kpi"));
    assert!(error.message.contains("division by zero"));

    assert_manifest_keys(&job, &["profile"]);
    assert!(job.result.is_none());
    assert!(job.finished_at.is_some());
}

#[tokio::test]
async fn test_extended_failures_do_not_fail_the_job() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "charts", false, 30, Behavior::Fail("renderer crashed"), &recorder);
    stage(&mut registry, "insights", false, 40, Behavior::Panic, &recorder);
    stage(&mut registry, "kpi", true, 50, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Succeeded);
    assert_execution_order(&recorder, &["profile", "charts", "insights", "kpi"]);
    assert_manifest_keys(&job, &["profile", "kpi"]);

    let result = job.result.unwrap();
    let failed: Vec<&str> = result["failedExtended"]
        .as_array()
        .unwrap()
        .iter()
        .map(|f| f["stage"].as_str().unwrap())
        .collect();
    assert_eq!(failed, vec!["charts", "insights"]);

    let events = t.events_for(job.id).await;
    let failures: Vec<_> = events
        .iter()
        .filter(|e| e.extra.get("success") == Some(&serde_json::Value::Bool(false)))
        .collect();
    assert_eq!(failures.len(), 2);
    assert_eq!(failures[0].extra_str("error"), Some("renderer crashed"));
    assert_eq!(failures[1].extra_str("error"), Some("generator panicked"));
}

#[tokio::test]
async fn test_first_failing_core_stage_is_reported() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "ingest", true, 5, Behavior::Fail("source unreachable"), &recorder);
    stage(&mut registry, "profile", true, 10, Behavior::Fail("never runs"), &recorder);

    let t = TestEngine::new(registry);
    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Failed);
    assert_eq!(job.error.unwrap().stage.as_deref(), Some("ingest"));
    assert_eq!(recorder.count("profile"), 0);
    // Nothing succeeded, so nothing was checkpointed
    assert!(job.checkpoints.is_empty());
}
