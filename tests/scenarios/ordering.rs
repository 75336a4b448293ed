//! Test: stage ordering is ascending by order, ties by registration

use crate::helpers::*;
use jobflow::{JobState, Registry};

#[tokio::test]
async fn test_ties_run_in_registration_order() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "a", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "b", true, 20, Behavior::Succeed, &recorder);
    stage(&mut registry, "c", true, 10, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Succeeded);
    assert_execution_order(&recorder, &["a", "c", "b"]);
    assert_manifest_keys(&job, &["a", "c", "b"]);
}

#[tokio::test]
async fn test_order_is_stable_across_engines() {
    // Two engines built from the same registration list agree on the plan
    let build = || {
        let recorder = Recorder::new();
        let mut registry = Registry::new();
        for (name, order) in [("kpi", 20), ("profile", 10), ("charts", 60), ("quality", 10)] {
            stage(&mut registry, name, false, order, Behavior::Succeed, &recorder);
        }
        TestEngine::new(registry)
    };

    let first = build();
    let second = build();
    assert_eq!(first.engine.plan().names(), vec!["profile", "quality", "kpi", "charts"]);
    assert_eq!(first.engine.plan().names(), second.engine.plan().names());
}

#[tokio::test]
async fn test_later_stages_see_upstream_state() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, &recorder);
    stage(&mut registry, "kpi", true, 20, Behavior::Succeed, &recorder);

    let t = TestEngine::new(registry);
    let job = t.run(analyze_params()).await;
    assert_job_state(&job, JobState::Succeeded);

    // kpi's snapshot state lists profile as upstream
    let checkpoints = t.engine.checkpoints().list(job.id).await.unwrap();
    let last = checkpoints.last().unwrap();
    let snapshot: jobflow::execution::StageSnapshot = last.snapshot.decode().unwrap();
    assert_eq!(snapshot.stage_states["kpi"]["upstream"], serde_json::json!(["profile"]));
}
