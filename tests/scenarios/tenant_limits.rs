//! Test: one tenant cannot take every execution slot

use crate::helpers::*;
use jobflow::{JobId, JobState, JobType, Registry};
use std::time::Duration;

async fn wait_running(t: &TestEngine, job_id: JobId) {
    let store = t.engine.store().clone();
    let running = eventually(Duration::from_secs(5), || {
        let store = store.clone();
        async move { store.get(job_id).await.unwrap().stage.is_some() }
    })
    .await;
    assert!(running, "job {} never started a stage", job_id);
}

#[tokio::test]
async fn test_busy_tenant_waits_while_others_run() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Sleep(Duration::from_millis(400)), &recorder);

    let t = TestEngine::with_config(registry, |config| {
        config.max_concurrency = 4;
        config.max_concurrency_per_tenant = Some(1);
    });
    let runner = t.engine.runner();

    let first = runner.submit(JobType::Analyze, "acme", analyze_params()).await.unwrap();
    let second = runner.submit(JobType::Analyze, "acme", analyze_params()).await.unwrap();
    let other = runner.submit(JobType::Analyze, "globex", analyze_params()).await.unwrap();

    wait_running(&t, first.id).await;
    wait_running(&t, other.id).await;

    // Global slots are free, but acme already has its one job running
    assert_eq!(runner.status(second.id).await.unwrap().state, JobState::Pending);
    assert_eq!(runner.running_for_tenant("acme"), 1);
    assert_eq!(runner.running_for_tenant("globex"), 1);

    for job in [first, second, other] {
        assert_job_state(&t.wait(job.id).await, JobState::Succeeded);
    }
    assert_eq!(recorder.count("profile"), 3);
    assert_eq!(runner.running_for_tenant("acme"), 0);
}

#[tokio::test]
async fn test_tenants_are_unlimited_by_default() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Sleep(Duration::from_millis(300)), &recorder);

    let t = TestEngine::new(registry);
    let runner = t.engine.runner();
    let first = runner.submit(JobType::Analyze, "acme", analyze_params()).await.unwrap();
    let second = runner.submit(JobType::Analyze, "acme", analyze_params()).await.unwrap();

    wait_running(&t, first.id).await;
    wait_running(&t, second.id).await;

    for job in [first, second] {
        assert_job_state(&t.wait(job.id).await, JobState::Succeeded);
    }
}
