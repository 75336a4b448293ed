//! Test: jobs and checkpoints survive a restart on the SQLite backend
#![cfg(feature = "sqlite")]

use crate::helpers::*;
use jobflow::persistence::{JobFilter, SqliteBackend};
use jobflow::{JobBackend, JobState, Registry};
use std::sync::Arc;

fn pipeline(recorder: &Recorder) -> Registry {
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, recorder);
    stage(&mut registry, "quality", false, 20, Behavior::Fail("checks table missing"), recorder);
    stage(
        &mut registry,
        "kpi",
        true,
        30,
        Behavior::Artifacts(vec!["kpi_summary", "kpi_trend"]),
        recorder,
    );
    registry
}

#[tokio::test]
async fn test_finished_job_survives_reopen() {
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("jobs.db");

    let recorder = Recorder::new();
    let backend: Arc<dyn JobBackend> = Arc::new(SqliteBackend::open(&db_path).await.unwrap());
    let t = TestEngine::on_backend(pipeline(&recorder), backend, |_| {});
    let job = t.run(analyze_params()).await;
    assert_job_state(&job, JobState::Succeeded);
    drop(t);

    let reopened: Arc<dyn JobBackend> = Arc::new(SqliteBackend::open(&db_path).await.unwrap());
    let t = TestEngine::on_backend(pipeline(&Recorder::new()), reopened, |_| {});

    let stored = t.engine.store().get(job.id).await.unwrap();
    assert_eq!(stored.state, JobState::Succeeded);
    assert_eq!(stored.params, analyze_params());
    assert_eq!(stored.result, job.result);
    assert_manifest_keys(&stored, &["profile", "kpi_summary", "kpi_trend"]);
    assert_eq!(stored.result.unwrap()["failedExtended"][0]["stage"], "quality");

    let checkpoints = t.engine.checkpoints().list(job.id).await.unwrap();
    let stages: Vec<&str> = checkpoints.iter().map(|c| c.stage.as_str()).collect();
    assert_eq!(stages, vec!["profile", "kpi"]);
    assert_eq!(stored.checkpoints, checkpoints.iter().map(|c| c.id).collect::<Vec<_>>());
    assert!(checkpoints.iter().all(|c| c.snapshot.verify()));
}

#[tokio::test]
async fn test_incomplete_jobs_are_listed_after_reopen() {
    let db_dir = tempfile::tempdir().unwrap();
    let db_path = db_dir.path().join("jobs.db");

    let backend: Arc<dyn JobBackend> = Arc::new(SqliteBackend::open(&db_path).await.unwrap());
    let t = TestEngine::on_backend(Registry::new(), backend, |_| {});
    let pending = t
        .engine
        .store()
        .create(jobflow::JobType::Analyze, "acme", analyze_params())
        .await
        .unwrap();
    let running = t
        .engine
        .store()
        .create(jobflow::JobType::Analyze, "globex", analyze_params())
        .await
        .unwrap();
    t.engine.store().start(running.id).await.unwrap();
    drop(t);

    let reopened: Arc<dyn JobBackend> = Arc::new(SqliteBackend::open(&db_path).await.unwrap());
    let t = TestEngine::on_backend(Registry::new(), reopened, |_| {});

    let mut ids: Vec<_> = t.engine.store().incomplete().await.unwrap().iter().map(|j| j.id).collect();
    ids.sort();
    let mut expected = vec![pending.id, running.id];
    expected.sort();
    assert_eq!(ids, expected);

    let globex = t.engine.store().list(&JobFilter::new().tenant("globex")).await.unwrap();
    assert_eq!(globex.len(), 1);
    assert_eq!(globex[0].state, JobState::Running);
    assert!(globex[0].started_at.is_some());
}
