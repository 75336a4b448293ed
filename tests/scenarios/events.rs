//! Test: lifecycle events for every transition and stage

use crate::helpers::*;
use jobflow::events::{EventSink, EventType};
use jobflow::{InMemoryBackend, JobBackend, JobState, Registry};
use std::sync::Arc;
use std::time::Duration;

fn two_stage_registry(recorder: &Recorder) -> Registry {
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, recorder);
    stage(&mut registry, "kpi", true, 20, Behavior::Succeed, recorder);
    registry
}

#[tokio::test]
async fn test_successful_job_event_sequence() {
    let recorder = Recorder::new();
    let t = TestEngine::new(two_stage_registry(&recorder));
    let job = t.run(analyze_params()).await;

    let events = t.events_for(job.id).await;
    let kinds: Vec<EventType> = events.iter().map(|e| e.event_type).collect();
    assert_eq!(
        kinds,
        vec![
            EventType::Created,
            EventType::StateChanged,
            EventType::StageCompleted,
            EventType::StageCompleted,
            EventType::StateChanged,
        ]
    );
    assert_valid_transitions(&events);

    let stages: Vec<&str> = events
        .iter()
        .filter(|e| e.event_type == EventType::StageCompleted)
        .map(|e| e.stage.as_deref().unwrap())
        .collect();
    assert_eq!(stages, vec!["profile", "kpi"]);

    let last = events.last().unwrap();
    assert_eq!(last.state, JobState::Succeeded);
    assert_eq!(last.progress, 1.0);
    assert!(events.iter().all(|e| e.extra_str("tenantId") == Some("acme")));
}

#[tokio::test]
async fn test_terminal_event_arrives_promptly() {
    let recorder = Recorder::new();
    let t = TestEngine::new(two_stage_registry(&recorder));
    let job = t
        .engine
        .runner()
        .submit(jobflow::JobType::Analyze, "acme", analyze_params())
        .await
        .unwrap();

    let job_id = job.id;
    let event = t
        .sink
        .wait_for(Duration::from_secs(5), |e| e.job_id == job_id && e.state.is_terminal())
        .await
        .expect("no terminal event within 5s");
    assert_eq!(event.state, JobState::Succeeded);
    assert_eq!(event.extra_str("from"), Some("RUNNING"));
}

#[tokio::test]
async fn test_failure_event_carries_error() {
    let recorder = Recorder::new();
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Fail("source unreachable"), &recorder);

    let t = TestEngine::new(registry);
    let job = t.run(analyze_params()).await;
    assert_job_state(&job, JobState::Failed);

    let events = t.events_for(job.id).await;
    assert_valid_transitions(&events);
    let failed = events
        .iter()
        .find(|e| e.event_type == EventType::StateChanged && e.state == JobState::Failed)
        .unwrap();
    assert!(failed.extra_str("error").unwrap().contains("source unreachable"));
}

#[tokio::test]
async fn test_broken_sink_does_not_affect_jobs() {
    let recorder = Recorder::new();
    let backend: Arc<dyn JobBackend> = Arc::new(InMemoryBackend::new());
    let t = TestEngine::with_sinks(
        two_stage_registry(&recorder),
        backend,
        vec![Arc::new(BrokenSink) as Arc<dyn EventSink>],
        |_| {},
    );

    let job = t.run(analyze_params()).await;
    assert_job_state(&job, JobState::Succeeded);

    // The healthy sink still saw everything
    let events = t.events_for(job.id).await;
    assert_eq!(events.len(), 5);
    assert!(t.engine.events().failed_count() >= 5);
}

#[tokio::test]
async fn test_subscribers_receive_events() {
    let recorder = Recorder::new();
    let t = TestEngine::new(two_stage_registry(&recorder));
    let mut rx = t.engine.events().subscribe();

    let job = t.run(analyze_params()).await;

    let mut seen = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if event.job_id == job.id {
            seen.push(event.event_type);
        }
    }
    assert_eq!(seen.first(), Some(&EventType::Created));
    assert_eq!(seen.len(), 5);
}
