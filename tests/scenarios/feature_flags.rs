//! Test: feature-flagged stages run only when their flag is on

use crate::helpers::*;
use jobflow::{GeneratorDefinition, JobState, Registry};

fn registry_with_charts(recorder: &Recorder) -> Registry {
    let mut registry = Registry::new();
    stage(&mut registry, "profile", true, 10, Behavior::Succeed, recorder);
    stage(&mut registry, "kpi", true, 20, Behavior::Succeed, recorder);
    registry
        .register(
            GeneratorDefinition::new("charts", ScriptedGenerator::new("charts", Behavior::Succeed, recorder))
                .order(60)
                .feature_flag("charts"),
        )
        .unwrap();
    registry
}

#[tokio::test]
async fn test_disabled_flag_skips_stage() {
    let recorder = Recorder::new();
    let t = TestEngine::with_config(registry_with_charts(&recorder), |config| {
        config.feature_flags.insert("charts".to_string(), false);
    });

    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Succeeded);
    assert_execution_order(&recorder, &["profile", "kpi"]);
    assert_manifest_keys(&job, &["profile", "kpi"]);
}

#[tokio::test]
async fn test_unset_flag_counts_as_disabled() {
    let recorder = Recorder::new();
    let t = TestEngine::new(registry_with_charts(&recorder));

    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Succeeded);
    assert_eq!(recorder.count("charts"), 0);
}

#[tokio::test]
async fn test_enabled_flag_runs_stage() {
    let recorder = Recorder::new();
    let t = TestEngine::with_config(registry_with_charts(&recorder), |config| {
        config.feature_flags.insert("charts".to_string(), true);
    });

    let job = t.run(analyze_params()).await;

    assert_job_state(&job, JobState::Succeeded);
    assert_execution_order(&recorder, &["profile", "kpi", "charts"]);
    assert_manifest_keys(&job, &["profile", "kpi", "charts"]);
    assert_eq!(job.checkpoints.len(), 3);
}
