//! CLI output formatting

use crate::core::artifact::Manifest;
use crate::core::job::Job;
use crate::core::state::JobState;
use crate::events::{EventType, JobEvent};
use crate::persistence::Checkpoint;
use crate::registry::ExecutionPlan;
use console::Emoji;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

// Re-export style
pub use console::style;

// Emojis for output
pub static CHECK: Emoji<'_, '_> = Emoji("✅ ", "✓ ");
pub static CROSS: Emoji<'_, '_> = Emoji("❌ ", "✗ ");
pub static SPINNER: Emoji<'_, '_> = Emoji("⏳ ", "~ ");
pub static INFO: Emoji<'_, '_> = Emoji("ℹ️  ", "i ");
pub static WARN: Emoji<'_, '_> = Emoji("⚠️  ", "!");
pub static ROCKET: Emoji<'_, '_> = Emoji("🚀 ", "> ");

/// Progress bar measured in percent
pub fn create_progress_bar() -> ProgressBar {
    let progress = ProgressBar::new(100);
    let style = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    progress.set_style(style);
    progress.enable_steady_tick(Duration::from_millis(100));
    progress
}

/// Format a job state for display
pub fn format_state(state: JobState) -> String {
    match state {
        JobState::Pending => style("PENDING").dim().to_string(),
        JobState::Running => style("RUNNING").yellow().to_string(),
        JobState::Succeeded => style("SUCCEEDED").green().to_string(),
        JobState::Failed => style("FAILED").red().to_string(),
        JobState::Cancelled => style("CANCELLED").yellow().to_string(),
        JobState::Timeout => style("TIMEOUT").magenta().to_string(),
    }
}

fn state_icon(state: JobState) -> &'static Emoji<'static, 'static> {
    match state {
        JobState::Succeeded => &CHECK,
        JobState::Failed | JobState::Timeout => &CROSS,
        JobState::Running => &SPINNER,
        JobState::Cancelled => &WARN,
        JobState::Pending => &INFO,
    }
}

fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// One-line job summary for listings
pub fn format_job_summary(job: &Job) -> String {
    format!(
        "{} {} - {} - {} - {} - {}",
        state_icon(job.state),
        style(short_id(&job.id)).dim(),
        style(job.job_type).bold(),
        style(&job.tenant_id).cyan(),
        format_state(job.state),
        style(format!("{:.0}%", job.progress * 100.0)).cyan()
    )
}

/// Format a lifecycle event for display
pub fn format_event(event: &JobEvent) -> String {
    match event.event_type {
        EventType::Created => format!(
            "{} Created {} job {}",
            ROCKET,
            style(event.job_type).bold(),
            style(short_id(&event.job_id)).dim()
        ),
        EventType::StateChanged => {
            let from = event.extra_str("from").unwrap_or("?");
            let mut line = format!(
                "{} {} → {}",
                state_icon(event.state),
                style(from).dim(),
                format_state(event.state)
            );
            if let Some(error) = event.extra_str("error") {
                line.push_str(&format!(": {}", style(error).dim()));
            }
            line
        }
        EventType::StageCompleted => {
            let stage = event.stage.as_deref().unwrap_or("?");
            let duration = event
                .extra
                .get("durationMs")
                .and_then(|d| d.as_u64())
                .map(|ms| format_duration(Duration::from_millis(ms)))
                .unwrap_or_default();
            let success = event.extra.get("success").and_then(|s| s.as_bool()).unwrap_or(false);
            if success {
                format!("{} {} {}", CHECK, style(stage).green(), style(duration).dim())
            } else {
                format!(
                    "{} {}: {}",
                    CROSS,
                    style(stage).red(),
                    style(event.extra_str("error").unwrap_or("failed")).dim()
                )
            }
        }
    }
}

/// Format a manifest, one artifact per line
pub fn format_manifest(manifest: &Manifest) -> String {
    let mut lines = Vec::new();
    for entry in &manifest.entries {
        let mut line = format!(
            "  {} {} {}",
            style(&entry.key).bold(),
            style(format!("({})", entry.stage)).dim(),
            entry.artifact.location
        );
        if let Some(size) = entry.artifact.size_bytes {
            line.push_str(&format!(" {}", style(format!("{} bytes", size)).dim()));
        }
        lines.push(line);
    }
    for conflict in &manifest.conflicts {
        lines.push(format!(
            "  {} '{}' from {} stored as '{}'",
            WARN,
            conflict.key,
            conflict.conflicting_stage,
            conflict.resolved_key
        ));
    }
    lines.join("\n")
}

/// Format the stages of an execution plan
pub fn format_plan(plan: &ExecutionPlan) -> String {
    plan.stages()
        .iter()
        .map(|stage| {
            let def = &stage.definition;
            let mut tags = vec![if def.is_core { "core" } else { "extended" }.to_string()];
            if def.writes() {
                tags.push("writes".to_string());
            }
            if let Some(flag) = &def.feature_flag {
                tags.push(format!("flag: {}", flag));
            }
            format!(
                "  {:>3}. {} {} {}",
                def.order,
                style(&def.name).bold(),
                style(def.category.as_str()).cyan(),
                style(format!("[{}]", tags.join(", "))).dim()
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn format_checkpoint(checkpoint: &Checkpoint) -> String {
    format!(
        "  {} {} {} {}",
        style(checkpoint.id).dim(),
        style(&checkpoint.stage).bold(),
        style(format!("v{}", checkpoint.snapshot.schema_version)).cyan(),
        style(checkpoint.created_at.to_rfc3339()).dim()
    )
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs == 0 {
        format!("{}ms", duration.as_millis())
    } else if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}

/// Print a job in detail
pub fn print_job_details(job: &Job) {
    println!("{} Job Details", INFO);
    println!("  ID: {}", style(job.id).cyan());
    println!("  Type: {}", style(job.job_type).bold());
    println!("  Tenant: {}", job.tenant_id);
    println!("  State: {}", format_state(job.state));
    println!(
        "  Progress: {}{}",
        style(format!("{:.0}%", job.progress * 100.0)).cyan(),
        job.stage
            .as_deref()
            .map(|stage| format!(" (stage: {})", stage))
            .unwrap_or_default()
    );
    println!("  Created: {}", style(job.created_at.to_rfc3339()).dim());
    if let Some(started) = job.started_at {
        println!("  Started: {}", style(started.to_rfc3339()).dim());
    }
    if let Some(finished) = job.finished_at {
        println!("  Finished: {}", style(finished.to_rfc3339()).dim());
    }
    if let Some(elapsed) = job.elapsed().and_then(|e| e.to_std().ok()) {
        println!("  Duration: {}", style(format_duration(elapsed)).dim());
    }
    println!("  Checkpoints: {}", job.checkpoints.len());
    if let Some(error) = &job.error {
        println!("  Error: {}", style(error).red());
    }
    if let Some(manifest) = job.manifest.as_ref().filter(|m| !m.is_empty()) {
        println!("  Artifacts:");
        println!("{}", format_manifest(manifest));
    }
}
