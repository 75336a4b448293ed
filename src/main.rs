use anyhow::{Context, Result};
use jobflow::cli::commands::{
    CancelCommand, CheckpointsCommand, HistoryCommand, RecoverCommand, ResumeCommand, RunCommand, StatusCommand,
    ValidateCommand,
};
use jobflow::cli::output::*;
use jobflow::cli::{Cli, Command};
use jobflow::core::config::{EngineConfig, ResumePolicy};
use jobflow::execution::JobReport;
use jobflow::persistence::JobFilter;
use jobflow::registry::Registry;
use jobflow::{Engine, Job, JobId, JobState};
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::from_args();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("jobflow={}", default_level)));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set logging subscriber")?;

    let config = load_config(&cli)?;

    match &cli.command {
        Command::Run(cmd) => run_job(cmd, config).await?,
        Command::Validate(cmd) => validate_config(cmd, &cli, config)?,
        Command::Status(cmd) => show_status(cmd, config).await?,
        Command::History(cmd) => show_history(cmd, config).await?,
        Command::Checkpoints(cmd) => show_checkpoints(cmd, config).await?,
        Command::Cancel(cmd) => cancel_job(cmd, config).await?,
        Command::Resume(cmd) => resume_job(cmd, config).await?,
        Command::Recover(cmd) => recover_jobs(cmd, config).await?,
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let mut config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => EngineConfig::default(),
    };

    if let Some(database) = &cli.database {
        config.database = Some(database.clone());
    }
    // The CLI always keeps history so later commands can see earlier jobs
    #[cfg(feature = "sqlite")]
    if config.database.is_none() {
        config.database = Some(jobflow::persistence::store::default_database_path());
    }

    Ok(config)
}

async fn run_job(cmd: &RunCommand, config: EngineConfig) -> Result<()> {
    let engine = Engine::from_config(config).await?;
    let runner = engine.runner().clone();
    let events = engine.events().subscribe();

    let job = match cmd.max_runtime {
        Some(secs) => {
            runner
                .submit_with_max_runtime(
                    cmd.job_type,
                    &cmd.tenant,
                    cmd.params.clone(),
                    std::time::Duration::from_secs(secs),
                )
                .await?
        }
        None => runner.submit(cmd.job_type, &cmd.tenant, cmd.params.clone()).await?,
    };

    println!(
        "{} Submitted {} job {}",
        ROCKET,
        style(job.job_type).bold(),
        style(job.id).cyan()
    );

    let job = follow_job(&engine, job.id, events).await?;
    finish(&engine, job, cmd.json).await
}

/// Stream a job's events until it reaches a terminal state
///
/// Ctrl-C requests cancellation once; the job then stops at its next stage boundary.
async fn follow_job(
    engine: &Engine,
    job_id: JobId,
    mut events: tokio::sync::broadcast::Receiver<jobflow::JobEvent>,
) -> Result<Job> {
    let runner = engine.runner().clone();
    let progress = create_progress_bar();
    let wait = runner.wait(job_id);
    tokio::pin!(wait);
    let mut cancelling = false;

    let job = loop {
        tokio::select! {
            job = &mut wait => break job?,
            event = events.recv() => match event {
                Ok(event) if event.job_id == job_id => {
                    progress.set_position((event.progress * 100.0).round() as u64);
                    if let Some(stage) = &event.stage {
                        progress.set_message(stage.clone());
                    }
                    progress.println(format_event(&event));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break (&mut wait).await?,
            },
            _ = tokio::signal::ctrl_c(), if !cancelling => {
                cancelling = true;
                progress.println(format!("{} Cancelling job...", WARN));
                if let Err(e) = runner.cancel(job_id).await {
                    warn!(job_id = %job_id, "Cancel request failed: {}", e);
                }
            }
        }
    };

    progress.finish_and_clear();
    Ok(job)
}

async fn finish(engine: &Engine, job: Job, json: bool) -> Result<()> {
    engine.events().flush().await;

    if json {
        let report = JobReport::from(job.clone());
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!();
        print_job_details(&job);
    }

    if job.state == JobState::Succeeded {
        println!("\n{} Job {}", CHECK, style("succeeded").green());
        Ok(())
    } else {
        println!("\n{} Job ended as {}", CROSS, format_state(job.state));
        if let Some(err) = &job.error {
            error!(job_id = %job.id, "{}", err);
        }
        std::process::exit(1);
    }
}

fn validate_config(cmd: &ValidateCommand, cli: &Cli, config: EngineConfig) -> Result<()> {
    println!("{} Validating configuration...", INFO);

    let registry = match Registry::from_config(&config) {
        Ok(registry) => registry,
        Err(e) => {
            println!("{} Validation failed:", CROSS);
            println!("  {}", style(e).red());
            std::process::exit(1);
        }
    };

    let plan = registry.plan(&config.flags());
    println!("{} Configuration is valid!", CHECK);
    if let Some(path) = &cli.config {
        println!("  File: {}", style(path.display()).bold());
    }
    println!("  Generators: {}", style(registry.len()).cyan());
    println!("  Max concurrency: {}", style(config.max_concurrency).cyan());
    println!(
        "  Resume policy: {}",
        style(match config.resume_policy {
            ResumePolicy::Manual => "manual",
            ResumePolicy::Automatic => "automatic",
        })
        .cyan()
    );

    if plan.is_empty() {
        println!("{} No stages enabled", WARN);
    } else {
        println!("  Execution plan:");
        println!("{}", format_plan(&plan));
    }

    if cmd.json {
        let json = serde_json::to_string_pretty(&config)?;
        println!("\n{}", json);
    }
    Ok(())
}

async fn show_status(cmd: &StatusCommand, config: EngineConfig) -> Result<()> {
    let engine = Engine::with_registry(config, Registry::new()).await?;
    let job = engine.runner().status(cmd.job_id).await?;

    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&job)?);
    } else {
        print_job_details(&job);
    }
    Ok(())
}

async fn show_history(cmd: &HistoryCommand, config: EngineConfig) -> Result<()> {
    let engine = Engine::with_registry(config, Registry::new()).await?;

    let mut filter = JobFilter::new().limit(cmd.limit);
    if let Some(tenant) = &cmd.tenant {
        filter = filter.tenant(tenant.clone());
    }
    if let Some(state) = cmd.state {
        filter = filter.state(state);
    }
    let jobs = engine.store().list(&filter).await?;

    if cmd.json {
        let data = serde_json::json!({ "jobs": jobs });
        println!("{}", serde_json::to_string_pretty(&data)?);
        return Ok(());
    }

    if jobs.is_empty() {
        println!("{} No jobs found", INFO);
        return Ok(());
    }

    println!("{} Job history (showing latest {}):", INFO, cmd.limit);
    for job in &jobs {
        println!("  {}", format_job_summary(job));
    }
    Ok(())
}

async fn show_checkpoints(cmd: &CheckpointsCommand, config: EngineConfig) -> Result<()> {
    let engine = Engine::with_registry(config, Registry::new()).await?;
    // Fail with JobNotFound rather than an empty list
    engine.store().get(cmd.job_id).await?;
    let checkpoints = engine.checkpoints().list(cmd.job_id).await?;

    if checkpoints.is_empty() {
        println!("{} No checkpoints for job {}", INFO, cmd.job_id);
        return Ok(());
    }

    println!("{} Checkpoints for job {}:", INFO, style(cmd.job_id).cyan());
    for checkpoint in &checkpoints {
        println!("{}", format_checkpoint(checkpoint));
    }
    Ok(())
}

async fn cancel_job(cmd: &CancelCommand, config: EngineConfig) -> Result<()> {
    let engine = Engine::with_registry(config, Registry::new()).await?;
    let job = engine.runner().cancel(cmd.job_id).await?;
    engine.events().flush().await;

    println!(
        "{} Job {} is {}",
        INFO,
        style(job.id).cyan(),
        format_state(job.state)
    );
    Ok(())
}

async fn resume_job(cmd: &ResumeCommand, config: EngineConfig) -> Result<()> {
    let engine = Engine::from_config(config).await?;
    let events = engine.events().subscribe();

    match engine.runner().resume(cmd.job_id, cmd.checkpoint).await? {
        Some(point) => println!(
            "{} Resuming after {} (next: {})",
            ROCKET,
            style(&point.checkpoint.stage).bold(),
            style(point.next_stage.as_deref().unwrap_or("none")).cyan()
        ),
        None => println!("{} No checkpoint found; restarting from the first stage", ROCKET),
    }

    let job = follow_job(&engine, cmd.job_id, events).await?;
    finish(&engine, job, cmd.json).await
}

async fn recover_jobs(cmd: &RecoverCommand, mut config: EngineConfig) -> Result<()> {
    if cmd.automatic {
        config.resume_policy = ResumePolicy::Automatic;
    }
    let engine = Engine::from_config(config).await?;
    let report = engine.runner().recover().await?;

    if report.incomplete.is_empty() {
        println!("{} No incomplete jobs", CHECK);
        return Ok(());
    }

    println!("{} Incomplete jobs:", WARN);
    for job in &report.incomplete {
        println!("  {}", format_job_summary(job));
    }

    for (job_id, reason) in &report.failed {
        println!("{} Could not resume {}: {}", CROSS, style(job_id).dim(), style(reason).red());
    }

    if report.resumed.is_empty() {
        println!("\n{} Run with --automatic or `resume --job-id ID` to continue them", INFO);
        return Ok(());
    }

    let mut failed = 0;
    for job_id in &report.resumed {
        let job = engine.runner().wait(*job_id).await?;
        if job.state != JobState::Succeeded {
            failed += 1;
        }
        println!("  {}", format_job_summary(&job));
    }
    engine.events().flush().await;

    if failed > 0 {
        println!("\n{} {} resumed job(s) did not succeed", CROSS, failed);
        std::process::exit(1);
    }
    println!("\n{} Resumed {} job(s)", CHECK, report.resumed.len());
    Ok(())
}
