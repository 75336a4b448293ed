//! CLI command definitions

use crate::core::job::JobType;
use crate::core::state::JobState;
use clap::Args;
use serde_json::Value;
use uuid::Uuid;

/// Submit a job and follow it
#[derive(Debug, Args, Clone)]
pub struct RunCommand {
    /// Job type (ingest, profile, quality, kpi, analyze, preset)
    #[arg(short = 't', long = "type", value_parser = parse_job_type)]
    pub job_type: JobType,

    /// Tenant the job belongs to
    #[arg(long)]
    pub tenant: String,

    /// Job parameters as a JSON object
    #[arg(short, long, value_parser = parse_json, default_value = "{}")]
    pub params: Value,

    /// Maximum runtime in seconds (defaults to the engine setting)
    #[arg(long)]
    pub max_runtime: Option<u64>,

    /// Print the final job report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Validate the engine configuration
#[derive(Debug, Args, Clone)]
pub struct ValidateCommand {
    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// Show one job
#[derive(Debug, Args, Clone)]
pub struct StatusCommand {
    #[arg(long)]
    pub job_id: Uuid,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List recent jobs
#[derive(Debug, Args, Clone)]
pub struct HistoryCommand {
    /// Tenant to filter by
    #[arg(long)]
    pub tenant: Option<String>,

    /// State to filter by
    #[arg(long, value_parser = parse_state)]
    pub state: Option<JobState>,

    /// Number of recent jobs to show
    #[arg(short, long, default_value_t = 10)]
    pub limit: usize,

    /// Output in JSON format
    #[arg(long)]
    pub json: bool,
}

/// List a job's checkpoints
#[derive(Debug, Args, Clone)]
pub struct CheckpointsCommand {
    #[arg(long)]
    pub job_id: Uuid,
}

/// Cancel a job
#[derive(Debug, Args, Clone)]
pub struct CancelCommand {
    #[arg(long)]
    pub job_id: Uuid,
}

/// Resume a job
#[derive(Debug, Args, Clone)]
pub struct ResumeCommand {
    #[arg(long)]
    pub job_id: Uuid,

    /// Checkpoint to resume from (defaults to the latest)
    #[arg(long)]
    pub checkpoint: Option<Uuid>,

    /// Print the final job report as JSON
    #[arg(long)]
    pub json: bool,
}

/// Recover incomplete jobs
#[derive(Debug, Args, Clone)]
pub struct RecoverCommand {
    /// Resume every incomplete job instead of only listing them
    #[arg(long)]
    pub automatic: bool,
}

pub fn parse_job_type(s: &str) -> Result<JobType, String> {
    s.parse().map_err(|e: crate::core::error::EngineError| e.to_string())
}

pub fn parse_state(s: &str) -> Result<JobState, String> {
    s.parse().map_err(|e: crate::core::error::EngineError| e.to_string())
}

/// Parse a JSON object argument
pub fn parse_json(s: &str) -> Result<Value, String> {
    let value: Value = serde_json::from_str(s).map_err(|e| format!("Invalid JSON: {}", e))?;
    if !value.is_object() {
        return Err("Parameters must be a JSON object".to_string());
    }
    Ok(value)
}
