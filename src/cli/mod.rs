//! Command-line interface

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use commands::{
    CancelCommand, CheckpointsCommand, HistoryCommand, RecoverCommand, ResumeCommand, RunCommand, StatusCommand,
    ValidateCommand,
};
use std::ffi::OsString;
use std::path::PathBuf;

/// Durable job runner for analytics generator pipelines
#[derive(Debug, Parser, Clone)]
#[command(name = "jobflow")]
#[command(version)]
#[command(about = "Run analytics jobs through a checkpointed generator pipeline", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Path to engine configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Job database (overrides the config file)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,
}

/// Available commands
#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Submit a job and follow it to completion
    Run(RunCommand),

    /// Validate the configuration and show the execution plan
    Validate(ValidateCommand),

    /// Show one job
    Status(StatusCommand),

    /// List recent jobs
    History(HistoryCommand),

    /// List a job's checkpoints
    Checkpoints(CheckpointsCommand),

    /// Cancel a job
    Cancel(CancelCommand),

    /// Resume an incomplete job from a checkpoint
    Resume(ResumeCommand),

    /// Find and optionally resume jobs left incomplete by a crash
    Recover(RecoverCommand),
}

impl Cli {
    /// Parse CLI arguments from environment
    pub fn from_args() -> Self {
        Self::parse()
    }

    /// Parse CLI arguments from a slice
    pub fn try_parse_from<I, T>(itr: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        <Self as Parser>::try_parse_from(itr)
    }
}
