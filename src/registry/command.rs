//! Subprocess-backed generators
//!
//! External analytics modules run as child processes. The serialized
//! `GeneratorContext` is written to stdin and a JSON `GeneratorOutput` is
//! read back from stdout.

use crate::core::config::{EngineConfig, GeneratorConfig};
use crate::core::context::GeneratorContext;
use crate::core::error::{EngineError, Result};
use crate::registry::{Generator, GeneratorDefinition, GeneratorOutput, Registry};
use anyhow::{bail, Context};
use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Generator that delegates to an external program
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandGenerator {
    /// # Arguments
    /// * `program` - Executable to spawn
    /// * `args` - Arguments passed verbatim
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: None,
        }
    }

    /// Build from a `[program, args...]` list
    pub fn from_command(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EngineError::Config("command must not be empty".to_string()))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    async fn run(&self, ctx: &GeneratorContext) -> anyhow::Result<GeneratorOutput> {
        let input = serde_json::to_vec(ctx).context("Failed to serialize generator context")?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("JOBFLOW_JOB_ID", ctx.job_id.to_string())
            .env("JOBFLOW_STAGE", &ctx.stage)
            .env("JOBFLOW_ARTIFACT_ROOT", &ctx.artifact_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", self.program))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&input)
                .await
                .context("Failed to write generator context to stdin")?;
            // Dropping stdin closes the pipe so the child sees EOF
        }

        let output = child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for '{}'", self.program))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let exit_code = output.status.code().unwrap_or(-1);
            warn!(stage = %ctx.stage, "{} exited with code {}: {}", self.program, exit_code, stderr.trim());
            bail!("{} exited with code {}: {}", self.program, exit_code, stderr.trim());
        }

        debug!(stage = %ctx.stage, "{} returned {} bytes", self.program, output.stdout.len());

        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("{} did not print a valid generator output", self.program))
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    async fn generate(&self, ctx: &GeneratorContext) -> anyhow::Result<GeneratorOutput> {
        match self.timeout {
            Some(limit) => timeout(limit, self.run(ctx))
                .await
                .map_err(|_| anyhow::anyhow!("{} timed out after {}s", self.program, limit.as_secs()))?,
            None => self.run(ctx).await,
        }
    }
}

impl GeneratorDefinition {
    /// Definition backed by a `CommandGenerator`
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        let mut generator = CommandGenerator::from_command(&config.command)?;
        if let Some(secs) = config.timeout_secs {
            generator = generator.with_timeout(Duration::from_secs(secs));
        }

        let mut definition = GeneratorDefinition::new(config.name.clone(), Arc::new(generator))
            .order(config.order)
            .category(config.category)
            .snapshot_version(config.snapshot_version);
        if config.core {
            definition = definition.core();
        }
        if let Some(flag) = &config.feature_flag {
            definition = definition.feature_flag(flag.clone());
        }
        if config.writes_store {
            definition = definition.writes_store();
        }
        if let Some(description) = &config.description {
            definition = definition.description(description.clone());
        }
        if let Some(params) = &config.params {
            definition = definition.params(params.clone());
        }
        Ok(definition)
    }
}

impl Registry {
    /// Registry of subprocess generators declared in the engine config
    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut registry = Registry::new();
        for generator in &config.generators {
            registry.register(GeneratorDefinition::from_config(generator)?)?;
        }
        Ok(registry)
    }
}
