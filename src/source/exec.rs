//! Local command source.
//!
//! The declared command is split on whitespace and run directly, without a
//! shell. Per-source environment values are `${VAR}`-expanded once at
//! construction and merged over the parent environment of the child; the
//! command string itself is never expanded, so secrets only reach the child
//! through its environment.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::config::{OutputFormat, RuntimeOptions, SourceConfig, SourceKind, DEFAULT_EXEC_TIMEOUT};
use crate::error::{summarize_stderr, Result, SourceError};
use crate::security::ensure_exec_allowed;
use crate::source::format::parse_output;
use crate::source::{expand_env, Row, Source};

/// Runs a local command and parses its stdout.
#[derive(Debug, Clone)]
pub struct ExecSource {
    name: String,
    program: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    format: OutputFormat,
    delimiter: u8,
    timeout: Duration,
    working_dir: Option<PathBuf>,
}

impl ExecSource {
    /// Build an exec source, refusing unless local execution is allowed.
    pub fn new(name: &str, config: &SourceConfig, options: &RuntimeOptions) -> Result<Self> {
        ensure_exec_allowed(name, &options.security)?;
        Ok(Self::new_unchecked(name, config)?.with_working_dir(&options.base_dir))
    }

    /// Build an exec source without consulting the security policy.
    ///
    /// For tests and embedders that have already made the decision.
    pub fn new_unchecked(name: &str, config: &SourceConfig) -> Result<Self> {
        let command = config.command.as_deref().unwrap_or_default();
        let mut parts = command.split_whitespace().map(str::to_string);
        let program = parts
            .next()
            .ok_or_else(|| SourceError::config(name, "command is required"))?;

        let env = config
            .env
            .iter()
            .map(|(key, value)| (key.clone(), expand_env(value, &config.env)))
            .collect();

        Ok(Self {
            name: name.to_string(),
            program,
            args: parts.collect(),
            env,
            format: config.format.unwrap_or_default(),
            delimiter: config.delimiter_byte(),
            timeout: config.timeout_or(DEFAULT_EXEC_TIMEOUT),
            working_dir: None,
        })
    }

    /// Run the command from this directory.
    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// The per-call timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run the program with `--name value` arguments instead of the declared ones.
    ///
    /// The value `on` (an HTML checkbox) is passed as `true`. Output is always
    /// decoded as JSON.
    pub async fn fetch_with_args(&self, args: &BTreeMap<String, String>) -> Result<Vec<Row>> {
        let args: Vec<String> = args
            .iter()
            .flat_map(|(name, value)| {
                let value = if value == "on" { "true" } else { value.as_str() };
                [format!("--{name}"), value.to_string()]
            })
            .collect();
        let stdout = self.run(&args).await?;
        parse_output(&self.name, OutputFormat::Json, self.delimiter, &stdout)
    }

    async fn run(&self, args: &[String]) -> Result<Vec<u8>> {
        let mut command = tokio::process::Command::new(&self.program);
        command
            .args(args)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }

        debug!(source = %self.name, program = %self.program, "running command");
        let started = Instant::now();

        let child = command.spawn().map_err(|e| {
            SourceError::transient(&self.name, format!("failed to start {:?}: {e}", self.program))
        })?;

        // On timeout the child is dropped and killed via `kill_on_drop(true)`.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(SourceError::transient(
                    &self.name,
                    format!("failed to wait for command: {e}"),
                ))
            }
            Err(_) => {
                warn!(source = %self.name, timeout_ms = self.timeout.as_millis() as u64, "command timed out");
                return Err(SourceError::Timeout {
                    source_name: self.name.clone(),
                    timeout: self.timeout,
                });
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        if !output.status.success() {
            debug!(source = %self.name, elapsed_ms, status = %output.status, "command failed");
            return Err(SourceError::transient(
                &self.name,
                format!(
                    "command failed: {}\nstderr: {}",
                    output.status,
                    summarize_stderr(&output.stderr)
                ),
            ));
        }

        debug!(source = %self.name, elapsed_ms, bytes = output.stdout.len(), "command finished");
        Ok(output.stdout)
    }
}

#[async_trait]
impl Source for ExecSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Exec
    }

    async fn fetch(&self) -> Result<Vec<Row>> {
        let stdout = self.run(&self.args).await?;
        parse_output(&self.name, self.format, self.delimiter, &stdout)
    }
}
