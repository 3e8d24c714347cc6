//! Process execution for stages.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

/// One command to run on behalf of a stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Command to execute (first element is the executable).
    pub command: Vec<String>,
    pub working_dir: PathBuf,
    /// Added to the inherited environment.
    pub env: BTreeMap<String, String>,
    pub timeout: Option<Duration>,
}

/// Captured result of a process that ran to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code; -1 when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// The process could not be run to completion.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("empty command")]
    EmptyCommand,

    #[error("failed to spawn {program:?}: {message}")]
    Spawn { program: String, message: String },

    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },
}

/// Runs stage commands.
#[async_trait]
pub trait ProcessExecutor: Send + Sync {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutput, ExecError>;
}

/// Executor backed by `tokio::process`.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    default_timeout: Option<Duration>,
}

impl CommandExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timeout applied to requests that carry none of their own.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ProcessExecutor for CommandExecutor {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        let (exe, args) = request
            .command
            .split_first()
            .ok_or(ExecError::EmptyCommand)?;

        let child = Command::new(exe)
            .args(args)
            .current_dir(&request.working_dir)
            .envs(&request.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Spawn {
                program: exe.clone(),
                message: e.to_string(),
            })?;

        // Dropping the wait future on timeout drops the child, which kills it.
        let output = match request.timeout.or(self.default_timeout) {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| ExecError::Timeout {
                    secs: limit.as_secs(),
                })?,
            None => child.wait_with_output().await,
        }
        .map_err(|e| ExecError::Spawn {
            program: exe.clone(),
            message: e.to_string(),
        })?;

        Ok(ExecOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}
