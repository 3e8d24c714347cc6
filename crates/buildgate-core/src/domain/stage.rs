//! Stage definitions and outcomes.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One named command within a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stage {
    /// Stage name, unique within its pipeline.
    pub name: String,

    /// Command to execute (first element is the executable).
    pub command: Vec<String>,

    /// Extra environment for this stage.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Record a failure but keep running later stages.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Timeout in seconds, enforced by the process executor.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Stage {
    pub fn new<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            env: BTreeMap::new(),
            continue_on_failure: false,
            timeout_secs: None,
        }
    }

    /// Let the pipeline continue past a failure of this stage.
    pub fn allow_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }

    /// Command rendered as a single line, for logs and reports.
    pub fn command_line(&self) -> String {
        self.command.join(" ")
    }
}

/// Terminal state of a single stage.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    /// Never executed (earlier abort, provisioning failure or cancellation).
    Skipped,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Passed => write!(f, "passed"),
            StageStatus::Failed => write!(f, "failed"),
            StageStatus::Skipped => write!(f, "skipped"),
        }
    }
}

/// Recorded result of one stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageOutcome {
    pub stage: String,
    pub command: String,
    pub status: StageStatus,

    /// Process exit code; `None` when the stage never ran.
    pub exit_code: Option<i32>,

    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    pub continue_on_failure: bool,
}

impl StageOutcome {
    /// Outcome for an executed stage; passes only on exit code 0.
    pub fn executed(
        stage: &Stage,
        exit_code: i32,
        stdout: String,
        stderr: String,
        duration_ms: u64,
    ) -> Self {
        let status = if exit_code == 0 {
            StageStatus::Passed
        } else {
            StageStatus::Failed
        };
        Self {
            stage: stage.name.clone(),
            command: stage.command_line(),
            status,
            exit_code: Some(exit_code),
            stdout,
            stderr,
            duration_ms,
            continue_on_failure: stage.continue_on_failure,
        }
    }

    /// Outcome for a stage that never ran.
    pub fn skipped(stage: &Stage) -> Self {
        Self {
            stage: stage.name.clone(),
            command: stage.command_line(),
            status: StageStatus::Skipped,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: 0,
            continue_on_failure: stage.continue_on_failure,
        }
    }

    pub fn passed(&self) -> bool {
        self.status == StageStatus::Passed
    }

    pub fn failed(&self) -> bool {
        self.status == StageStatus::Failed
    }
}
