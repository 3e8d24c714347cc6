//! Run identity, aggregate run results and run outcomes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::error::{BuildGateError, Result};
use crate::domain::pipeline::{PipelineResult, PipelineStatus};
use crate::domain::trigger::{RunKey, TriggerEvent, TriggerKind};

/// Process exit code for a run where every pipeline passed.
pub const EXIT_SUCCESS: i32 = 0;
/// Process exit code for a run with at least one failed pipeline.
pub const EXIT_FAILURE: i32 = 1;
/// Process exit code for a run abandoned because a newer run superseded it.
pub const EXIT_CANCELLED: i32 = 2;

/// Unique identifier for one run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        RunId(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Aggregate pass/fail of a completed run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunConclusion {
    Success,
    Failure,
}

impl std::fmt::Display for RunConclusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunConclusion::Success => write!(f, "success"),
            RunConclusion::Failure => write!(f, "failure"),
        }
    }
}

/// Result of a run whose pipelines all terminated without the run being
/// superseded. Never mutated after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunResult {
    pub run_id: RunId,
    pub run_key: RunKey,
    pub workflow: String,
    pub event: TriggerEvent,
    pub conclusion: RunConclusion,
    /// Pipeline results in matrix order.
    pub pipelines: Vec<PipelineResult>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    /// Aggregate pipeline results: success only if every pipeline passed.
    pub fn from_pipelines(
        run_id: RunId,
        run_key: RunKey,
        workflow: impl Into<String>,
        event: TriggerEvent,
        pipelines: Vec<PipelineResult>,
        started_at: DateTime<Utc>,
    ) -> Self {
        let conclusion = if pipelines.iter().all(|p| p.status == PipelineStatus::Passed) {
            RunConclusion::Success
        } else {
            RunConclusion::Failure
        };
        let finished_at = Utc::now();
        let duration_ms = (finished_at - started_at).num_milliseconds().max(0) as u64;

        Self {
            run_id,
            run_key,
            workflow: workflow.into(),
            event,
            conclusion,
            pipelines,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.conclusion == RunConclusion::Success
    }

    /// 0 when every pipeline passed, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            EXIT_SUCCESS
        } else {
            EXIT_FAILURE
        }
    }

    pub fn passed_count(&self) -> usize {
        self.pipelines.iter().filter(|p| p.passed()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.pipelines.len() - self.passed_count()
    }

    /// First failing pipeline in matrix order.
    pub fn first_failure(&self) -> Option<&PipelineResult> {
        self.pipelines.iter().find(|p| !p.passed())
    }
}

/// What a call to start a run produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// All pipelines terminated; the run is reported.
    Completed(RunResult),
    /// Superseded by a newer run for the same key. No result is reported.
    Cancelled { run_id: RunId, run_key: RunKey },
    /// The workflow does not trigger on this kind of event.
    Ignored { kind: TriggerKind },
}

impl RunOutcome {
    pub fn result(&self) -> Option<&RunResult> {
        match self {
            RunOutcome::Completed(result) => Some(result),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, RunOutcome::Cancelled { .. })
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Completed(result) => result.exit_code(),
            RunOutcome::Cancelled { .. } => EXIT_CANCELLED,
            RunOutcome::Ignored { .. } => EXIT_SUCCESS,
        }
    }

    /// A successful completed run, or the reason there is none.
    ///
    /// Ignored events are reported as `Ok(None)`.
    pub fn into_result(self) -> Result<Option<RunResult>> {
        match self {
            RunOutcome::Completed(result) => {
                let failure = result.first_failure().and_then(|p| p.error());
                match failure {
                    Some(err) => Err(err),
                    None => Ok(Some(result)),
                }
            }
            RunOutcome::Cancelled { run_key, .. } => Err(BuildGateError::Cancelled {
                run_key: run_key.to_string(),
            }),
            RunOutcome::Ignored { .. } => Ok(None),
        }
    }
}
