//! Run ledger: append-only record of run lifecycle and stage outcomes.
//!
//! The coordinator opens a ledger run per started run, every pipeline
//! appends its events concurrently, and the run is closed exactly once as
//! succeeded, failed or cancelled. An in-memory implementation is provided
//! in [`memory`].

pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{RunId, RunKey, TriggerEvent};

pub use memory::MemoryRunLedger;

/// Errors produced by ledger backends.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("run not found: {run_id}")]
    RunNotFound { run_id: String },

    #[error("run {run_id} is {state}, expected {expected}")]
    InvalidRunState {
        run_id: String,
        state: String,
        expected: String,
    },
}

/// Result type for ledger operations
pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

/// Metadata attached to a run at creation time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub workflow: String,
    /// Digest of the workflow's ordered stage names.
    pub workflow_digest: String,
    pub run_key: RunKey,
    pub event: TriggerEvent,
    /// Expanded pipeline names, in matrix order.
    pub pipelines: Vec<String>,
}

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    PipelineStarted,
    ToolchainReady,
    ToolchainFailed,
    StageStarted,
    StagePassed,
    StageFailed,
    StageSkipped,
    PipelineFinished,
    PipelineCancelled,
}

impl RunEventKind {
    /// Terminal stage event kinds.
    pub fn is_stage_terminal(&self) -> bool {
        matches!(
            self,
            RunEventKind::StagePassed | RunEventKind::StageFailed | RunEventKind::StageSkipped
        )
    }
}

/// An event to append; the ledger assigns `seq` and `timestamp`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRunEvent {
    pub kind: RunEventKind,
    pub pipeline: String,
    pub stage: Option<String>,
    pub payload: serde_json::Value,
}

impl NewRunEvent {
    pub fn pipeline(kind: RunEventKind, pipeline: &str, payload: serde_json::Value) -> Self {
        Self {
            kind,
            pipeline: pipeline.to_string(),
            stage: None,
            payload,
        }
    }

    pub fn stage(
        kind: RunEventKind,
        pipeline: &str,
        stage: &str,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            kind,
            pipeline: pipeline.to_string(),
            stage: Some(stage.to_string()),
            payload,
        }
    }
}

/// A recorded event in a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEvent {
    /// Monotonic sequence number within the run, starting at 1
    pub seq: u64,
    pub kind: RunEventKind,
    pub pipeline: String,
    pub stage: Option<String>,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Lifecycle state of a ledger run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for RunState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunState::Running => write!(f, "running"),
            RunState::Succeeded => write!(f, "succeeded"),
            RunState::Failed => write!(f, "failed"),
            RunState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary produced when a run closes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub total_events: u64,
    pub duration_ms: u64,
    pub passed_pipelines: usize,
    pub failed_pipelines: usize,
}

/// Full run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub metadata: RunMetadata,
    pub state: RunState,
    pub summary: Option<RunSummary>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Execution run ledger.
///
/// Guarantees:
/// - Events are ordered by a monotonic `seq` within a run, assigned on append.
/// - A run transitions: Running → Succeeded | Failed | Cancelled (terminal).
/// - Closed runs reject further events.
#[async_trait]
pub trait RunLedger: Send + Sync {
    /// Open a run, returning its ID.
    async fn create_run(&self, metadata: RunMetadata) -> LedgerResult<RunId>;

    /// Append an event to a running run, returning its sequence number.
    async fn append_event(&self, run_id: &RunId, event: NewRunEvent) -> LedgerResult<u64>;

    /// Close a running run in the given terminal state.
    async fn finish_run(
        &self,
        run_id: &RunId,
        state: RunState,
        summary: RunSummary,
    ) -> LedgerResult<()>;

    async fn get_run(&self, run_id: &RunId) -> LedgerResult<RunRecord>;

    /// All events for a run, ordered by seq.
    async fn get_events(&self, run_id: &RunId) -> LedgerResult<Vec<RunEvent>>;

    /// Runs, oldest first, optionally filtered by run key.
    async fn list_runs(&self, run_key: Option<&RunKey>) -> LedgerResult<Vec<RunRecord>>;
}
