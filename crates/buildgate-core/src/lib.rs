//! buildgate core library
//!
//! Domain model (triggers, matrices, pipelines, results), the run ledger,
//! and the tracing/observability helpers shared by every buildgate crate.

pub mod domain;
pub mod ledger;
pub mod obs;
pub mod telemetry;

pub use domain::{
    BuildGateError, ExpansionError, MatrixCell, MatrixDimension, Pipeline, PipelineFailure,
    PipelineResult, PipelineStatus, PipelineTemplate, Result, RunConclusion, RunId, RunKey,
    RunOutcome, RunResult, Stage, StageOutcome, StageStatus, TriggerEvent, TriggerKind,
    EXIT_CANCELLED, EXIT_FAILURE, EXIT_SUCCESS,
};

pub use ledger::{
    LedgerError, LedgerResult, MemoryRunLedger, NewRunEvent, RunEvent, RunEventKind, RunLedger,
    RunMetadata, RunRecord, RunState, RunSummary,
};

pub use telemetry::init_tracing;

pub use toolchain_manager::{ProvisionError, Provisioner, ToolchainSpec};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
