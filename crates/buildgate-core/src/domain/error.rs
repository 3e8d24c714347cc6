//! Domain-level error taxonomy for buildgate.

use toolchain_manager::ProvisionError;

use crate::ledger::LedgerError;

/// Errors produced while expanding a matrix into pipelines.
///
/// Any of these is fatal to the whole run before a pipeline starts.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExpansionError {
    #[error("matrix dimension {dimension:?} has no values")]
    EmptyDimension { dimension: String },

    #[error("matrix dimension name must not be empty")]
    EmptyDimensionName,

    #[error("matrix dimension {dimension:?} is declared more than once")]
    DuplicateDimension { dimension: String },

    #[error("matrix dimension {dimension:?} lists value {value:?} more than once")]
    DuplicateValue { dimension: String, value: String },

    #[error("malformed matrix dimension {spec:?}: expected name=v1,v2")]
    MalformedDimension { spec: String },

    #[error("expanded pipeline {pipeline:?} is invalid: {reason}")]
    InvalidPipeline { pipeline: String, reason: String },
}

/// buildgate domain errors.
#[derive(Debug, thiserror::Error)]
pub enum BuildGateError {
    #[error("stage {stage:?} in pipeline {pipeline:?} failed with exit code {exit_code}")]
    StageFailure {
        pipeline: String,
        stage: String,
        exit_code: i32,
    },

    #[error("toolchain provisioning failed: {0}")]
    Provision(#[from] ProvisionError),

    #[error("pipeline {pipeline:?} aborted: {message}")]
    PipelineAborted { pipeline: String, message: String },

    #[error("run {run_key} was cancelled: superseded by a newer run")]
    Cancelled { run_key: String },

    #[error("matrix expansion failed: {0}")]
    Expansion(#[from] ExpansionError),

    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),

    #[error("unknown trigger kind: {0}")]
    UnknownTrigger(String),

    #[error("ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for buildgate domain operations.
pub type Result<T> = std::result::Result<T, BuildGateError>;
