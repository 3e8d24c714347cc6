//! Domain model for buildgate runs.
//!
//! A [`TriggerEvent`] starts a run identified by a [`RunKey`]; the run's
//! [`PipelineTemplate`] is expanded over [`MatrixDimension`]s into one
//! [`Pipeline`] per [`MatrixCell`]; each pipeline yields a
//! [`PipelineResult`], aggregated into a [`RunResult`].

pub mod error;
pub mod matrix;
pub mod pipeline;
pub mod run;
pub mod stage;
pub mod trigger;

pub use error::{BuildGateError, ExpansionError, Result};
pub use matrix::{MatrixCell, MatrixDimension};
pub use pipeline::{Pipeline, PipelineFailure, PipelineResult, PipelineStatus, PipelineTemplate};
pub use run::{
    RunConclusion, RunId, RunOutcome, RunResult, EXIT_CANCELLED, EXIT_FAILURE, EXIT_SUCCESS,
};
pub use stage::{Stage, StageOutcome, StageStatus};
pub use trigger::{RunKey, TriggerEvent, TriggerKind};
