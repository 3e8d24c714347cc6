//! buildgate CI - matrix pipelines with superseding runs
//!
//! Provides the execution side of buildgate:
//! - Expands a workflow's pipeline template over its matrix
//! - Runs each pipeline's stages in order with fail-fast semantics
//! - Cancels older runs for the same run key when a newer one starts
//! - Records every stage outcome in the run ledger and gates on it

pub mod coordinator;
pub mod gate;
pub mod governor;
pub mod matrix;
pub mod pipeline;
pub mod runner;
pub mod setup;
pub mod stage;
pub mod workflow;

// Re-export key types
pub use coordinator::{CoordinatorConfig, RunCoordinator};
pub use gate::{GateVerdict, RunGate};
pub use governor::{ConcurrencyGovernor, RunLease};
pub use matrix::MatrixExpander;
pub use pipeline::{PipelineRunner, RunContext};
pub use runner::{CommandExecutor, ExecError, ExecOutput, ExecRequest, ProcessExecutor};
pub use setup::{build_coordinator, select_provisioner, ExecutionOptions, WorkflowOptions};
pub use stage::BuiltinStage;
pub use workflow::Workflow;
