//! Wiring shared by the `buildgate` and `buildgated` binaries.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use buildgate_core::{MatrixDimension, MemoryRunLedger};
use toolchain_manager::{
    is_rustup_available, NoopProvisioner, Provisioner, RustupProvisioner, ToolchainSpec,
};
use tracing::warn;

use crate::coordinator::{CoordinatorConfig, RunCoordinator};
use crate::pipeline::PipelineRunner;
use crate::runner::CommandExecutor;
use crate::stage::BuiltinStage;
use crate::workflow::Workflow;

/// Workflow shape as given on a command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOptions {
    pub name: String,
    pub workspace: PathBuf,
    pub stages: Vec<BuiltinStage>,
    /// Empty means a single `os=<host os>` dimension.
    pub matrix: Vec<MatrixDimension>,
    pub toolchain: Option<String>,
}

impl WorkflowOptions {
    pub fn build(&self) -> Workflow {
        let toolchain = self.toolchain.as_deref().map(ToolchainSpec::new);
        let mut workflow =
            Workflow::from_builtins(&self.name, &self.stages, &self.workspace, toolchain);

        if self.matrix.is_empty() {
            workflow = workflow.with_dimension(MatrixDimension::new("os", [std::env::consts::OS]));
        }
        for dimension in &self.matrix {
            workflow = workflow.with_dimension(dimension.clone());
        }
        workflow
    }
}

/// How runs execute.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionOptions {
    /// Trust the toolchain already on PATH.
    pub skip_provision: bool,
    pub max_parallel: Option<usize>,
    /// Timeout for stages that declare none.
    pub stage_timeout: Option<Duration>,
    /// Finished runs the ledger keeps; `None` keeps every run.
    pub retain_runs: Option<usize>,
}

/// rustup when it is installed and provisioning is wanted, otherwise a no-op.
pub async fn select_provisioner(skip_provision: bool) -> Arc<dyn Provisioner> {
    if skip_provision {
        return Arc::new(NoopProvisioner);
    }
    if !is_rustup_available().await {
        warn!("rustup not found; using the toolchain already on PATH");
        return Arc::new(NoopProvisioner);
    }
    Arc::new(RustupProvisioner::new())
}

/// Coordinator running real processes against an in-memory ledger.
pub async fn build_coordinator(workflow: Workflow, options: &ExecutionOptions) -> RunCoordinator {
    let mut executor = CommandExecutor::new();
    if let Some(timeout) = options.stage_timeout {
        executor = executor.with_default_timeout(timeout);
    }

    let mut ledger = MemoryRunLedger::new();
    if let Some(keep) = options.retain_runs {
        ledger = ledger.with_retention(keep);
    }

    let runner = PipelineRunner::new(
        Arc::new(executor),
        select_provisioner(options.skip_provision).await,
        Arc::new(ledger),
    );
    RunCoordinator::new(workflow, runner).with_config(CoordinatorConfig {
        max_parallel: options.max_parallel,
    })
}
