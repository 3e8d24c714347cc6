//! buildgated - runs a workflow for every trigger event on stdin
//!
//! Events arrive as newline-delimited JSON, e.g.
//! `{"kind": "push", "ref": "refs/heads/main"}`. Every event is started
//! through one shared coordinator, so a newer event for the same ref
//! supersedes a run still in flight. One JSON report line is written to
//! stdout per handled event.

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::task::JoinSet;
use tracing::{error, info, warn, Level};

use buildgate_ci::{
    build_coordinator, BuiltinStage, ExecutionOptions, RunCoordinator, WorkflowOptions,
};
use buildgate_core::{
    MatrixDimension, RunOutcome, TriggerEvent, EXIT_CANCELLED, EXIT_FAILURE, EXIT_SUCCESS,
};
use toolchain_manager::active_toolchain;

#[derive(Parser, Debug)]
#[command(name = "buildgated")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run buildgate workflows for trigger events read from stdin", long_about = None)]
struct Args {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Workflow name (part of the run key)
    #[arg(long, env = "BUILDGATE_WORKFLOW", default_value = "ci")]
    workflow: String,

    /// Workspace path
    #[arg(short, long, env = "BUILDGATE_WORKSPACE", default_value = ".")]
    workspace: PathBuf,

    /// Stages to run (comma-separated: fmt,check,clippy,test)
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_values_t = [BuiltinStage::CargoFmt, BuiltinStage::CargoCheck, BuiltinStage::CargoTest]
    )]
    stages: Vec<BuiltinStage>,

    /// Matrix dimension as name=v1,v2 (repeatable; default: os=<host os>)
    #[arg(short, long = "matrix")]
    matrix: Vec<MatrixDimension>,

    /// Toolchain channel to provision before the first stage
    #[arg(long, env = "BUILDGATE_TOOLCHAIN")]
    toolchain: Option<String>,

    /// Trust the toolchain already on PATH instead of provisioning
    #[arg(long)]
    skip_provision: bool,

    /// Maximum number of pipelines running at once per run
    #[arg(long, env = "BUILDGATE_MAX_PARALLEL")]
    max_parallel: Option<usize>,

    /// Default per-stage timeout in seconds
    #[arg(long, env = "BUILDGATE_STAGE_TIMEOUT")]
    stage_timeout: Option<u64>,

    /// Finished runs kept in the in-memory ledger
    #[arg(long, env = "BUILDGATE_RETAIN_RUNS", default_value_t = 100)]
    retain_runs: usize,
}

impl Args {
    fn workflow_options(&self, workspace: PathBuf) -> WorkflowOptions {
        WorkflowOptions {
            name: self.workflow.clone(),
            workspace,
            stages: self.stages.clone(),
            matrix: self.matrix.clone(),
            toolchain: self.toolchain.clone(),
        }
    }

    fn execution_options(&self) -> ExecutionOptions {
        ExecutionOptions {
            skip_provision: self.skip_provision,
            max_parallel: self.max_parallel,
            stage_timeout: self.stage_timeout.map(Duration::from_secs),
            retain_runs: Some(self.retain_runs),
        }
    }
}

/// Report for one handled event.
#[derive(Debug, Serialize)]
struct RunReport {
    event: TriggerEvent,
    #[serde(skip_serializing_if = "Option::is_none")]
    outcome: Option<RunOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl RunReport {
    fn new(event: TriggerEvent, result: buildgate_core::Result<RunOutcome>) -> Self {
        match result {
            Ok(outcome) => Self {
                event,
                outcome: Some(outcome),
                error: None,
            },
            Err(err) => Self {
                event,
                outcome: None,
                error: Some(err.to_string()),
            },
        }
    }
}

/// Tally of everything the daemon handled.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct DaemonSummary {
    received: usize,
    rejected: usize,
    succeeded: usize,
    failed: usize,
    cancelled: usize,
    ignored: usize,
    errored: usize,
}

impl DaemonSummary {
    fn record(&mut self, report: &RunReport) {
        match &report.outcome {
            Some(RunOutcome::Completed(result)) if result.succeeded() => self.succeeded += 1,
            Some(RunOutcome::Completed(_)) => self.failed += 1,
            Some(RunOutcome::Cancelled { .. }) => self.cancelled += 1,
            Some(RunOutcome::Ignored { .. }) => self.ignored += 1,
            None => self.errored += 1,
        }
    }

    /// Non-zero if any completed run failed or any run could not start.
    fn exit_code(&self) -> i32 {
        if self.failed > 0 || self.errored > 0 {
            EXIT_FAILURE
        } else {
            EXIT_SUCCESS
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let level = if args.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    buildgate_core::init_tracing(args.json, level);

    match run(args).await {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            error!(error = %format!("{err:#}"), "buildgated failed");
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

async fn run(args: Args) -> Result<i32> {
    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {:?}", args.workspace))?;
    match active_toolchain(&workspace).await {
        Ok(active) => info!(toolchain = %active, "Active toolchain"),
        Err(err) => warn!(error = %err, "Could not determine the active toolchain"),
    }

    let workflow = args.workflow_options(workspace).build();
    let coordinator = Arc::new(build_coordinator(workflow, &args.execution_options()).await);

    info!(
        workflow = %coordinator.workflow().name,
        digest = %coordinator.workflow().digest(),
        "buildgated started; reading trigger events from stdin"
    );

    let stdin = BufReader::new(tokio::io::stdin());
    let summary = tokio::select! {
        summary = serve(coordinator, stdin, print_report) => summary?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted; abandoning in-flight runs");
            return Ok(EXIT_CANCELLED);
        }
    };

    info!(
        received = summary.received,
        rejected = summary.rejected,
        succeeded = summary.succeeded,
        failed = summary.failed,
        cancelled = summary.cancelled,
        ignored = summary.ignored,
        errored = summary.errored,
        "buildgated finished"
    );
    Ok(summary.exit_code())
}

fn print_report(report: &RunReport) {
    match serde_json::to_string(report) {
        Ok(line) => println!("{line}"),
        Err(err) => error!(error = %err, "Failed to serialize run report"),
    }
}

/// Start a run per event line until the input ends, then wait for every
/// run. Reports are handed to `on_report` as runs terminate.
async fn serve<R>(
    coordinator: Arc<RunCoordinator>,
    input: R,
    mut on_report: impl FnMut(&RunReport),
) -> Result<DaemonSummary>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = input.lines();
    let mut tasks = JoinSet::new();
    let mut summary = DaemonSummary::default();
    let mut reading = true;

    loop {
        tokio::select! {
            line = lines.next_line(), if reading => {
                match line.context("Failed to read trigger events")? {
                    Some(line) if line.trim().is_empty() => {}
                    Some(line) => match serde_json::from_str::<TriggerEvent>(&line) {
                        Ok(event) => {
                            summary.received += 1;
                            info!(
                                kind = %event.kind,
                                git_ref = %event.git_ref,
                                "Trigger event received"
                            );
                            let coordinator = Arc::clone(&coordinator);
                            tasks.spawn(async move {
                                let outcome = coordinator.start(event.clone()).await;
                                RunReport::new(event, outcome)
                            });
                        }
                        Err(err) => {
                            summary.rejected += 1;
                            warn!(error = %err, line = %line, "Ignoring malformed trigger event");
                        }
                    },
                    None => reading = false,
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                match joined {
                    Ok(report) => {
                        summary.record(&report);
                        on_report(&report);
                    }
                    Err(err) => {
                        error!(error = %err, "Run task aborted");
                        summary.errored += 1;
                    }
                }
            }
            else => break,
        }
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use buildgate_ci::{
        ExecError, ExecOutput, ExecRequest, PipelineRunner, ProcessExecutor, Workflow,
    };
    use buildgate_core::{MemoryRunLedger, PipelineTemplate, Stage};
    use tokio::io::AsyncWriteExt;
    use tokio::sync::{mpsc, Notify};
    use toolchain_manager::NoopProvisioner;

    /// Exits 1 for `fail`, 0 otherwise.
    struct FakeExecutor;

    #[async_trait]
    impl ProcessExecutor for FakeExecutor {
        async fn execute(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
            let exit_code = if request.command[0] == "fail" { 1 } else { 0 };
            Ok(ExecOutput {
                exit_code,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    /// Holds the first call until `release` is notified.
    #[derive(Default)]
    struct GatedExecutor {
        calls: AtomicUsize,
        started: Notify,
        release: Notify,
    }

    #[async_trait]
    impl ProcessExecutor for GatedExecutor {
        async fn execute(&self, _request: ExecRequest) -> Result<ExecOutput, ExecError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                self.started.notify_one();
                self.release.notified().await;
            }
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
            })
        }
    }

    fn coordinator_with(executor: Arc<dyn ProcessExecutor>) -> Arc<RunCoordinator> {
        let template = PipelineTemplate::new("ci", vec![Stage::new("only", ["cargo"])]);
        let runner = PipelineRunner::new(
            executor,
            Arc::new(NoopProvisioner),
            Arc::new(MemoryRunLedger::new()),
        );
        Arc::new(RunCoordinator::new(Workflow::new("ci", template), runner))
    }

    fn coordinator(command: &str) -> Arc<RunCoordinator> {
        let template = PipelineTemplate::new("ci", vec![Stage::new("only", [command])]);
        let runner = PipelineRunner::new(
            Arc::new(FakeExecutor),
            Arc::new(NoopProvisioner),
            Arc::new(MemoryRunLedger::new()),
        );
        Arc::new(RunCoordinator::new(Workflow::new("ci", template), runner))
    }

    #[test]
    fn test_args_definition() {
        use clap::CommandFactory;
        Args::command().debug_assert();
    }

    #[test]
    fn test_execution_options_bound_ledger_history() {
        let args = Args::try_parse_from(["buildgated", "--stage-timeout", "5"]).expect("parse");
        let options = args.execution_options();
        assert_eq!(options.retain_runs, Some(100));
        assert_eq!(options.stage_timeout, Some(Duration::from_secs(5)));

        let args = Args::try_parse_from(["buildgated", "--retain-runs", "3"]).expect("parse");
        assert_eq!(args.execution_options().retain_runs, Some(3));
    }

    #[tokio::test]
    async fn test_serve_runs_every_valid_event() {
        let input = concat!(
            "{\"kind\":\"push\",\"ref\":\"refs/heads/main\"}\n",
            "not json\n",
            "\n",
            "{\"kind\":\"pull_request\",\"ref\":\"refs/pull/4/merge\"}\n",
            "{\"kind\":\"workflow_dispatch\",\"ref\":\"refs/heads/dev\"}\n",
        );
        let mut reports = Vec::new();
        let summary = serve(coordinator("ok"), input.as_bytes(), |r| {
            reports.push(r.event.git_ref.clone())
        })
        .await
        .expect("serve");

        assert_eq!(summary.received, 3);
        assert_eq!(summary.rejected, 1);
        assert_eq!(summary.succeeded, 3);
        assert_eq!(summary.exit_code(), EXIT_SUCCESS);
        reports.sort();
        assert_eq!(
            reports,
            vec!["refs/heads/dev", "refs/heads/main", "refs/pull/4/merge"]
        );
    }

    #[tokio::test]
    async fn test_newer_event_supersedes_run_in_flight() {
        let executor = Arc::new(GatedExecutor::default());
        let coordinator = coordinator_with(executor.clone());
        let (mut input, reader) = tokio::io::duplex(1024);
        let (reports_tx, mut reports) = mpsc::unbounded_channel();

        let daemon = tokio::spawn(serve(coordinator, BufReader::new(reader), move |r| {
            let _ = reports_tx.send(r.outcome.clone());
        }));

        let event = b"{\"kind\":\"push\",\"ref\":\"refs/heads/main\"}\n";
        input.write_all(event).await.unwrap();
        executor.started.notified().await;

        // The second run completes while the first is still inside its stage.
        input.write_all(event).await.unwrap();
        let newer = reports.recv().await.expect("newer report");
        assert!(matches!(newer, Some(RunOutcome::Completed(ref r)) if r.succeeded()));

        executor.release.notify_one();
        drop(input);
        let older = reports.recv().await.expect("older report");
        assert!(matches!(older, Some(RunOutcome::Cancelled { .. })));

        let summary = daemon.await.unwrap().expect("serve");
        assert_eq!(summary.received, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.exit_code(), EXIT_SUCCESS);
        assert_eq!(executor.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_run_sets_exit_code() {
        let input = "{\"kind\":\"push\",\"ref\":\"refs/heads/main\"}\n";
        let summary = serve(coordinator("fail"), input.as_bytes(), |_| {})
            .await
            .expect("serve");
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.exit_code(), EXIT_FAILURE);
    }

    #[test]
    fn test_report_serialization() {
        let report = RunReport {
            event: TriggerEvent::push("refs/heads/main"),
            outcome: Some(RunOutcome::Ignored {
                kind: buildgate_core::TriggerKind::Push,
            }),
            error: None,
        };
        let json = serde_json::to_value(&report).expect("serialize");
        assert_eq!(json["event"]["ref"], "refs/heads/main");
        assert_eq!(json["outcome"]["outcome"], "ignored");
        assert!(json.get("error").is_none());
    }
}
