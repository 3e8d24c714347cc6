//! buildgate - build verification orchestrator CLI
//!
//! ## Commands
//!
//! - `run`: run the workflow once for a push, pull request or manual event
//! - `expand`: print the pipelines the matrix expands to, without running them
//! - `stages`: list the builtin stages

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::process::Command;
use tracing::{info, warn, Level};

use buildgate_ci::{
    build_coordinator, BuiltinStage, ExecutionOptions, GateVerdict, RunCoordinator, RunGate,
    WorkflowOptions,
};
use buildgate_core::{
    MatrixDimension, PipelineResult, RunOutcome, RunResult, StageStatus, TriggerEvent,
    TriggerKind, EXIT_FAILURE,
};
use toolchain_manager::active_toolchain;

/// Lines of stderr shown for a failed stage in text reports.
const STDERR_TAIL_LINES: usize = 20;

#[derive(Parser)]
#[command(name = "buildgate")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build verification orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Workflow shape shared by `run` and `expand`.
#[derive(clap::Args, Debug, Clone)]
struct WorkflowArgs {
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

    /// Toolchain channel to provision before the first stage (e.g. stable, 1.79.0)
    #[arg(long, env = "BUILDGATE_TOOLCHAIN")]
    toolchain: Option<String>,
}

impl WorkflowArgs {
    fn options(&self) -> WorkflowOptions {
        WorkflowOptions {
            name: self.workflow.clone(),
            workspace: self.workspace.clone(),
            stages: self.stages.clone(),
            matrix: self.matrix.clone(),
            toolchain: self.toolchain.clone(),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run the workflow once and report the result
    Run {
        #[command(flatten)]
        workflow: WorkflowArgs,

        /// Triggering event kind (push, pull_request, manual)
        #[arg(short, long, default_value = "manual")]
        event: TriggerKind,

        /// Git ref the event concerns (default: the workspace's current ref)
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Trust the toolchain already on PATH instead of provisioning
        #[arg(long)]
        skip_provision: bool,

        /// Maximum number of pipelines running at once
        #[arg(long, env = "BUILDGATE_MAX_PARALLEL")]
        max_parallel: Option<usize>,

        /// Default per-stage timeout in seconds
        #[arg(long, env = "BUILDGATE_STAGE_TIMEOUT")]
        stage_timeout: Option<u64>,

        /// Report format
        #[arg(long, value_enum, default_value_t = ReportFormat::Text)]
        format: ReportFormat,
    },

    /// Print the pipelines the matrix expands to
    Expand {
        #[command(flatten)]
        workflow: WorkflowArgs,
    },

    /// List builtin stages
    Stages,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ReportFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    buildgate_core::init_tracing(cli.json, level);

    let result = match cli.command {
        Commands::Run {
            workflow,
            event,
            git_ref,
            skip_provision,
            max_parallel,
            stage_timeout,
            format,
        } => {
            let options = ExecutionOptions {
                skip_provision,
                max_parallel,
                stage_timeout: stage_timeout.map(Duration::from_secs),
                retain_runs: None,
            };
            cmd_run(&workflow, event, git_ref, options, format, cli.verbose).await
        }
        Commands::Expand { workflow } => cmd_expand(&workflow).map(|()| 0),
        Commands::Stages => {
            cmd_stages();
            Ok(0)
        }
    };

    match result {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(EXIT_FAILURE as u8)
        }
    }
}

/// Current git ref of the workspace: the branch ref, else the commit SHA.
async fn detect_git_ref(workspace: &Path) -> String {
    if let Some(branch) = git_output(workspace, &["symbolic-ref", "-q", "HEAD"]).await {
        return branch;
    }
    git_output(workspace, &["rev-parse", "HEAD"])
        .await
        .unwrap_or_else(|| "HEAD".to_string())
}

/// Trimmed stdout of a successful, non-empty git command.
async fn git_output(workspace: &Path, args: &[&str]) -> Option<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(workspace)
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    (!text.is_empty()).then_some(text)
}

/// Run the workflow once; the gate verdict is present for completed runs.
async fn run_workflow(
    coordinator: &RunCoordinator,
    event: TriggerEvent,
) -> Result<(RunOutcome, Option<GateVerdict>)> {
    let outcome = coordinator
        .start(event)
        .await
        .context("Run failed to start")?;

    let verdict = match outcome.result() {
        Some(result) => {
            let events = coordinator
                .ledger()
                .get_events(&result.run_id)
                .await
                .context("Failed to read run events")?;
            Some(RunGate::evaluate_run(result, &events))
        }
        None => None,
    };
    Ok((outcome, verdict))
}

/// Run the workflow once and print the report. Returns the process exit code.
async fn cmd_run(
    args: &WorkflowArgs,
    kind: TriggerKind,
    git_ref: Option<String>,
    options: ExecutionOptions,
    format: ReportFormat,
    verbose: bool,
) -> Result<i32> {
    let workspace = args
        .workspace
        .canonicalize()
        .with_context(|| format!("Workspace not found: {:?}", args.workspace))?;
    let git_ref = match git_ref {
        Some(git_ref) => git_ref,
        None => detect_git_ref(&workspace).await,
    };

    let mut args = args.clone();
    args.workspace = workspace;
    let workflow = args.options().build();

    match active_toolchain(&args.workspace).await {
        Ok(active) => info!(toolchain = %active, "Active toolchain"),
        Err(err) => warn!(error = %err, "Could not determine the active toolchain"),
    }

    let event = TriggerEvent::new(kind, git_ref);
    let coordinator = build_coordinator(workflow, &options).await;
    let (outcome, verdict) = run_workflow(&coordinator, event.clone()).await?;

    match format {
        ReportFormat::Json => {
            let report = serde_json::json!({ "outcome": &outcome, "gate": &verdict });
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        ReportFormat::Text => print_report(&args, &event, &outcome, verdict.as_ref(), verbose),
    }

    let mut code = outcome.exit_code();
    if code == 0 && verdict.as_ref().is_some_and(|v| !v.passed) {
        code = EXIT_FAILURE;
    }
    Ok(code)
}

fn print_report(
    args: &WorkflowArgs,
    event: &TriggerEvent,
    outcome: &RunOutcome,
    verdict: Option<&GateVerdict>,
    verbose: bool,
) {
    println!("Workflow: {} ({:?})", args.workflow, args.workspace);
    println!("Event: {} {}", event.kind, event.git_ref);
    println!();

    let result = match outcome {
        RunOutcome::Completed(result) => result,
        RunOutcome::Cancelled { run_id, run_key } => {
            println!("Run {run_id} ({run_key}) was superseded by a newer run");
            return;
        }
        RunOutcome::Ignored { kind } => {
            println!("Workflow {} does not run on {kind} events", args.workflow);
            return;
        }
    };

    print_result(result, verbose);

    if let Some(verdict) = verdict {
        println!(
            "Gate: {}",
            if verdict.passed {
                "✓ PASSED"
            } else {
                "✗ FAILED"
            }
        );
        if !verdict.violations.is_empty() {
            println!("Violations:");
            for violation in &verdict.violations {
                println!("  - {}", violation);
            }
        }
    }

    if result.succeeded() && verdict.map(|v| v.passed).unwrap_or(true) {
        println!("\n✓ All checks passed!");
    }
}

fn print_result(result: &RunResult, verbose: bool) {
    println!("Run ID: {}", result.run_id);
    println!(
        "Status: {}",
        if result.succeeded() {
            "✓ PASSED"
        } else {
            "✗ FAILED"
        }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for pipeline in &result.pipelines {
        print_pipeline(pipeline, verbose);
    }

    println!(
        "Summary: {}/{} pipelines passed",
        result.passed_count(),
        result.pipelines.len()
    );
}

fn print_pipeline(pipeline: &PipelineResult, verbose: bool) {
    let mark = if pipeline.passed() { "✓" } else { "✗" };
    println!(
        "{} {} [{}] ({}ms)",
        mark, pipeline.pipeline, pipeline.status, pipeline.duration_ms
    );

    for stage in &pipeline.stages {
        match stage.status {
            StageStatus::Skipped => println!("    - {} (skipped)", stage.stage),
            status => {
                let mark = if status == StageStatus::Passed {
                    "✓"
                } else {
                    "✗"
                };
                println!(
                    "    {} {} ({}ms, exit code: {})",
                    mark,
                    stage.stage,
                    stage.duration_ms,
                    stage.exit_code.unwrap_or(-1)
                );
                if stage.failed() || verbose {
                    let max_lines = if verbose { usize::MAX } else { STDERR_TAIL_LINES };
                    print_tail(&stage.stderr, max_lines);
                }
            }
        }
    }
    if let Some(failure) = &pipeline.failure {
        println!("    failure: {}", failure);
    }
    println!();
}

fn print_tail(text: &str, max_lines: usize) {
    let lines: Vec<&str> = text.lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    for line in &lines[start..] {
        println!("      | {}", line);
    }
}

/// Print the pipelines the workflow expands to.
fn cmd_expand(args: &WorkflowArgs) -> Result<()> {
    let workflow = args.options().build();
    let pipelines = workflow.expand().context("Matrix expansion failed")?;

    println!("Workflow: {} (digest {})", workflow.name, workflow.digest());
    println!("Pipelines: {}", pipelines.len());
    for pipeline in &pipelines {
        println!();
        println!("{}", pipeline.name());
        if let Some(toolchain) = pipeline.toolchain() {
            println!("  toolchain: {}", toolchain);
        }
        for stage in pipeline.stages() {
            println!("  - {}: {}", stage.name, stage.command_line());
        }
    }
    Ok(())
}

/// List builtin stages.
fn cmd_stages() {
    for stage in BuiltinStage::ALL {
        let component = stage
            .required_component()
            .map(|c| format!(" (needs {c})"))
            .unwrap_or_default();
        println!("{:<14} {}{}", stage.name(), stage.command().join(" "), component);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn workflow_args(argv: &[&str]) -> WorkflowArgs {
        let mut full = vec!["buildgate", "expand"];
        full.extend_from_slice(argv);
        match Cli::try_parse_from(full).expect("parse").command {
            Commands::Expand { workflow } => workflow,
            _ => panic!("expected expand"),
        }
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_workflow_uses_host_os() {
        let args = workflow_args(&[]);
        let workflow = args.options().build();
        let pipelines = workflow.expand().unwrap();
        assert_eq!(pipelines.len(), 1);
        assert_eq!(
            pipelines[0].name(),
            format!("ci ({})", std::env::consts::OS)
        );
        let stages: Vec<&str> = pipelines[0].stages().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(stages, vec!["cargo_fmt", "cargo_check", "cargo_test"]);
    }

    #[test]
    fn test_matrix_and_stages_flags() {
        let args = workflow_args(&[
            "--stages",
            "clippy,test",
            "-m",
            "os=macos,ubuntu",
            "-m",
            "rust=stable,beta",
            "--toolchain",
            "stable",
        ]);
        let workflow = args.options().build();
        let pipelines = workflow.expand().unwrap();
        assert_eq!(pipelines.len(), 4);
        assert_eq!(pipelines[1].name(), "ci (macos, beta)");
        let toolchain = pipelines[0].toolchain().expect("toolchain");
        assert_eq!(toolchain.components, vec!["clippy"]);
    }

    #[test]
    fn test_empty_matrix_dimension_fails_expansion() {
        let args = workflow_args(&["-m", "os="]);
        assert!(args.options().build().expand().is_err());
        assert!(Cli::try_parse_from(["buildgate", "expand", "-m", "os"]).is_err());
    }

    #[test]
    fn test_unknown_stage_rejected() {
        assert!(Cli::try_parse_from(["buildgate", "expand", "--stages", "bench"]).is_err());
    }

    #[test]
    fn test_run_flags() {
        let cli = Cli::try_parse_from([
            "buildgate",
            "run",
            "--event",
            "pr",
            "--ref",
            "refs/pull/3/merge",
            "--max-parallel",
            "2",
            "--format",
            "json",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run {
                event,
                git_ref,
                max_parallel,
                format,
                ..
            } => {
                assert_eq!(event, TriggerKind::PullRequest);
                assert_eq!(git_ref.as_deref(), Some("refs/pull/3/merge"));
                assert_eq!(max_parallel, Some(2));
                assert_eq!(format, ReportFormat::Json);
            }
            _ => panic!("expected run"),
        }
    }

    #[tokio::test]
    async fn test_detect_git_ref_falls_back_outside_a_repository() {
        let dir = tempfile::tempdir().expect("tempdir");
        let missing = dir.path().join("missing");
        assert_eq!(detect_git_ref(&missing).await, "HEAD");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_workflow_reports_gate() {
        use buildgate_core::{PipelineTemplate, Stage};

        let dir = tempfile::tempdir().expect("tempdir");
        let template = PipelineTemplate::new(
            "smoke",
            vec![
                Stage::new("hello", ["echo", "hello"]),
                Stage::new("broken", ["false"]),
            ],
        )
        .with_working_dir(dir.path());
        let workflow = buildgate_ci::Workflow::new("smoke", template);
        let options = ExecutionOptions {
            skip_provision: true,
            stage_timeout: Some(Duration::from_secs(30)),
            ..ExecutionOptions::default()
        };
        let coordinator = build_coordinator(workflow, &options).await;

        let (outcome, verdict) =
            run_workflow(&coordinator, TriggerEvent::manual("refs/heads/main"))
                .await
                .expect("run");
        assert_eq!(outcome.exit_code(), 1);
        let verdict = verdict.expect("verdict");
        assert!(!verdict.passed);
        assert!(verdict.violations.iter().any(|v| v.contains("broken")));
    }
}
