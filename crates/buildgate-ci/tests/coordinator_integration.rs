//! Integration tests for RunCoordinator with in-memory collaborators.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use buildgate_ci::{
    ExecError, ExecOutput, ExecRequest, PipelineRunner, ProcessExecutor, RunCoordinator, RunGate,
    Workflow,
};
use buildgate_core::ledger::{RunEventKind, RunLedger, RunState};
use buildgate_core::{
    BuildGateError, MatrixDimension, MemoryRunLedger, PipelineFailure, PipelineStatus,
    PipelineTemplate, ProvisionError, Provisioner, RunConclusion, RunKey, RunOutcome, Stage,
    StageStatus, ToolchainSpec, TriggerEvent,
};
use tokio::sync::Notify;
use toolchain_manager::NoopProvisioner;

/// Records every request; exits with the code scripted for argv[1], else 0.
#[derive(Default)]
struct RecordingExecutor {
    exit_codes: BTreeMap<String, i32>,
    calls: Mutex<Vec<ExecRequest>>,
}

impl RecordingExecutor {
    fn failing(stage_arg: &str, exit_code: i32) -> Self {
        let mut executor = Self::default();
        executor.exit_codes.insert(stage_arg.to_string(), exit_code);
        executor
    }

    fn calls(&self) -> Vec<ExecRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ProcessExecutor for RecordingExecutor {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        let key = request.command.get(1).cloned().unwrap_or_default();
        self.calls.lock().unwrap().push(request);
        Ok(ExecOutput {
            exit_code: self.exit_codes.get(&key).copied().unwrap_or(0),
            stdout: format!("{key} done"),
            stderr: String::new(),
        })
    }
}

/// Blocks the first call until released; later calls return immediately.
struct GatedExecutor {
    calls: AtomicUsize,
    log: Mutex<Vec<String>>,
    started: Notify,
    release: Notify,
}

impl GatedExecutor {
    fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
            started: Notify::new(),
            release: Notify::new(),
        }
    }
}

#[async_trait]
impl ProcessExecutor for GatedExecutor {
    async fn execute(&self, request: ExecRequest) -> Result<ExecOutput, ExecError> {
        let run = request
            .env
            .get("BUILDGATE_RUN_ID")
            .cloned()
            .unwrap_or_default();
        self.log
            .lock()
            .unwrap()
            .push(format!("{run}:{}", request.command.join(" ")));

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

/// Fails provisioning for one channel only.
struct ChannelFailingProvisioner {
    bad_channel: String,
}

#[async_trait]
impl Provisioner for ChannelFailingProvisioner {
    async fn ensure(&self, spec: &ToolchainSpec) -> toolchain_manager::Result<()> {
        if spec.channel == self.bad_channel {
            return Err(ProvisionError::InstallFailed {
                toolchain: spec.to_string(),
                stderr: "error: toolchain not available".to_string(),
            });
        }
        Ok(())
    }
}

fn three_stage_template() -> PipelineTemplate {
    PipelineTemplate::new(
        "ci",
        vec![
            Stage::new("a", ["run", "a"]),
            Stage::new("b", ["run", "b"]),
            Stage::new("c", ["run", "c"]),
        ],
    )
}

fn build(
    workflow: Workflow,
    executor: Arc<dyn ProcessExecutor>,
    provisioner: Arc<dyn Provisioner>,
) -> (RunCoordinator, Arc<MemoryRunLedger>) {
    let ledger = Arc::new(MemoryRunLedger::new());
    let runner = PipelineRunner::new(executor, provisioner, ledger.clone());
    (RunCoordinator::new(workflow, runner), ledger)
}

/// Test: every cell passes, results in matrix order, ledger closed as succeeded
#[tokio::test]
async fn test_successful_matrix_run() {
    let executor = Arc::new(RecordingExecutor::default());
    let workflow = Workflow::new("ci", three_stage_template())
        .with_dimension(MatrixDimension::new("os", ["macos", "ubuntu"]));
    let (coordinator, ledger) = build(workflow, executor.clone(), Arc::new(NoopProvisioner));

    let outcome = coordinator
        .start(TriggerEvent::push("refs/heads/main"))
        .await
        .expect("run");
    assert_eq!(outcome.exit_code(), 0);

    let result = outcome.into_result().expect("success").expect("completed");
    assert_eq!(result.conclusion, RunConclusion::Success);
    assert_eq!(result.run_key, RunKey::derive("ci", "refs/heads/main"));
    let names: Vec<&str> = result.pipelines.iter().map(|p| p.pipeline.as_str()).collect();
    assert_eq!(names, vec!["ci (macos)", "ci (ubuntu)"]);
    assert_eq!(executor.calls().len(), 6);

    let record = ledger.get_run(&result.run_id).await.unwrap();
    assert_eq!(record.state, RunState::Succeeded);
    let summary = record.summary.expect("summary");
    assert_eq!(summary.passed_pipelines, 2);

    let events = ledger.get_events(&result.run_id).await.unwrap();
    let verdict = RunGate::evaluate_run(&result, &events);
    assert!(verdict.passed, "{:?}", verdict.violations);
}

/// Test: run and matrix env reach every stage
#[tokio::test]
async fn test_stage_env_carries_run_and_matrix() {
    let executor = Arc::new(RecordingExecutor::default());
    let workflow = Workflow::new("ci", three_stage_template())
        .with_dimension(MatrixDimension::new("os", ["ubuntu"]));
    let (coordinator, _ledger) = build(workflow, executor.clone(), Arc::new(NoopProvisioner));

    let outcome = coordinator
        .start(TriggerEvent::pull_request("refs/pull/7/merge"))
        .await
        .expect("run");
    let run_id = outcome.result().expect("completed").run_id.to_string();

    for call in executor.calls() {
        let env = |k: &str| call.env.get(k).map(String::as_str);
        assert_eq!(env("BUILDGATE_RUN_ID"), Some(run_id.as_str()));
        assert_eq!(env("BUILDGATE_RUN_KEY"), Some("ci-refs/pull/7/merge"));
        assert_eq!(env("BUILDGATE_EVENT"), Some("pull_request"));
        assert_eq!(env("BUILDGATE_REF"), Some("refs/pull/7/merge"));
        assert_eq!(env("MATRIX_OS"), Some("ubuntu"));
    }
}

/// Test: [A pass, B fail (no continue), C] -> failed, C never executes
#[tokio::test]
async fn test_fail_fast_stops_pipeline() {
    let executor = Arc::new(RecordingExecutor::failing("b", 1));
    let workflow = Workflow::new("ci", three_stage_template());
    let (coordinator, ledger) = build(workflow, executor.clone(), Arc::new(NoopProvisioner));

    let outcome = coordinator
        .start(TriggerEvent::push("refs/heads/main"))
        .await
        .expect("run");
    assert_eq!(outcome.exit_code(), 1);

    let result = outcome.result().expect("completed").clone();
    let pipeline = &result.pipelines[0];
    assert_eq!(pipeline.status, PipelineStatus::Failed);
    let statuses: Vec<StageStatus> = pipeline.stages.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![StageStatus::Passed, StageStatus::Failed, StageStatus::Skipped]
    );
    let executed: Vec<String> = executor.calls().iter().map(|r| r.command[1].clone()).collect();
    assert_eq!(executed, vec!["a", "b"]);

    let record = ledger.get_run(&result.run_id).await.unwrap();
    assert_eq!(record.state, RunState::Failed);

    assert!(matches!(
        outcome.into_result(),
        Err(BuildGateError::StageFailure { exit_code: 1, .. })
    ));
}

/// Test: [A pass, B fail (continue), C pass] -> failed, three outcomes recorded
#[tokio::test]
async fn test_continue_on_failure_still_fails_run() {
    let executor = Arc::new(RecordingExecutor::failing("b", 2));
    let template = PipelineTemplate::new(
        "ci",
        vec![
            Stage::new("a", ["run", "a"]),
            Stage::new("b", ["run", "b"]).allow_failure(),
            Stage::new("c", ["run", "c"]),
        ],
    );
    let (coordinator, ledger) = build(
        Workflow::new("ci", template),
        executor.clone(),
        Arc::new(NoopProvisioner),
    );

    let outcome = coordinator
        .start(TriggerEvent::manual("refs/heads/main"))
        .await
        .expect("run");
    let result = outcome.result().expect("completed");
    assert_eq!(result.conclusion, RunConclusion::Failure);

    let pipeline = &result.pipelines[0];
    assert_eq!(pipeline.stages.len(), 3);
    assert_eq!(pipeline.passed_count(), 2);
    assert_eq!(pipeline.failed_count(), 1);
    assert_eq!(executor.calls().len(), 3);

    let events = ledger.get_events(&result.run_id).await.unwrap();
    let terminal = events.iter().filter(|e| e.kind.is_stage_terminal()).count();
    assert_eq!(terminal, 3);
    let verdict = RunGate::evaluate_run(result, &events);
    assert!(!verdict.passed);
    assert_eq!(verdict.violations.len(), 1);
}

/// Test: provisioning failure fails only its own cell
#[tokio::test]
async fn test_provision_failure_is_isolated_to_cell() {
    let executor = Arc::new(RecordingExecutor::default());
    let template = three_stage_template().with_toolchain(ToolchainSpec::new("${{ matrix.rust }}"));
    let workflow = Workflow::new("ci", template)
        .with_dimension(MatrixDimension::new("rust", ["stable", "nightly"]));
    let provisioner = Arc::new(ChannelFailingProvisioner {
        bad_channel: "nightly".to_string(),
    });
    let (coordinator, _ledger) = build(workflow, executor.clone(), provisioner);

    let outcome = coordinator
        .start(TriggerEvent::push("refs/heads/main"))
        .await
        .expect("run");
    let result = outcome.result().expect("completed");
    assert_eq!(result.conclusion, RunConclusion::Failure);

    let stable = &result.pipelines[0];
    let nightly = &result.pipelines[1];
    assert_eq!(stable.pipeline, "ci (stable)");
    assert_eq!(stable.status, PipelineStatus::Passed);
    assert_eq!(nightly.status, PipelineStatus::Failed);
    assert!(matches!(nightly.failure, Some(PipelineFailure::Provision(_))));
    assert_eq!(nightly.skipped_count(), 3);

    // Only the stable cell executed anything.
    assert_eq!(executor.calls().len(), 3);
}

/// Test: empty dimension fails before any pipeline or lease
#[tokio::test]
async fn test_expansion_error_starts_nothing() {
    let executor = Arc::new(RecordingExecutor::default());
    let workflow = Workflow::new("ci", three_stage_template())
        .with_dimension(MatrixDimension::new("os", Vec::<String>::new()));
    let (coordinator, ledger) = build(workflow, executor.clone(), Arc::new(NoopProvisioner));

    let err = coordinator
        .start(TriggerEvent::push("refs/heads/main"))
        .await
        .unwrap_err();
    assert!(matches!(err, BuildGateError::Expansion(_)));
    assert!(executor.calls().is_empty());
    assert_eq!(coordinator.governor().active_count(), 0);
    assert!(ledger.list_runs(None).await.unwrap().is_empty());
}

/// Test: a second event for the same key supersedes the first run
#[tokio::test]
async fn test_newer_run_supersedes_older() {
    let executor = Arc::new(GatedExecutor::new());
    let template = PipelineTemplate::new(
        "ci",
        vec![
            Stage::new("first", ["step", "first"]),
            Stage::new("second", ["step", "second"]),
        ],
    );
    let (coordinator, ledger) = build(
        Workflow::new("ci", template),
        executor.clone(),
        Arc::new(NoopProvisioner),
    );
    let coordinator = Arc::new(coordinator);

    let older = {
        let coordinator = Arc::clone(&coordinator);
        tokio::spawn(async move { coordinator.start(TriggerEvent::push("refs/heads/main")).await })
    };

    // Wait until the older run is inside its first stage.
    executor.started.notified().await;
    let key = RunKey::derive("ci", "refs/heads/main");
    assert!(coordinator.governor().is_active(&key));

    let newer = coordinator
        .start(TriggerEvent::push("refs/heads/main"))
        .await
        .expect("newer run");
    assert!(newer.result().expect("completed").succeeded());

    executor.release.notify_one();
    let older = older.await.expect("join").expect("older run");
    assert!(older.is_cancelled());
    assert_eq!(older.exit_code(), 2);
    assert!(older.result().is_none());

    // The older run finished its in-flight stage but never started the next.
    assert_eq!(executor.calls.load(Ordering::SeqCst), 3);
    let log = executor.log.lock().unwrap().clone();
    let RunOutcome::Cancelled { run_id, .. } = &older else {
        panic!("expected cancelled outcome");
    };
    let older_steps: Vec<&String> = log
        .iter()
        .filter(|l| l.starts_with(&format!("{run_id}:")))
        .collect();
    assert_eq!(older_steps.len(), 1);
    assert!(older_steps[0].ends_with("step first"));

    let record = ledger.get_run(run_id).await.unwrap();
    assert_eq!(record.state, RunState::Cancelled);
    let events = ledger.get_events(run_id).await.unwrap();
    assert!(events
        .iter()
        .any(|e| e.kind == RunEventKind::PipelineCancelled));

    assert!(!coordinator.governor().is_active(&key));
}

/// Test: runs for different refs do not interfere
#[tokio::test]
async fn test_different_refs_run_independently() {
    let executor = Arc::new(RecordingExecutor::default());
    let (coordinator, ledger) = build(
        Workflow::new("ci", three_stage_template()),
        executor,
        Arc::new(NoopProvisioner),
    );

    let main = coordinator.start(TriggerEvent::push("refs/heads/main"));
    let dev = coordinator.start(TriggerEvent::push("refs/heads/dev"));
    let (main, dev) = tokio::join!(main, dev);

    assert_eq!(main.expect("main").exit_code(), 0);
    assert_eq!(dev.expect("dev").exit_code(), 0);

    let main_runs = ledger
        .list_runs(Some(&RunKey::derive("ci", "refs/heads/main")))
        .await
        .unwrap();
    assert_eq!(main_runs.len(), 1);
    assert_eq!(ledger.list_runs(None).await.unwrap().len(), 2);
}
