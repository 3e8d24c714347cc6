//! Fail-fast execution of one pipeline.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use buildgate_core::ledger::{NewRunEvent, RunEventKind, RunLedger};
use buildgate_core::obs;
use buildgate_core::{
    Pipeline, PipelineFailure, PipelineResult, PipelineStatus, RunId, Stage, StageOutcome,
};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use toolchain_manager::Provisioner;
use tracing::{info, instrument, warn};

use crate::runner::{ExecRequest, ProcessExecutor};

/// Run-wide values every pipeline of a run shares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunContext {
    pub run_id: RunId,
    /// Extra stage environment; overrides stage-declared values.
    pub env: BTreeMap<String, String>,
}

impl RunContext {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            env: BTreeMap::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Executes pipelines: provisions the toolchain, then runs stages in order.
pub struct PipelineRunner {
    executor: Arc<dyn ProcessExecutor>,
    provisioner: Arc<dyn Provisioner>,
    ledger: Arc<dyn RunLedger>,
}

impl PipelineRunner {
    pub fn new(
        executor: Arc<dyn ProcessExecutor>,
        provisioner: Arc<dyn Provisioner>,
        ledger: Arc<dyn RunLedger>,
    ) -> Self {
        Self {
            executor,
            provisioner,
            ledger,
        }
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    /// Run a pipeline to a terminal state.
    ///
    /// The token is checked before provisioning and before every stage; a
    /// stage already running is never interrupted. Every declared stage gets
    /// exactly one outcome. Stages that never ran are recorded as skipped.
    #[instrument(skip(self, pipeline, ctx, token), fields(pipeline = %pipeline.name()))]
    pub async fn run(
        &self,
        pipeline: &Pipeline,
        ctx: &RunContext,
        token: &CancellationToken,
    ) -> PipelineResult {
        let start = Instant::now();
        let name = pipeline.name();
        let stages = pipeline.stages();

        self.record(
            ctx,
            NewRunEvent::pipeline(
                RunEventKind::PipelineStarted,
                name,
                json!({
                    "cell": pipeline.cell(),
                    "stages": stages.iter().map(|s| &s.name).collect::<Vec<_>>(),
                    "toolchain": pipeline.toolchain().map(|t| t.to_string()),
                }),
            ),
        )
        .await;

        let mut outcomes = Vec::with_capacity(stages.len());
        let mut failure = None;

        if token.is_cancelled() {
            return self.cancelled(pipeline, ctx, outcomes, start).await;
        }

        if let Some(spec) = pipeline.toolchain() {
            match self.provisioner.ensure(spec).await {
                Ok(()) => {
                    self.record(
                        ctx,
                        NewRunEvent::pipeline(
                            RunEventKind::ToolchainReady,
                            name,
                            json!({
                                "toolchain": spec.to_string(),
                                "fingerprint": spec.fingerprint(),
                            }),
                        ),
                    )
                    .await;
                }
                Err(err) => {
                    warn!(toolchain = %spec, error = %err, "Toolchain provisioning failed");
                    self.record(
                        ctx,
                        NewRunEvent::pipeline(
                            RunEventKind::ToolchainFailed,
                            name,
                            json!({
                                "toolchain": spec.to_string(),
                                "fingerprint": spec.fingerprint(),
                                "error": &err,
                            }),
                        ),
                    )
                    .await;
                    self.skip_remaining(pipeline, ctx, &mut outcomes).await;
                    let failure = PipelineFailure::Provision(err);
                    return self
                        .finish(pipeline, ctx, outcomes, Some(failure), start)
                        .await;
                }
            }
        }

        for stage in stages {
            if token.is_cancelled() {
                return self.cancelled(pipeline, ctx, outcomes, start).await;
            }

            info!(stage = %stage.name, "Executing stage");
            self.record(
                ctx,
                NewRunEvent::stage(
                    RunEventKind::StageStarted,
                    name,
                    &stage.name,
                    json!({ "command": &stage.command }),
                ),
            )
            .await;

            let outcome = self.execute_stage(pipeline, stage, ctx).await;
            obs::emit_stage_finished(name, &outcome);
            self.record(ctx, stage_event(name, &outcome)).await;

            let failed = outcome.failed();
            let exit_code = outcome.exit_code.unwrap_or(-1);
            outcomes.push(outcome);

            if failed {
                if failure.is_none() {
                    failure = Some(PipelineFailure::Stage {
                        stage: stage.name.clone(),
                        exit_code,
                    });
                }
                if !stage.continue_on_failure {
                    info!(stage = %stage.name, "Stage failed; aborting pipeline");
                    self.skip_remaining(pipeline, ctx, &mut outcomes).await;
                    break;
                }
            }
        }

        self.finish(pipeline, ctx, outcomes, failure, start).await
    }

    async fn execute_stage(
        &self,
        pipeline: &Pipeline,
        stage: &Stage,
        ctx: &RunContext,
    ) -> StageOutcome {
        let mut env = stage.env.clone();
        env.extend(ctx.env.iter().map(|(k, v)| (k.clone(), v.clone())));

        let request = ExecRequest {
            command: stage.command.clone(),
            working_dir: pipeline.working_dir().clone(),
            env,
            timeout: stage.timeout_secs.map(Duration::from_secs),
        };

        let started = Instant::now();
        let result = self.executor.execute(request).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(output) => StageOutcome::executed(
                stage,
                output.exit_code,
                output.stdout,
                output.stderr,
                duration_ms,
            ),
            // Executor errors are stage failures, not pipeline errors.
            Err(err) => {
                StageOutcome::executed(stage, -1, String::new(), err.to_string(), duration_ms)
            }
        }
    }

    /// Record a skipped outcome for every stage without one yet.
    async fn skip_remaining(
        &self,
        pipeline: &Pipeline,
        ctx: &RunContext,
        outcomes: &mut Vec<StageOutcome>,
    ) {
        for stage in &pipeline.stages()[outcomes.len()..] {
            let outcome = StageOutcome::skipped(stage);
            self.record(ctx, stage_event(pipeline.name(), &outcome)).await;
            outcomes.push(outcome);
        }
    }

    async fn cancelled(
        &self,
        pipeline: &Pipeline,
        ctx: &RunContext,
        mut outcomes: Vec<StageOutcome>,
        start: Instant,
    ) -> PipelineResult {
        info!("Run superseded; cancelling pipeline");
        self.skip_remaining(pipeline, ctx, &mut outcomes).await;
        self.record(
            ctx,
            NewRunEvent::pipeline(RunEventKind::PipelineCancelled, pipeline.name(), json!({})),
        )
        .await;

        PipelineResult {
            pipeline: pipeline.name().to_string(),
            cell: pipeline.cell().clone(),
            status: PipelineStatus::Cancelled,
            stages: outcomes,
            failure: None,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn finish(
        &self,
        pipeline: &Pipeline,
        ctx: &RunContext,
        outcomes: Vec<StageOutcome>,
        failure: Option<PipelineFailure>,
        start: Instant,
    ) -> PipelineResult {
        let status = if failure.is_some() {
            PipelineStatus::Failed
        } else {
            PipelineStatus::Passed
        };
        let duration_ms = start.elapsed().as_millis() as u64;

        self.record(
            ctx,
            NewRunEvent::pipeline(
                RunEventKind::PipelineFinished,
                pipeline.name(),
                json!({
                    "status": status,
                    "failure": &failure,
                    "duration_ms": duration_ms,
                }),
            ),
        )
        .await;
        info!(status = %status, duration_ms = duration_ms, "Pipeline finished");

        PipelineResult {
            pipeline: pipeline.name().to_string(),
            cell: pipeline.cell().clone(),
            status,
            stages: outcomes,
            failure,
            duration_ms,
        }
    }

    /// Append to the ledger. A failed write is logged, never fatal to the pipeline.
    async fn record(&self, ctx: &RunContext, event: NewRunEvent) {
        if let Err(err) = self.ledger.append_event(&ctx.run_id, event).await {
            obs::emit_ledger_error(&ctx.run_id, &err);
        }
    }
}

fn stage_event(pipeline: &str, outcome: &StageOutcome) -> NewRunEvent {
    use buildgate_core::StageStatus;

    let kind = match outcome.status {
        StageStatus::Passed => RunEventKind::StagePassed,
        StageStatus::Failed => RunEventKind::StageFailed,
        StageStatus::Skipped => RunEventKind::StageSkipped,
    };
    NewRunEvent::stage(
        kind,
        pipeline,
        &outcome.stage,
        json!({
            "exit_code": outcome.exit_code,
            "stdout": &outcome.stdout,
            "stderr": &outcome.stderr,
            "duration_ms": outcome.duration_ms,
            "continue_on_failure": outcome.continue_on_failure,
        }),
    )
}
