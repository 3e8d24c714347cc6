//! Run coordination: trigger filtering, matrix expansion, superseding and
//! parallel pipeline execution.

use std::sync::Arc;

use buildgate_core::ledger::{
    NewRunEvent, RunEventKind, RunLedger, RunMetadata, RunState, RunSummary,
};
use buildgate_core::obs;
use buildgate_core::{
    MatrixCell, Pipeline, PipelineFailure, PipelineResult, PipelineStatus, Result, RunId, RunKey,
    RunOutcome, RunResult, Stage, StageOutcome, TriggerEvent,
};
use chrono::{DateTime, Utc};
use serde_json::json;
use tokio::sync::Semaphore;
use tracing::{error, info, Instrument};

use crate::governor::{ConcurrencyGovernor, RunLease};
use crate::pipeline::{PipelineRunner, RunContext};
use crate::workflow::Workflow;

/// Coordinator tuning.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoordinatorConfig {
    /// Upper bound on pipelines running at once within a run. `None` runs
    /// every matrix cell concurrently.
    pub max_parallel: Option<usize>,
}

/// Top-level driver for one workflow.
///
/// Share it (e.g. behind an `Arc`) between event sources: superseding only
/// works between runs started through the same coordinator.
pub struct RunCoordinator {
    workflow: Workflow,
    governor: ConcurrencyGovernor,
    runner: Arc<PipelineRunner>,
    ledger: Arc<dyn RunLedger>,
    config: CoordinatorConfig,
}

/// Bookkeeping for one spawned pipeline, kept outside the task so a task
/// that dies can still be reported.
struct Launched {
    name: String,
    cell: MatrixCell,
    stages: Vec<Stage>,
}

impl RunCoordinator {
    pub fn new(workflow: Workflow, runner: PipelineRunner) -> Self {
        let ledger = Arc::clone(runner.ledger());
        Self {
            workflow,
            governor: ConcurrencyGovernor::new(),
            runner: Arc::new(runner),
            ledger,
            config: CoordinatorConfig::default(),
        }
    }

    pub fn with_config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn ledger(&self) -> &Arc<dyn RunLedger> {
        &self.ledger
    }

    /// Start a run for `event` and wait for it to terminate.
    ///
    /// Expansion errors are returned before the run key is touched, so an
    /// invalid run never supersedes a valid one. A run superseded while in
    /// flight yields [`RunOutcome::Cancelled`] and produces no result.
    pub async fn start(&self, event: TriggerEvent) -> Result<RunOutcome> {
        if !self.workflow.triggers_on(event.kind) {
            info!(
                workflow = %self.workflow.name,
                kind = %event.kind,
                "Workflow does not trigger on this event; ignoring"
            );
            return Ok(RunOutcome::Ignored { kind: event.kind });
        }

        let run_key = event.run_key(&self.workflow.name);
        let pipelines = self.workflow.expand()?;

        let lease = self.governor.acquire(run_key.clone());
        let started_at = Utc::now();
        let run_id = self
            .ledger
            .create_run(RunMetadata {
                workflow: self.workflow.name.clone(),
                workflow_digest: self.workflow.digest(),
                run_key: run_key.clone(),
                event: event.clone(),
                pipelines: pipelines.iter().map(|p| p.name().to_string()).collect(),
            })
            .await?;

        let span = obs::run_span(&run_id, &run_key);
        self.execute(run_id, run_key, event, pipelines, lease, started_at)
            .instrument(span)
            .await
    }

    async fn execute(
        &self,
        run_id: RunId,
        run_key: RunKey,
        event: TriggerEvent,
        pipelines: Vec<Pipeline>,
        lease: RunLease,
        started_at: DateTime<Utc>,
    ) -> Result<RunOutcome> {
        obs::emit_run_started(&run_id, &run_key, pipelines.len());

        let ctx = Arc::new(
            RunContext::new(run_id.clone())
                .with_env("BUILDGATE_RUN_ID", run_id.to_string())
                .with_env("BUILDGATE_RUN_KEY", run_key.to_string())
                .with_env("BUILDGATE_EVENT", event.kind.as_str())
                .with_env("BUILDGATE_REF", event.git_ref.clone()),
        );
        let semaphore = self
            .config
            .max_parallel
            .map(|n| Arc::new(Semaphore::new(n.max(1))));

        let mut launched = Vec::with_capacity(pipelines.len());
        let mut tasks = Vec::with_capacity(pipelines.len());

        for pipeline in pipelines {
            launched.push(Launched {
                name: pipeline.name().to_string(),
                cell: pipeline.cell().clone(),
                stages: pipeline.stages().to_vec(),
            });

            let runner = Arc::clone(&self.runner);
            let ctx = Arc::clone(&ctx);
            let token = lease.token().clone();
            let semaphore = semaphore.clone();

            let task = tokio::spawn(
                async move {
                    let _permit = match semaphore {
                        Some(sem) => sem.acquire_owned().await.ok(),
                        None => None,
                    };
                    runner.run(&pipeline, &ctx, &token).await
                }
                .in_current_span(),
            );
            tasks.push(task);
        }

        // join_all preserves input order, so results stay in matrix order.
        let joined = futures::future::join_all(tasks).await;
        let mut results = Vec::with_capacity(joined.len());
        for (meta, joined) in launched.into_iter().zip(joined) {
            let result = match joined {
                Ok(result) => result,
                Err(err) => self.aborted(&run_id, meta, err.to_string()).await,
            };
            results.push(result);
        }

        let total_events = self.ledger.get_events(&run_id).await?.len() as u64;
        let passed = results.iter().filter(|r| r.passed()).count();
        let summary = RunSummary {
            total_events,
            duration_ms: (Utc::now() - started_at).num_milliseconds().max(0) as u64,
            passed_pipelines: passed,
            failed_pipelines: results.len() - passed,
        };

        if lease.is_revoked() {
            obs::emit_run_cancelled(&run_id, &run_key);
            self.ledger
                .finish_run(&run_id, RunState::Cancelled, summary)
                .await?;
            return Ok(RunOutcome::Cancelled { run_id, run_key });
        }

        let result = RunResult::from_pipelines(
            run_id.clone(),
            run_key,
            self.workflow.name.clone(),
            event,
            results,
            started_at,
        );
        let state = if result.succeeded() {
            RunState::Succeeded
        } else {
            RunState::Failed
        };
        self.ledger.finish_run(&run_id, state, summary).await?;
        obs::emit_run_finished(&result);

        Ok(RunOutcome::Completed(result))
    }

    /// Result for a pipeline whose task died before reporting.
    async fn aborted(&self, run_id: &RunId, meta: Launched, message: String) -> PipelineResult {
        error!(pipeline = %meta.name, error = %message, "Pipeline task aborted");
        let failure = PipelineFailure::Aborted { message };

        let appended = self
            .ledger
            .append_event(
                run_id,
                NewRunEvent::pipeline(
                    RunEventKind::PipelineFinished,
                    &meta.name,
                    json!({ "status": PipelineStatus::Failed, "failure": &failure }),
                ),
            )
            .await;
        if let Err(err) = appended {
            obs::emit_ledger_error(run_id, &err);
        }

        PipelineResult {
            pipeline: meta.name,
            cell: meta.cell,
            status: PipelineStatus::Failed,
            stages: meta.stages.iter().map(StageOutcome::skipped).collect(),
            failure: Some(failure),
            duration_ms: 0,
        }
    }
}
