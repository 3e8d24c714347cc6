//! Structured lifecycle events for runs and stages.
//!
//! Every event carries an `event` field (`run.started`, `run.superseded`,
//! `run.cancelled`, `run.finished`, `stage.finished`) so JSON logs can be
//! filtered without parsing messages.

use tracing::{info, warn};

use crate::domain::{RunId, RunKey, RunResult, StageOutcome, StageStatus};

/// Run-scoped span; attach it to the run's future with `tracing::Instrument`.
pub fn run_span(run_id: &RunId, run_key: &RunKey) -> tracing::Span {
    tracing::info_span!("buildgate.run", run_id = %run_id, run_key = %run_key)
}

pub fn emit_run_started(run_id: &RunId, run_key: &RunKey, pipelines: usize) {
    info!(
        event = "run.started",
        run_id = %run_id,
        run_key = %run_key,
        pipelines = pipelines,
    );
}

/// A newer run took over `run_key`; `previous_generation` is the lease it revoked.
pub fn emit_run_superseded(run_key: &RunKey, previous_generation: u64) {
    warn!(
        event = "run.superseded",
        run_key = %run_key,
        previous_generation = previous_generation,
    );
}

pub fn emit_run_cancelled(run_id: &RunId, run_key: &RunKey) {
    warn!(event = "run.cancelled", run_id = %run_id, run_key = %run_key);
}

pub fn emit_run_finished(result: &RunResult) {
    info!(
        event = "run.finished",
        run_id = %result.run_id,
        run_key = %result.run_key,
        conclusion = %result.conclusion,
        passed = result.passed_count(),
        failed = result.failed_count(),
        duration_ms = result.duration_ms,
    );
}

pub fn emit_stage_finished(pipeline: &str, outcome: &StageOutcome) {
    match outcome.status {
        StageStatus::Failed => warn!(
            event = "stage.finished",
            pipeline = %pipeline,
            stage = %outcome.stage,
            status = %outcome.status,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration_ms,
        ),
        _ => info!(
            event = "stage.finished",
            pipeline = %pipeline,
            stage = %outcome.stage,
            status = %outcome.status,
            exit_code = outcome.exit_code,
            duration_ms = outcome.duration_ms,
        ),
    }
}

/// A ledger write failed; the run continues but its record is incomplete.
pub fn emit_ledger_error(run_id: &RunId, error: &dyn std::fmt::Display) {
    warn!(event = "ledger.error", run_id = %run_id, error = %error);
}
