//! Gate evaluation over a run's recorded events.

use std::collections::{BTreeSet, HashSet};

use buildgate_core::ledger::{RunEvent, RunEventKind};
use buildgate_core::RunResult;
use serde::{Deserialize, Serialize};

/// Gate evaluation verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GateVerdict {
    /// Whether the gate passed.
    pub passed: bool,

    /// Violations that caused failure (empty if passed).
    pub violations: Vec<String>,

    /// Summary message.
    pub message: String,
}

/// Pass/fail rules applied to ledger events.
pub struct RunGate;

impl RunGate {
    /// Evaluate a run's events.
    ///
    /// Rules:
    /// - every failed stage is a violation, including continue-on-failure ones
    /// - a toolchain that failed to provision is a violation
    /// - a cancelled pipeline is a violation
    /// - a stage that started but has no terminal event is a violation
    /// - a pipeline that started but never finished is a violation
    pub fn evaluate(events: &[RunEvent]) -> GateVerdict {
        let mut violations = Vec::new();
        let mut started = BTreeSet::new();
        let mut completed = HashSet::new();
        let mut pipelines_started = BTreeSet::new();
        let mut pipelines_done = HashSet::new();

        for event in events {
            let stage = event.stage.clone().unwrap_or_default();
            match event.kind {
                RunEventKind::PipelineStarted => {
                    pipelines_started.insert(event.pipeline.clone());
                }
                RunEventKind::PipelineFinished => {
                    pipelines_done.insert(event.pipeline.clone());
                }
                RunEventKind::PipelineCancelled => {
                    pipelines_done.insert(event.pipeline.clone());
                    violations.push(format!("Pipeline '{}' was cancelled", event.pipeline));
                }
                RunEventKind::ToolchainFailed => {
                    let error = event.payload["error"]
                        .get("kind")
                        .and_then(|k| k.as_str())
                        .unwrap_or("unknown");
                    violations.push(format!(
                        "Pipeline '{}' could not provision its toolchain ({error})",
                        event.pipeline
                    ));
                }
                RunEventKind::ToolchainReady => {}
                RunEventKind::StageStarted => {
                    started.insert((event.pipeline.clone(), stage));
                }
                RunEventKind::StagePassed | RunEventKind::StageSkipped => {
                    completed.insert((event.pipeline.clone(), stage));
                }
                RunEventKind::StageFailed => {
                    let exit_code = event.payload["exit_code"].as_i64().unwrap_or(-1);
                    violations.push(format!(
                        "Stage '{stage}' in '{}' failed with exit code {exit_code}",
                        event.pipeline
                    ));
                    completed.insert((event.pipeline.clone(), stage));
                }
            }
        }

        for (pipeline, stage) in &started {
            if !completed.contains(&(pipeline.clone(), stage.clone())) {
                violations.push(format!(
                    "Stage '{stage}' in '{pipeline}' was started but never completed"
                ));
            }
        }
        for pipeline in &pipelines_started {
            if !pipelines_done.contains(pipeline) {
                violations.push(format!("Pipeline '{pipeline}' never finished"));
            }
        }

        verdict(violations)
    }

    /// Evaluate events and cross-check them against the aggregated result.
    pub fn evaluate_run(result: &RunResult, events: &[RunEvent]) -> GateVerdict {
        let mut violations = Self::evaluate(events).violations;

        for pipeline in &result.pipelines {
            let recorded = events.iter().any(|e| {
                e.kind == RunEventKind::PipelineFinished && e.pipeline == pipeline.pipeline
            });
            if !recorded {
                violations.push(format!(
                    "Pipeline '{}' has no finish event in the ledger",
                    pipeline.pipeline
                ));
            }
        }
        if result.succeeded() && !violations.is_empty() {
            violations.push("Run reported success but its ledger shows failures".to_string());
        }
        if !result.succeeded() && violations.is_empty() {
            violations.push("Run reported failure but its ledger shows none".to_string());
        }

        verdict(violations)
    }
}

fn verdict(violations: Vec<String>) -> GateVerdict {
    let passed = violations.is_empty();
    let message = if passed {
        "All stages passed".to_string()
    } else {
        format!("Gate failed with {} violation(s)", violations.len())
    };
    GateVerdict {
        passed,
        violations,
        message,
    }
}
