//! Pipelines, pipeline templates and pipeline results.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use toolchain_manager::{ProvisionError, ToolchainSpec};

use crate::domain::error::{BuildGateError, Result};
use crate::domain::matrix::MatrixCell;
use crate::domain::stage::{Stage, StageOutcome, StageStatus};

/// Pipeline shape before matrix expansion.
///
/// Stage commands and env values may reference `${{ matrix.<name> }}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineTemplate {
    pub name: String,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub toolchain: Option<ToolchainSpec>,
    pub working_dir: PathBuf,
}

impl PipelineTemplate {
    pub fn new(name: impl Into<String>, stages: Vec<Stage>) -> Self {
        Self {
            name: name.into(),
            stages,
            toolchain: None,
            working_dir: PathBuf::from("."),
        }
    }

    pub fn with_toolchain(mut self, toolchain: ToolchainSpec) -> Self {
        self.toolchain = Some(toolchain);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }
}

/// Ordered stages for one matrix cell. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Pipeline {
    name: String,
    cell: MatrixCell,
    stages: Vec<Stage>,
    toolchain: Option<ToolchainSpec>,
    working_dir: PathBuf,
}

impl Pipeline {
    /// Build a pipeline, rejecting duplicate stage names and empty commands.
    pub fn new(
        name: impl Into<String>,
        cell: MatrixCell,
        stages: Vec<Stage>,
        toolchain: Option<ToolchainSpec>,
        working_dir: PathBuf,
    ) -> Result<Self> {
        let name = name.into();
        let mut seen = HashSet::new();
        for stage in &stages {
            if stage.name.trim().is_empty() {
                return Err(BuildGateError::InvalidPipeline(format!(
                    "pipeline {name:?} has a stage with an empty name"
                )));
            }
            if !seen.insert(stage.name.as_str()) {
                return Err(BuildGateError::InvalidPipeline(format!(
                    "pipeline {name:?} declares stage {:?} more than once",
                    stage.name
                )));
            }
            if stage.command.is_empty() {
                return Err(BuildGateError::InvalidPipeline(format!(
                    "stage {:?} in pipeline {name:?} has an empty command",
                    stage.name
                )));
            }
        }
        Ok(Self {
            name,
            cell,
            stages,
            toolchain,
            working_dir,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cell(&self) -> &MatrixCell {
        &self.cell
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn toolchain(&self) -> Option<&ToolchainSpec> {
        self.toolchain.as_ref()
    }

    pub fn working_dir(&self) -> &PathBuf {
        &self.working_dir
    }
}

/// Terminal state of a pipeline.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Passed,
    Failed,
    /// Superseded; distinct from failed.
    Cancelled,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Passed => write!(f, "passed"),
            PipelineStatus::Failed => write!(f, "failed"),
            PipelineStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Why a pipeline failed. The first failure wins.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineFailure {
    /// A stage exited non-zero.
    Stage { stage: String, exit_code: i32 },
    /// The toolchain could not be provisioned; no stage ran.
    Provision(ProvisionError),
    /// The pipeline task died (e.g. panicked).
    Aborted { message: String },
}

impl std::fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineFailure::Stage { stage, exit_code } => {
                write!(f, "stage {stage:?} exited with code {exit_code}")
            }
            PipelineFailure::Provision(err) => write!(f, "{err}"),
            PipelineFailure::Aborted { message } => write!(f, "aborted: {message}"),
        }
    }
}

/// Result of running one pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline: String,
    pub cell: MatrixCell,
    pub status: PipelineStatus,
    /// One outcome per declared stage, in declaration order.
    pub stages: Vec<StageOutcome>,
    pub failure: Option<PipelineFailure>,
    pub duration_ms: u64,
}

impl PipelineResult {
    pub fn passed(&self) -> bool {
        self.status == PipelineStatus::Passed
    }

    pub fn passed_count(&self) -> usize {
        self.count(StageStatus::Passed)
    }

    pub fn failed_count(&self) -> usize {
        self.count(StageStatus::Failed)
    }

    pub fn skipped_count(&self) -> usize {
        self.count(StageStatus::Skipped)
    }

    fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }

    /// Convert this pipeline's failure into a domain error, if it failed.
    pub fn error(&self) -> Option<BuildGateError> {
        match (&self.status, &self.failure) {
            (PipelineStatus::Passed, _) => None,
            (PipelineStatus::Cancelled, _) => Some(BuildGateError::PipelineAborted {
                pipeline: self.pipeline.clone(),
                message: "cancelled".to_string(),
            }),
            (PipelineStatus::Failed, Some(PipelineFailure::Stage { stage, exit_code })) => {
                Some(BuildGateError::StageFailure {
                    pipeline: self.pipeline.clone(),
                    stage: stage.clone(),
                    exit_code: *exit_code,
                })
            }
            (PipelineStatus::Failed, Some(PipelineFailure::Provision(err))) => {
                Some(BuildGateError::Provision(err.clone()))
            }
            (PipelineStatus::Failed, Some(PipelineFailure::Aborted { message })) => {
                Some(BuildGateError::PipelineAborted {
                    pipeline: self.pipeline.clone(),
                    message: message.clone(),
                })
            }
            (PipelineStatus::Failed, None) => Some(BuildGateError::PipelineAborted {
                pipeline: self.pipeline.clone(),
                message: "failed without a recorded cause".to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stage(name: &str) -> Stage {
        Stage::new(name, ["true"])
    }

    #[test]
    fn test_pipeline_rejects_duplicate_stage_names() {
        let err = Pipeline::new(
            "ci",
            MatrixCell::default(),
            vec![stage("a"), stage("b"), stage("a")],
            None,
            PathBuf::from("."),
        )
        .expect_err("duplicate names must be rejected");
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_pipeline_rejects_empty_command() {
        let empty = Stage::new("noop", Vec::<String>::new());
        let err = Pipeline::new(
            "ci",
            MatrixCell::default(),
            vec![empty],
            None,
            PathBuf::from("."),
        )
        .expect_err("empty command must be rejected");
        assert!(matches!(err, BuildGateError::InvalidPipeline(_)));
    }

    #[test]
    fn test_pipeline_accessors() {
        let pipeline = Pipeline::new(
            "ci",
            MatrixCell::default(),
            vec![stage("fmt"), stage("test")],
            Some(ToolchainSpec::stable()),
            PathBuf::from("/work"),
        )
        .expect("valid pipeline");
        assert_eq!(pipeline.name(), "ci");
        assert_eq!(pipeline.stages().len(), 2);
        assert_eq!(pipeline.toolchain().map(|t| t.channel.as_str()), Some("stable"));
        assert_eq!(pipeline.working_dir(), &PathBuf::from("/work"));
    }

    #[test]
    fn test_pipeline_result_counts_and_error() {
        let a = stage("a");
        let b = stage("b");
        let c = stage("c");
        let result = PipelineResult {
            pipeline: "ci".to_string(),
            cell: MatrixCell::default(),
            status: PipelineStatus::Failed,
            stages: vec![
                StageOutcome::executed(&a, 0, String::new(), String::new(), 1),
                StageOutcome::executed(&b, 2, String::new(), String::new(), 1),
                StageOutcome::skipped(&c),
            ],
            failure: Some(PipelineFailure::Stage {
                stage: "b".to_string(),
                exit_code: 2,
            }),
            duration_ms: 2,
        };
        assert_eq!(result.passed_count(), 1);
        assert_eq!(result.failed_count(), 1);
        assert_eq!(result.skipped_count(), 1);
        assert!(matches!(
            result.error(),
            Some(BuildGateError::StageFailure { exit_code: 2, .. })
        ));
    }

    #[test]
    fn test_passed_pipeline_has_no_error() {
        let result = PipelineResult {
            pipeline: "ci".to_string(),
            cell: MatrixCell::default(),
            status: PipelineStatus::Passed,
            stages: vec![],
            failure: None,
            duration_ms: 0,
        };
        assert!(result.error().is_none());
    }
}
