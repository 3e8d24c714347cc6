//! Workflow definitions.

use std::path::PathBuf;

use buildgate_core::{
    ExpansionError, MatrixDimension, Pipeline, PipelineTemplate, TriggerKind,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use toolchain_manager::ToolchainSpec;

use crate::matrix::MatrixExpander;
use crate::stage::BuiltinStage;

/// A named pipeline template, the events that trigger it, and its matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub triggers: Vec<TriggerKind>,
    #[serde(default)]
    pub dimensions: Vec<MatrixDimension>,
    pub template: PipelineTemplate,
}

impl Workflow {
    /// Workflow triggered by every event kind, with no matrix.
    pub fn new(name: impl Into<String>, template: PipelineTemplate) -> Self {
        Self {
            name: name.into(),
            triggers: TriggerKind::ALL.to_vec(),
            dimensions: Vec::new(),
            template,
        }
    }

    pub fn with_triggers(mut self, triggers: impl IntoIterator<Item = TriggerKind>) -> Self {
        self.triggers = triggers.into_iter().collect();
        self
    }

    pub fn with_dimension(mut self, dimension: MatrixDimension) -> Self {
        self.dimensions.push(dimension);
        self
    }

    pub fn triggers_on(&self, kind: TriggerKind) -> bool {
        self.triggers.contains(&kind)
    }

    /// Expand the template over this workflow's matrix.
    pub fn expand(&self) -> Result<Vec<Pipeline>, ExpansionError> {
        MatrixExpander::expand(&self.dimensions, &self.template)
    }

    /// Deterministic digest of the ordered stage names.
    pub fn digest(&self) -> String {
        let names: Vec<&str> = self.template.stages.iter().map(|s| s.name.as_str()).collect();
        compute_stages_digest(&names)
    }

    /// Format check, compile check and tests on push, pull request and
    /// manual dispatch, expanded over an `os` dimension.
    ///
    /// When a toolchain is given, the components the stages need are added
    /// to it.
    pub fn rust_ci<I, V>(
        os: I,
        working_dir: impl Into<PathBuf>,
        toolchain: Option<ToolchainSpec>,
    ) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self::from_builtins(
            "ci",
            &[
                BuiltinStage::CargoFmt,
                BuiltinStage::CargoCheck,
                BuiltinStage::CargoTest,
            ],
            working_dir,
            toolchain,
        )
        .with_dimension(MatrixDimension::new("os", os))
    }

    /// Workflow over the given builtin stages, with no matrix.
    pub fn from_builtins(
        name: impl Into<String>,
        stages: &[BuiltinStage],
        working_dir: impl Into<PathBuf>,
        toolchain: Option<ToolchainSpec>,
    ) -> Self {
        let mut template = PipelineTemplate::new(
            name.into(),
            stages.iter().map(BuiltinStage::to_stage).collect(),
        )
        .with_working_dir(working_dir);

        if let Some(mut spec) = toolchain {
            for component in stages.iter().filter_map(BuiltinStage::required_component) {
                if !spec.components.iter().any(|c| c == component) {
                    spec.components.push(component.to_string());
                }
            }
            template = template.with_toolchain(spec);
        }

        let name = template.name.clone();
        Self::new(name, template)
    }
}

/// Compute deterministic digest of ordered stage names.
fn compute_stages_digest(stages: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for stage in stages {
        hasher.update(stage.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}
