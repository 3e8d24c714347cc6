//! Matrix expansion: one pipeline per combination of dimension values.

use std::collections::HashSet;

use buildgate_core::{
    ExpansionError, MatrixCell, MatrixDimension, Pipeline, PipelineTemplate, Stage,
};

/// Expands a [`PipelineTemplate`] over matrix dimensions.
pub struct MatrixExpander;

impl MatrixExpander {
    /// Expand `template` over the cartesian product of `dimensions`.
    ///
    /// Cells come out in declaration order with the first dimension varying
    /// slowest. With no dimensions the result is a single pipeline with an
    /// empty cell. Validation happens before any pipeline is built, so an
    /// error means nothing was produced.
    pub fn expand(
        dimensions: &[MatrixDimension],
        template: &PipelineTemplate,
    ) -> Result<Vec<Pipeline>, ExpansionError> {
        Self::cells(dimensions)?
            .into_iter()
            .map(|cell| instantiate(template, cell))
            .collect()
    }

    /// Validated cells in expansion order.
    pub fn cells(dimensions: &[MatrixDimension]) -> Result<Vec<MatrixCell>, ExpansionError> {
        let mut names = HashSet::new();
        let mut env_keys = HashSet::new();
        for dimension in dimensions {
            dimension.validate()?;
            // `rust-version` and `rust_version` would share MATRIX_RUST_VERSION.
            if !names.insert(dimension.name.as_str()) || !env_keys.insert(dimension.env_key()) {
                return Err(ExpansionError::DuplicateDimension {
                    dimension: dimension.name.clone(),
                });
            }
        }
        Ok(cartesian_product(dimensions))
    }
}

fn cartesian_product(dimensions: &[MatrixDimension]) -> Vec<MatrixCell> {
    let mut combos: Vec<Vec<(String, String)>> = vec![Vec::new()];
    for dimension in dimensions {
        combos = combos
            .into_iter()
            .flat_map(|prefix| {
                dimension.values.iter().map(move |value| {
                    let mut next = prefix.clone();
                    next.push((dimension.name.clone(), value.clone()));
                    next
                })
            })
            .collect();
    }
    combos.into_iter().map(MatrixCell::new).collect()
}

fn pipeline_name(template: &str, cell: &MatrixCell) -> String {
    if cell.is_empty() {
        template.to_string()
    } else {
        format!("{template} ({cell})")
    }
}

fn instantiate(
    template: &PipelineTemplate,
    cell: MatrixCell,
) -> Result<Pipeline, ExpansionError> {
    let name = pipeline_name(&template.name, &cell);

    let stages: Vec<Stage> = template
        .stages
        .iter()
        .map(|stage| {
            let mut expanded = stage.clone();
            expanded.name = cell.substitute(&stage.name);
            expanded.command = stage
                .command
                .iter()
                .map(|arg| cell.substitute(arg))
                .collect();
            for value in expanded.env.values_mut() {
                *value = cell.substitute(value);
            }
            expanded.env.extend(cell.env());
            expanded
        })
        .collect();

    let toolchain = template.toolchain.clone().map(|mut spec| {
        spec.channel = cell.substitute(&spec.channel);
        spec
    });

    Pipeline::new(
        name.clone(),
        cell,
        stages,
        toolchain,
        template.working_dir.clone(),
    )
    .map_err(|e| ExpansionError::InvalidPipeline {
        pipeline: name,
        reason: e.to_string(),
    })
}
