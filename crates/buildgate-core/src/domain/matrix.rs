//! Matrix dimensions and cells.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::domain::error::ExpansionError;

/// A named set of values one pipeline template is expanded over
/// (e.g. `os` in `{macos, ubuntu}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatrixDimension {
    pub name: String,
    pub values: Vec<String>,
}

impl MatrixDimension {
    pub fn new<I, V>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// Check the dimension is usable: a name, at least one value, no repeats.
    pub fn validate(&self) -> Result<(), ExpansionError> {
        if self.name.trim().is_empty() {
            return Err(ExpansionError::EmptyDimensionName);
        }
        if self.values.is_empty() {
            return Err(ExpansionError::EmptyDimension {
                dimension: self.name.clone(),
            });
        }
        let mut seen = HashSet::new();
        for value in &self.values {
            if !seen.insert(value.as_str()) {
                return Err(ExpansionError::DuplicateValue {
                    dimension: self.name.clone(),
                    value: value.clone(),
                });
            }
        }
        Ok(())
    }

    /// Environment variable carrying this dimension's value, e.g. `MATRIX_OS`.
    pub fn env_key(&self) -> String {
        matrix_env_key(&self.name)
    }
}

impl std::str::FromStr for MatrixDimension {
    type Err = ExpansionError;

    /// Parse `name=v1,v2`. `name=` yields a dimension with no values, which
    /// [`MatrixDimension::validate`] rejects.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || ExpansionError::MalformedDimension {
            spec: s.to_string(),
        };
        let (name, values) = s.split_once('=').ok_or_else(malformed)?;
        let name = name.trim();
        if name.is_empty() {
            return Err(malformed());
        }
        let values: Vec<&str> = values
            .split(',')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .collect();
        Ok(MatrixDimension::new(name, values))
    }
}

pub(crate) fn matrix_env_key(name: &str) -> String {
    let normalized: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("MATRIX_{normalized}")
}

/// One combination of dimension values, in dimension declaration order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatrixCell {
    entries: Vec<(String, String)>,
}

impl MatrixCell {
    pub fn new(entries: Vec<(String, String)>) -> Self {
        Self { entries }
    }

    /// Value assigned to `dimension` in this cell.
    pub fn get(&self, dimension: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(name, _)| name == dimension)
            .map(|(_, value)| value.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `MATRIX_<NAME>` environment pairs for this cell.
    pub fn env(&self) -> impl Iterator<Item = (String, String)> + '_ {
        self.entries
            .iter()
            .map(|(name, value)| (matrix_env_key(name), value.clone()))
    }

    /// Replace `${{ matrix.<name> }}` placeholders with this cell's values.
    ///
    /// Whitespace inside the braces is optional. Unknown names are left as-is.
    pub fn substitute(&self, input: &str) -> String {
        if !input.contains("${{") {
            return input.to_string();
        }
        let mut out = String::with_capacity(input.len());
        let mut rest = input;
        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 3..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                return out;
            };
            let expr = after[..end].trim();
            let replacement = expr
                .strip_prefix("matrix.")
                .and_then(|name| self.get(name.trim()));
            match replacement {
                Some(value) => out.push_str(value),
                None => out.push_str(&rest[start..start + 3 + end + 2]),
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);
        out
    }
}

impl std::fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let values: Vec<&str> = self.entries.iter().map(|(_, v)| v.as_str()).collect();
        f.write_str(&values.join(", "))
    }
}
