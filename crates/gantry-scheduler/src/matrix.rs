//! Matrix expansion of job templates into instance cells.

use crate::templates::JobTemplate;
use gantry_core::ids::InstanceKey;
use gantry_core::pipeline::{OneOrMany, ParallelConfig, ScalarValue};
use gantry_core::{Error, Result};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashSet;

/// Upper bound on instances produced from one template.
pub const MAX_PARALLEL: usize = 200;

/// One cell of an expanded template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatrixCell {
    pub key: InstanceKey,
    /// Axis values in declaration order; empty without a matrix.
    pub values: IndexMap<String, String>,
    /// `(index, total)`, 1-based, when the template is parallelized.
    pub node: Option<(usize, usize)>,
}

/// Expander for `parallel` configurations.
pub struct JobExpander;

impl JobExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a template into its cells.
    ///
    /// Each matrix entry contributes the cartesian product of its axes. Keys
    /// are `name[AXIS=value, ...]` in axis order; `parallel: N` yields
    /// `name 1/N` through `name N/N`.
    pub fn expand(&self, template: &JobTemplate) -> Result<Vec<MatrixCell>> {
        let name = template.name.as_str();
        let cells = match &template.parallel {
            None => vec![MatrixCell {
                key: InstanceKey::new(name),
                values: IndexMap::new(),
                node: None,
            }],
            Some(ParallelConfig::Count(count)) => self.expand_count(name, *count as usize)?,
            Some(ParallelConfig::Matrix { matrix }) => self.expand_matrix(name, matrix)?,
        };

        if cells.len() > MAX_PARALLEL {
            return Err(Error::Config(format!(
                "Job '{}' expands to {} instances; the limit is {}",
                name,
                cells.len(),
                MAX_PARALLEL
            )));
        }

        let mut seen = HashSet::new();
        for cell in &cells {
            if !seen.insert(cell.key.clone()) {
                return Err(Error::Config(format!(
                    "Job '{}' produces duplicate instance '{}'",
                    name, cell.key
                )));
            }
        }

        Ok(cells)
    }

    fn expand_count(&self, name: &str, count: usize) -> Result<Vec<MatrixCell>> {
        if count == 0 || count > MAX_PARALLEL {
            return Err(Error::Config(format!(
                "Job '{}' has parallel: {}; expected 1 to {}",
                name, count, MAX_PARALLEL
            )));
        }
        Ok((1..=count)
            .map(|index| MatrixCell {
                key: InstanceKey::new(format!("{} {}/{}", name, index, count)),
                values: IndexMap::new(),
                node: Some((index, count)),
            })
            .collect())
    }

    fn expand_matrix(
        &self,
        name: &str,
        matrix: &[IndexMap<String, OneOrMany<ScalarValue>>],
    ) -> Result<Vec<MatrixCell>> {
        if matrix.is_empty() {
            return Err(Error::Config(format!(
                "Job '{}' has an empty matrix",
                name
            )));
        }

        let mut combinations: Vec<IndexMap<String, String>> = Vec::new();
        for (entry_index, entry) in matrix.iter().enumerate() {
            if entry.is_empty() {
                return Err(Error::Config(format!(
                    "Job '{}' matrix entry {} has no axes",
                    name, entry_index
                )));
            }
            combinations.extend(self.generate_combinations(name, entry)?);
        }

        let total = combinations.len();
        Ok(combinations
            .into_iter()
            .enumerate()
            .map(|(idx, values)| MatrixCell {
                key: InstanceKey::new(format_key(name, &values)),
                values,
                node: Some((idx + 1, total)),
            })
            .collect())
    }

    fn generate_combinations(
        &self,
        name: &str,
        entry: &IndexMap<String, OneOrMany<ScalarValue>>,
    ) -> Result<Vec<IndexMap<String, String>>> {
        let mut result = vec![IndexMap::new()];

        for (axis, values) in entry {
            let values: Vec<String> = values.to_vec().iter().map(ToString::to_string).collect();
            if values.is_empty() {
                return Err(Error::Config(format!(
                    "Job '{}' matrix axis '{}' has no values",
                    name, axis
                )));
            }

            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in &values {
                    let mut new_combo = combo.clone();
                    new_combo.insert(axis.clone(), value.clone());
                    next.push(new_combo);
                }
            }
            result = next;
        }

        Ok(result)
    }
}

impl Default for JobExpander {
    fn default() -> Self {
        Self::new()
    }
}

/// `name[AXIS=value, AXIS2=value2]`.
pub fn format_key(name: &str, values: &IndexMap<String, String>) -> String {
    if values.is_empty() {
        return name.to_string();
    }
    let parts: Vec<String> = values.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
    format!("{}[{}]", name, parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::TemplateCatalog;
    use gantry_core::pipeline::PipelineConfig;
    use pretty_assertions::assert_eq;

    fn expand(yaml: &str, job: &str) -> Result<Vec<MatrixCell>> {
        let catalog = TemplateCatalog::load(&PipelineConfig::from_yaml(yaml)?)?;
        JobExpander::new().expand(catalog.get(job).unwrap())
    }

    fn keys(cells: &[MatrixCell]) -> Vec<&str> {
        cells.iter().map(|c| c.key.as_str()).collect()
    }

    #[test]
    fn test_no_matrix_single_instance() {
        let cells = expand("jobs:\n  build:\n    script: make\n", "build").unwrap();
        assert_eq!(keys(&cells), vec!["build"]);
        assert_eq!(cells[0].node, None);
    }

    #[test]
    fn test_cartesian_product_in_axis_order() {
        let cells = expand(
            r#"
jobs:
  test:
    script: make test
    parallel:
      matrix:
        - OS: [linux, macos]
          RUST: ["1.80", "1.81"]
        - OS: windows
          RUST: "1.81"
"#,
            "test",
        )
        .unwrap();

        assert_eq!(
            keys(&cells),
            vec![
                "test[OS=linux, RUST=1.80]",
                "test[OS=linux, RUST=1.81]",
                "test[OS=macos, RUST=1.80]",
                "test[OS=macos, RUST=1.81]",
                "test[OS=windows, RUST=1.81]",
            ]
        );
        assert_eq!(cells[4].node, Some((5, 5)));
        assert_eq!(cells[2].values["OS"], "macos");
    }

    #[test]
    fn test_parallel_count() {
        let cells = expand("jobs:\n  shard:\n    script: make\n    parallel: 3\n", "shard").unwrap();
        assert_eq!(keys(&cells), vec!["shard 1/3", "shard 2/3", "shard 3/3"]);
    }

    #[test]
    fn test_empty_axis_is_config_error() {
        let err = expand(
            "jobs:\n  t:\n    script: make\n    parallel:\n      matrix:\n        - OS: []\n",
            "t",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_empty_entry_is_config_error() {
        let err = expand(
            "jobs:\n  t:\n    script: make\n    parallel:\n      matrix:\n        - {}\n",
            "t",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_duplicate_cells_are_config_error() {
        let err = expand(
            r#"
jobs:
  t:
    script: make
    parallel:
      matrix:
        - OS: linux
        - OS: [linux]
"#,
            "t",
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate instance"));
    }

    #[test]
    fn test_non_scalar_value_rejected_at_parse() {
        let err = expand(
            "jobs:\n  t:\n    script: make\n    parallel:\n      matrix:\n        - OS: { nested: true }\n",
            "t",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
