//! Variable resolution with layered precedence.

use crate::matrix::MatrixCell;
use crate::templates::JobTemplate;
use gantry_core::trigger::TriggerContext;
use indexmap::IndexMap;
use serde::Serialize;

/// Ordered variable set; insertion order follows the layer that first defined a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct VariableSet(IndexMap<String, String>);

impl VariableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &String)> {
        self.0.iter()
    }

    pub fn as_map(&self) -> &IndexMap<String, String> {
        &self.0
    }

    /// Apply a layer: later writers win, existing keys keep their position.
    fn apply<'a, I>(&mut self, layer: I)
    where
        I: IntoIterator<Item = (&'a String, &'a String)>,
    {
        for (key, value) in layer {
            self.0.insert(key.clone(), value.clone());
        }
    }

    fn set(&mut self, key: &str, value: impl Into<String>) {
        self.0.insert(key.to_string(), value.into());
    }
}

/// Resolves the variables of job instances for one trigger.
///
/// Precedence, lowest first: trigger variables, global defaults, each
/// ancestor in linearized order, the job's own variables, the matrix cell,
/// the matching rule's variables, predefined job variables.
pub struct VariableResolver {
    base: VariableSet,
}

impl VariableResolver {
    pub fn new(ctx: &TriggerContext, globals: &IndexMap<String, String>) -> Self {
        let mut base = VariableSet::new();
        base.apply(&ctx.predefined_variables());
        base.apply(&ctx.variables);
        base.apply(globals);
        Self { base }
    }

    pub fn resolve(
        &self,
        template: &JobTemplate,
        cell: &MatrixCell,
        rule_vars: &IndexMap<String, String>,
    ) -> VariableSet {
        let mut vars = self.base.clone();
        for layer in &template.variable_layers {
            vars.apply(layer);
        }
        vars.apply(&cell.values);
        vars.apply(rule_vars);

        vars.set("CI_JOB_NAME", cell.key.as_str());
        if let Some(stage) = &template.stage {
            vars.set("CI_JOB_STAGE", stage.as_str());
        }
        if let Some((index, total)) = cell.node {
            vars.set("CI_NODE_INDEX", index.to_string());
            vars.set("CI_NODE_TOTAL", total.to_string());
        }
        vars
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::JobExpander;
    use crate::templates::TemplateCatalog;
    use gantry_core::pipeline::PipelineConfig;
    use gantry_core::trigger::EventSource;
    use pretty_assertions::assert_eq;

    const CONFIG: &str = r#"
variables:
  LEVEL: global
  GLOBAL_ONLY: g
jobs:
  .base:
    variables:
      LEVEL: base
      BASE_ONLY: b
  test:
    extends: .base
    stage: test
    script: make test
    variables:
      LEVEL: own
      OS: default
    parallel:
      matrix:
        - OS: [linux, macos]
"#;

    fn setup() -> (TemplateCatalog, TriggerContext) {
        let config = PipelineConfig::from_yaml(CONFIG).unwrap();
        let ctx = TriggerContext::new(EventSource::Push, "main").with_variable("LEVEL", "trigger");
        (TemplateCatalog::load(&config).unwrap(), ctx)
    }

    #[test]
    fn test_precedence_order() {
        let (catalog, ctx) = setup();
        let template = catalog.get("test").unwrap();
        let cells = JobExpander::new().expand(template).unwrap();
        let resolver = VariableResolver::new(&ctx, catalog.globals());

        let vars = resolver.resolve(template, &cells[1], &IndexMap::new());
        assert_eq!(vars.get("LEVEL"), Some("own"));
        assert_eq!(vars.get("OS"), Some("macos"));
        assert_eq!(vars.get("BASE_ONLY"), Some("b"));
        assert_eq!(vars.get("GLOBAL_ONLY"), Some("g"));
        assert_eq!(vars.get("CI_PIPELINE_SOURCE"), Some("push"));
        assert_eq!(vars.get("CI_JOB_NAME"), Some("test[OS=macos]"));
        assert_eq!(vars.get("CI_JOB_STAGE"), Some("test"));
        assert_eq!(vars.get("CI_NODE_INDEX"), Some("2"));
        assert_eq!(vars.get("CI_NODE_TOTAL"), Some("2"));
    }

    #[test]
    fn test_rule_variables_override_matrix() {
        let (catalog, ctx) = setup();
        let template = catalog.get("test").unwrap();
        let cells = JobExpander::new().expand(template).unwrap();
        let resolver = VariableResolver::new(&ctx, catalog.globals());

        let mut rule_vars = IndexMap::new();
        rule_vars.insert("OS".to_string(), "from-rule".to_string());
        rule_vars.insert("CI_JOB_NAME".to_string(), "ignored".to_string());
        let vars = resolver.resolve(template, &cells[0], &rule_vars);
        assert_eq!(vars.get("OS"), Some("from-rule"));
        assert_eq!(vars.get("CI_JOB_NAME"), Some("test[OS=linux]"));
    }

    #[test]
    fn test_resolve_is_deterministic() {
        let (catalog, ctx) = setup();
        let template = catalog.get("test").unwrap();
        let cells = JobExpander::new().expand(template).unwrap();

        let first = VariableResolver::new(&ctx, catalog.globals()).resolve(
            template,
            &cells[0],
            &IndexMap::new(),
        );
        let second = VariableResolver::new(&ctx, catalog.globals()).resolve(
            template,
            &cells[0],
            &IndexMap::new(),
        );
        assert_eq!(first, second);
        let keys_a: Vec<_> = first.iter().map(|(k, _)| k.clone()).collect();
        let keys_b: Vec<_> = second.iter().map(|(k, _)| k.clone()).collect();
        assert_eq!(keys_a, keys_b);
    }
}
