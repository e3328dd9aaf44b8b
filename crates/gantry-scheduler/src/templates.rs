//! Template catalog: `extends` linearization and field merging.
//!
//! For `extends: [A, B]` the chain is `lin(A) ++ lin(B) ++ [self]`, depth
//! first and left to right. An ancestor reachable twice keeps its first
//! position. Every field except `variables` is taken from the last layer that
//! sets it; variables stay layered so the resolver can merge them key by key.

use crate::retry::RetryPolicy;
use crate::rules::{Rule, unreachable_rules};
use gantry_core::ids::TemplateName;
use gantry_core::parse_timeout;
use gantry_core::pipeline::{
    ArtifactConfig, JobDefinition, NeedConfig, ParallelConfig, PipelineConfig, WhenPolicy,
};
use gantry_core::{Error, Result};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// A fully merged job template. Immutable after load.
#[derive(Debug, Clone)]
pub struct JobTemplate {
    pub name: TemplateName,
    pub hidden: bool,
    /// Linearized ancestors, nearest-last, excluding the template itself.
    pub ancestors: Vec<TemplateName>,
    /// Variable layers in precedence order: ancestors first, own last.
    pub variable_layers: Vec<IndexMap<String, String>>,
    /// `None` when no layer declares `rules`.
    pub rules: Option<Vec<Rule>>,
    pub stage: Option<String>,
    pub before_script: Vec<String>,
    pub script: Vec<String>,
    pub after_script: Vec<String>,
    pub artifacts: ArtifactConfig,
    /// `None` when no layer declares `needs` (stage gating applies).
    pub needs: Option<Vec<NeedConfig>>,
    pub tags: BTreeSet<String>,
    pub timeout: Option<Duration>,
    pub interruptible: bool,
    pub allow_failure: bool,
    pub when: WhenPolicy,
    pub parallel: Option<ParallelConfig>,
    pub retry: RetryPolicy,
}

/// All templates of a pipeline, keyed by name in declaration order.
#[derive(Debug, Clone)]
pub struct TemplateCatalog {
    templates: IndexMap<TemplateName, Arc<JobTemplate>>,
    stages: Vec<String>,
    globals: IndexMap<String, String>,
    interruptible: bool,
    warnings: Vec<String>,
}

impl TemplateCatalog {
    /// Linearize and merge every job of `config`.
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let mut memo: HashMap<String, Vec<String>> = HashMap::new();
        let mut templates = IndexMap::new();
        let mut warnings = Vec::new();

        for name in config.jobs.keys() {
            let chain = linearize(name, config, &mut memo, &mut Vec::new())?;
            let template = merge(name, &chain, config)?;

            if let Some(rules) = &template.rules {
                for index in unreachable_rules(rules) {
                    let message = format!(
                        "Job '{}': rule {} is unreachable after an unconditional rule",
                        name, index
                    );
                    warn!(job = %name, rule = index, "Unreachable rule");
                    warnings.push(message);
                }
            }

            debug!(job = %name, ancestors = ?template.ancestors, "Template loaded");
            templates.insert(template.name.clone(), Arc::new(template));
        }

        Ok(Self {
            templates,
            stages: config.stages.clone(),
            globals: config
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.render()))
                .collect(),
            interruptible: config.workflow.interruptible,
            warnings,
        })
    }

    pub fn get(&self, name: &str) -> Option<&Arc<JobTemplate>> {
        self.templates.get(name)
    }

    /// Schedulable templates (hidden ones excluded), in declaration order.
    pub fn visible(&self) -> impl Iterator<Item = &Arc<JobTemplate>> {
        self.templates.values().filter(|t| !t.hidden)
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    pub fn globals(&self) -> &IndexMap<String, String> {
        &self.globals
    }

    /// Pipeline-level `workflow.interruptible`.
    pub fn interruptible(&self) -> bool {
        self.interruptible
    }

    /// Configuration warnings found while loading.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }
}

fn linearize(
    name: &str,
    config: &PipelineConfig,
    memo: &mut HashMap<String, Vec<String>>,
    stack: &mut Vec<String>,
) -> Result<Vec<String>> {
    if let Some(chain) = memo.get(name) {
        return Ok(chain.clone());
    }
    if let Some(pos) = stack.iter().position(|n| n == name) {
        let mut cycle: Vec<&str> = stack[pos..].iter().map(String::as_str).collect();
        cycle.push(name);
        return Err(Error::Config(format!(
            "Cyclic extends: {}",
            cycle.join(" -> ")
        )));
    }

    let definition = config
        .jobs
        .get(name)
        .ok_or_else(|| Error::Config(format!("Unknown template '{}'", name)))?;

    stack.push(name.to_string());
    let mut chain: Vec<String> = Vec::new();
    for parent in definition.extends.iter().flat_map(|e| e.to_vec()) {
        for ancestor in linearize(&parent, config, memo, stack)? {
            if !chain.contains(&ancestor) {
                chain.push(ancestor);
            }
        }
    }
    stack.pop();

    chain.push(name.to_string());
    memo.insert(name.to_string(), chain.clone());
    Ok(chain)
}

/// Copy every field a layer sets over the accumulated definition.
macro_rules! overlay {
    ($acc:expr, $layer:expr, $($field:ident),+ $(,)?) => {
        $(
            if $layer.$field.is_some() {
                $acc.$field = $layer.$field.clone();
            }
        )+
    };
}

fn merge(name: &str, chain: &[String], config: &PipelineConfig) -> Result<JobTemplate> {
    let defaults = &config.default;
    let mut acc = JobDefinition {
        before_script: defaults.before_script.clone(),
        after_script: defaults.after_script.clone(),
        tags: defaults.tags.clone(),
        timeout: defaults.timeout.clone(),
        interruptible: defaults.interruptible,
        retry: defaults.retry.clone(),
        ..JobDefinition::default()
    };
    let mut variable_layers = Vec::with_capacity(chain.len());

    for layer_name in chain {
        let layer = config
            .jobs
            .get(layer_name)
            .ok_or_else(|| Error::Config(format!("Unknown template '{}'", layer_name)))?;
        overlay!(
            acc,
            layer,
            stage,
            rules,
            before_script,
            script,
            after_script,
            artifacts,
            needs,
            tags,
            timeout,
            interruptible,
            allow_failure,
            when,
            parallel,
            retry,
        );
        variable_layers.push(
            layer
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.render()))
                .collect(),
        );
    }

    let hidden = name.starts_with('.');
    let script = acc.script.as_ref().map(|s| s.to_vec()).unwrap_or_default();
    if !hidden && script.is_empty() {
        return Err(Error::Config(format!("Job '{}' has no script", name)));
    }

    let rules = acc
        .rules
        .as_ref()
        .map(|rules| rules.iter().map(Rule::compile).collect::<Result<Vec<_>>>())
        .transpose()?;

    let timeout = acc.timeout.as_deref().map(parse_timeout).transpose()?;

    Ok(JobTemplate {
        name: TemplateName::new(name),
        hidden,
        ancestors: chain[..chain.len() - 1]
            .iter()
            .map(|n| TemplateName::new(n.as_str()))
            .collect(),
        variable_layers,
        rules,
        stage: acc.stage,
        before_script: acc.before_script.map(|s| s.to_vec()).unwrap_or_default(),
        script,
        after_script: acc.after_script.map(|s| s.to_vec()).unwrap_or_default(),
        artifacts: acc.artifacts.unwrap_or_default(),
        needs: acc.needs,
        tags: acc.tags.unwrap_or_default().into_iter().collect(),
        timeout,
        interruptible: acc.interruptible.unwrap_or(true),
        allow_failure: acc.allow_failure.unwrap_or(false),
        when: acc.when.unwrap_or_default(),
        parallel: acc.parallel,
        retry: acc
            .retry
            .as_ref()
            .map(RetryPolicy::from_config)
            .unwrap_or_default(),
    })
}
