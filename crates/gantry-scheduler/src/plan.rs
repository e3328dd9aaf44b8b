//! Planning: rules, expansion, variable resolution and graph building for one trigger.

use crate::graph::{EdgeKind, GraphBuilder, JobInstance, PipelineGraph};
use crate::matrix::JobExpander;
use crate::rules::{ExclusionReason, RuleEvaluator, RuleOutcome};
use crate::templates::TemplateCatalog;
use crate::variables::{VariableResolver, VariableSet};
use gantry_core::Result;
use gantry_core::ids::{InstanceKey, TemplateName};
use gantry_core::pipeline::WhenPolicy;
use gantry_core::trigger::TriggerContext;
use serde::Serialize;
use tracing::{debug, info};

/// The filtered, expanded and resolved pipeline for one trigger.
#[derive(Debug)]
pub struct PipelinePlan {
    pub graph: PipelineGraph,
    /// Configuration and evaluation warnings; none of them block the run.
    pub warnings: Vec<String>,
    pub excluded: Vec<(TemplateName, ExclusionReason)>,
    /// Pipeline-level `workflow.interruptible`.
    pub interruptible: bool,
}

pub struct Planner<'a> {
    catalog: &'a TemplateCatalog,
    evaluator: RuleEvaluator,
    expander: JobExpander,
}

impl<'a> Planner<'a> {
    pub fn new(catalog: &'a TemplateCatalog) -> Self {
        Self {
            catalog,
            evaluator: RuleEvaluator::new(),
            expander: JobExpander::new(),
        }
    }

    pub fn plan(&self, ctx: &TriggerContext) -> Result<PipelinePlan> {
        let resolver = VariableResolver::new(ctx, self.catalog.globals());
        let mut warnings: Vec<String> = self.catalog.warnings().to_vec();
        let mut excluded = Vec::new();
        let mut instances = Vec::new();
        let mut rule_errors = Vec::new();

        for template in self.catalog.visible() {
            let outcome = self
                .evaluator
                .evaluate_collecting(template, ctx, &mut rule_errors);

            let (when, rule_vars, allow_failure) = match outcome {
                RuleOutcome::Included {
                    when,
                    variables,
                    allow_failure,
                    ..
                } => (when, variables, allow_failure),
                RuleOutcome::Excluded { reason } => {
                    debug!(job = %template.name, reason = ?reason, "Job excluded");
                    excluded.push((template.name.clone(), reason));
                    continue;
                }
            };

            for cell in self.expander.expand(template)? {
                let variables = resolver.resolve(template, &cell, &rule_vars);
                instances.push(JobInstance {
                    key: cell.key.clone(),
                    template: template.clone(),
                    cell,
                    variables,
                    when,
                    allow_failure,
                });
            }
        }

        warnings.extend(rule_errors.iter().map(ToString::to_string));

        let (graph, graph_warnings) = GraphBuilder::new(self.catalog.stages()).build(instances)?;
        warnings.extend(graph_warnings);

        info!(
            source = %ctx.source,
            ref_name = %ctx.ref_name,
            instances = graph.len(),
            excluded = excluded.len(),
            "Pipeline planned"
        );

        Ok(PipelinePlan {
            graph,
            warnings,
            excluded,
            interruptible: self.catalog.interruptible(),
        })
    }
}

/// Serializable view of a plan for display.
#[derive(Debug, Clone, Serialize)]
pub struct PlanSummary {
    pub jobs: Vec<PlannedJob>,
    pub excluded: Vec<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlannedJob {
    pub key: InstanceKey,
    pub stage: Option<String>,
    pub when: WhenPolicy,
    pub allow_failure: bool,
    pub needs: Vec<InstanceKey>,
    pub stage_after: Vec<InstanceKey>,
    pub downstream: usize,
    pub variables: VariableSet,
}

impl PipelinePlan {
    /// Jobs in topological order with their resolved inputs.
    pub fn summary(&self) -> PlanSummary {
        let edges = self.graph.edges();
        let jobs = self
            .graph
            .topological_order()
            .into_iter()
            .map(|instance| {
                let upstream = |kind: EdgeKind| {
                    edges
                        .iter()
                        .filter(|(_, to, k)| **to == instance.key && *k == kind)
                        .map(|(from, _, _)| (*from).clone())
                        .collect::<Vec<_>>()
                };
                let downstream = self
                    .graph
                    .index_of(instance.key.as_str())
                    .map(|idx| self.graph.downstream_count(idx))
                    .unwrap_or(0);
                PlannedJob {
                    key: instance.key.clone(),
                    stage: instance.template.stage.clone(),
                    when: instance.when,
                    allow_failure: instance.allow_failure,
                    needs: upstream(EdgeKind::Needs),
                    stage_after: upstream(EdgeKind::Stage),
                    downstream,
                    variables: instance.variables.clone(),
                }
            })
            .collect();

        PlanSummary {
            jobs,
            excluded: self.excluded.iter().map(|(name, _)| name.to_string()).collect(),
            warnings: self.warnings.clone(),
        }
    }
}
