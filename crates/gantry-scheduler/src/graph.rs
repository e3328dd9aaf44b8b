//! Dependency graph of job instances.

use crate::matrix::MatrixCell;
use crate::templates::JobTemplate;
use crate::variables::VariableSet;
use gantry_core::ids::InstanceKey;
use gantry_core::pipeline::{NeedConfig, WhenPolicy};
use gantry_core::{Error, Result};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use serde::Serialize;
use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// One schedulable expansion of a template.
#[derive(Debug, Clone)]
pub struct JobInstance {
    pub key: InstanceKey,
    pub template: Arc<JobTemplate>,
    pub cell: MatrixCell,
    pub variables: VariableSet,
    /// `when` chosen by the matching rule (or the template's own).
    pub when: WhenPolicy,
    pub allow_failure: bool,
}

impl JobInstance {
    pub fn name(&self) -> &str {
        self.template.name.as_str()
    }

    pub fn stage(&self) -> Option<&str> {
        self.template.stage.as_deref()
    }

    pub fn tags(&self) -> &BTreeSet<String> {
        &self.template.tags
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeKind {
    /// Declared with `needs`.
    Needs,
    /// Implied by stage ordering.
    Stage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dependency {
    pub kind: EdgeKind,
    /// Whether the dependent receives the upstream's artifacts.
    pub artifacts: bool,
}

/// Directed acyclic graph of job instances. Edges point from upstream to dependent.
#[derive(Debug)]
pub struct PipelineGraph {
    graph: DiGraph<JobInstance, Dependency>,
    key_to_index: HashMap<InstanceKey, NodeIndex>,
    downstream: HashMap<NodeIndex, usize>,
}

impl PipelineGraph {
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn index_of(&self, key: &str) -> Option<NodeIndex> {
        self.key_to_index.get(key).copied()
    }

    pub fn instance(&self, idx: NodeIndex) -> &JobInstance {
        &self.graph[idx]
    }

    pub fn get(&self, key: &str) -> Option<&JobInstance> {
        self.index_of(key).map(|idx| &self.graph[idx])
    }

    /// Node indices in planning order.
    pub fn indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn instances(&self) -> impl Iterator<Item = &JobInstance> {
        self.graph.node_indices().map(move |idx| &self.graph[idx])
    }

    /// Direct upstream instances with the edge that connects them.
    pub fn predecessors(&self, idx: NodeIndex) -> Vec<(NodeIndex, Dependency)> {
        self.graph
            .edges_directed(idx, Direction::Incoming)
            .map(|e| (e.source(), *e.weight()))
            .collect()
    }

    /// Direct dependents.
    pub fn successors(&self, idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(idx, Direction::Outgoing)
            .collect()
    }

    /// Instances with no upstream.
    pub fn roots(&self) -> Vec<&JobInstance> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|idx| &self.graph[idx])
            .collect()
    }

    /// Number of instances transitively depending on `idx`.
    pub fn downstream_count(&self, idx: NodeIndex) -> usize {
        self.downstream.get(&idx).copied().unwrap_or(0)
    }

    /// Topological order, ties broken by instance key.
    pub fn topological_order(&self) -> Vec<&JobInstance> {
        let mut in_degree: HashMap<NodeIndex, usize> = self
            .graph
            .node_indices()
            .map(|idx| {
                (
                    idx,
                    self.graph
                        .neighbors_directed(idx, Direction::Incoming)
                        .count(),
                )
            })
            .collect();

        let mut ready: BinaryHeap<Reverse<(&InstanceKey, NodeIndex)>> = in_degree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(&idx, _)| Reverse((&self.graph[idx].key, idx)))
            .collect();

        let mut order = Vec::with_capacity(self.len());
        while let Some(Reverse((_, idx))) = ready.pop() {
            order.push(&self.graph[idx]);
            for next in self.graph.neighbors_directed(idx, Direction::Outgoing) {
                if let Some(deg) = in_degree.get_mut(&next) {
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(Reverse((&self.graph[next].key, next)));
                    }
                }
            }
        }
        order
    }

    /// All edges as `(upstream, dependent, kind)`, sorted.
    pub fn edges(&self) -> Vec<(&InstanceKey, &InstanceKey, EdgeKind)> {
        let mut edges: Vec<_> = self
            .graph
            .edge_references()
            .map(|e| {
                (
                    &self.graph[e.source()].key,
                    &self.graph[e.target()].key,
                    e.weight().kind,
                )
            })
            .collect();
        edges.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));
        edges
    }
}

/// Builder for constructing the instance graph.
pub struct GraphBuilder<'a> {
    stages: &'a [String],
}

impl<'a> GraphBuilder<'a> {
    /// `stages` is the declared stage order; empty disables stage gating.
    pub fn new(stages: &'a [String]) -> Self {
        Self { stages }
    }

    /// Connect instances by `needs` and stage order, then reject cycles.
    ///
    /// Returns the graph and warnings for dropped optional needs.
    pub fn build(&self, instances: Vec<JobInstance>) -> Result<(PipelineGraph, Vec<String>)> {
        let mut graph: DiGraph<JobInstance, Dependency> = DiGraph::new();
        let mut key_to_index = HashMap::new();
        let mut by_template: HashMap<String, Vec<NodeIndex>> = HashMap::new();
        let mut warnings = Vec::new();

        for instance in instances {
            let key = instance.key.clone();
            let template = instance.name().to_string();
            let idx = graph.add_node(instance);
            if key_to_index.insert(key.clone(), idx).is_some() {
                return Err(Error::Config(format!("Duplicate job instance '{}'", key)));
            }
            by_template.entry(template).or_default().push(idx);
        }

        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        for &idx in &nodes {
            let dependent = graph[idx].clone();
            match &dependent.template.needs {
                Some(needs) => {
                    for need in needs {
                        let upstream = self.resolve_need(&dependent, need, &graph, &by_template)?;
                        if upstream.is_empty() {
                            let message = format!(
                                "Job '{}' needs '{}', which is not part of this pipeline; dependency dropped",
                                dependent.key,
                                need.job()
                            );
                            warn!(job = %dependent.key, need = need.job(), "Dropping dependency on excluded job");
                            warnings.push(message);
                            continue;
                        }
                        let artifacts = match need {
                            NeedConfig::Job(_) => true,
                            NeedConfig::Detailed { artifacts, .. } => *artifacts,
                        };
                        for up in upstream {
                            graph.update_edge(
                                up,
                                idx,
                                Dependency {
                                    kind: EdgeKind::Needs,
                                    artifacts,
                                },
                            );
                        }
                    }
                }
                None => {
                    let Some(own) = dependent.stage().and_then(|s| self.stage_index(s)) else {
                        continue;
                    };
                    for &other in &nodes {
                        let earlier = graph[other]
                            .stage()
                            .and_then(|s| self.stage_index(s))
                            .is_some_and(|i| i < own);
                        if earlier {
                            graph.update_edge(
                                other,
                                idx,
                                Dependency {
                                    kind: EdgeKind::Stage,
                                    artifacts: true,
                                },
                            );
                        }
                    }
                }
            }
        }

        if let Some(chain) = find_cycle(&graph) {
            return Err(Error::Cycle { chain });
        }

        let downstream = downstream_counts(&graph)?;
        debug!(
            instances = graph.node_count(),
            edges = graph.edge_count(),
            "Dependency graph built"
        );

        Ok((
            PipelineGraph {
                graph,
                key_to_index,
                downstream,
            },
            warnings,
        ))
    }

    fn stage_index(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    fn resolve_need(
        &self,
        dependent: &JobInstance,
        need: &NeedConfig,
        graph: &DiGraph<JobInstance, Dependency>,
        by_template: &HashMap<String, Vec<NodeIndex>>,
    ) -> Result<Vec<NodeIndex>> {
        let candidates = by_template.get(need.job()).cloned().unwrap_or_default();

        let (selected, optional) = match need {
            NeedConfig::Job(_) => (candidates, true),
            NeedConfig::Detailed {
                matrix, optional, ..
            } => {
                let selected = if matrix.is_empty() {
                    candidates
                } else {
                    candidates
                        .into_iter()
                        .filter(|&idx| {
                            let values = &graph[idx].cell.values;
                            matrix.iter().any(|pin| {
                                pin.iter().all(|(axis, value)| {
                                    values.get(axis).is_some_and(|v| *v == value.to_string())
                                })
                            })
                        })
                        .collect()
                };
                (selected, *optional)
            }
        };

        if selected.is_empty() && !optional {
            return Err(Error::Config(format!(
                "Job '{}' requires '{}', which is not part of this pipeline",
                dependent.key,
                need.job()
            )));
        }
        Ok(selected)
    }
}

/// Depth-first search with an explicit recursion stack. Returns the cycle
/// members, first node repeated at the end.
fn find_cycle(graph: &DiGraph<JobInstance, Dependency>) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        OnStack,
        Done,
    }

    fn visit(
        graph: &DiGraph<JobInstance, Dependency>,
        idx: NodeIndex,
        marks: &mut HashMap<NodeIndex, Mark>,
        stack: &mut Vec<NodeIndex>,
    ) -> Option<Vec<String>> {
        marks.insert(idx, Mark::OnStack);
        stack.push(idx);

        let mut next: Vec<NodeIndex> = graph.neighbors_directed(idx, Direction::Outgoing).collect();
        next.sort_by(|a, b| graph[*a].key.cmp(&graph[*b].key));

        for succ in next {
            match marks.get(&succ).copied().unwrap_or(Mark::Unvisited) {
                Mark::OnStack => {
                    let start = stack.iter().position(|&n| n == succ).unwrap_or(0);
                    let mut chain: Vec<String> =
                        stack[start..].iter().map(|&n| graph[n].key.to_string()).collect();
                    chain.push(graph[succ].key.to_string());
                    return Some(chain);
                }
                Mark::Unvisited => {
                    if let Some(chain) = visit(graph, succ, marks, stack) {
                        return Some(chain);
                    }
                }
                Mark::Done => {}
            }
        }

        stack.pop();
        marks.insert(idx, Mark::Done);
        None
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    for idx in graph.node_indices() {
        if marks.get(&idx).copied().unwrap_or(Mark::Unvisited) == Mark::Unvisited
            && let Some(chain) = visit(graph, idx, &mut marks, &mut stack)
        {
            return Some(chain);
        }
    }
    None
}

fn downstream_counts(
    graph: &DiGraph<JobInstance, Dependency>,
) -> Result<HashMap<NodeIndex, usize>> {
    let order = toposort(graph, None)
        .map_err(|_| Error::Internal("cycle survived validation".to_string()))?;

    let mut descendants: HashMap<NodeIndex, HashSet<NodeIndex>> = HashMap::new();
    for &idx in order.iter().rev() {
        let mut set = HashSet::new();
        for succ in graph.neighbors_directed(idx, Direction::Outgoing) {
            set.insert(succ);
            if let Some(below) = descendants.get(&succ) {
                set.extend(below.iter().copied());
            }
        }
        descendants.insert(idx, set);
    }

    Ok(descendants
        .into_iter()
        .map(|(idx, set)| (idx, set.len()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Planner;
    use crate::templates::TemplateCatalog;
    use gantry_core::pipeline::PipelineConfig;
    use gantry_core::trigger::{EventSource, TriggerContext};
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn plan(yaml: &str) -> Result<(PipelineGraph, Vec<String>)> {
        let catalog = TemplateCatalog::load(&PipelineConfig::from_yaml(yaml)?)?;
        let ctx = TriggerContext::new(EventSource::Push, "main");
        let plan = Planner::new(&catalog).plan(&ctx)?;
        Ok((plan.graph, plan.warnings))
    }

    fn keys(order: Vec<&JobInstance>) -> Vec<String> {
        order.into_iter().map(|i| i.key.to_string()).collect()
    }

    #[test]
    fn test_needs_fan_out_to_all_cells() {
        let (graph, _) = plan(
            r#"
jobs:
  build:
    script: make
    parallel:
      matrix:
        - X: ["1", "2"]
  test:
    script: make test
    needs: [build]
"#,
        )
        .unwrap();

        let test = graph.index_of("test").unwrap();
        assert_eq!(graph.predecessors(test).len(), 2);
        assert_eq!(graph.downstream_count(graph.index_of("build[X=1]").unwrap()), 1);
        assert_eq!(graph.roots().len(), 2);
    }

    #[test]
    fn test_pinned_matrix_need() {
        let (graph, _) = plan(
            r#"
jobs:
  build:
    script: make
    parallel:
      matrix:
        - X: ["1", "2"]
  test:
    script: make test
    needs:
      - job: build
        matrix:
          - X: "1"
"#,
        )
        .unwrap();

        let test = graph.index_of("test").unwrap();
        let preds = graph.predecessors(test);
        assert_eq!(preds.len(), 1);
        assert_eq!(graph.instance(preds[0].0).key.as_str(), "build[X=1]");
    }

    #[test]
    fn test_cycle_is_rejected_with_chain() {
        let err = plan(
            r#"
jobs:
  a:
    script: a
    needs: [b]
  b:
    script: b
    needs: [a]
"#,
        )
        .unwrap_err();

        match err {
            Error::Cycle { chain } => assert_eq!(chain, vec!["a", "b", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_stage_gating_adds_implicit_edges() {
        let (graph, _) = plan(
            r#"
stages: [build, test, deploy]
jobs:
  compile:
    stage: build
    script: make
  unit:
    stage: test
    script: make test
  lint:
    stage: test
    script: make lint
    needs: []
  ship:
    stage: deploy
    script: ./ship.sh
"#,
        )
        .unwrap();

        let edges: Vec<(String, String, EdgeKind)> = graph
            .edges()
            .into_iter()
            .map(|(a, b, k)| (a.to_string(), b.to_string(), k))
            .collect();
        assert_eq!(
            edges,
            vec![
                ("compile".into(), "ship".into(), EdgeKind::Stage),
                ("compile".into(), "unit".into(), EdgeKind::Stage),
                ("lint".into(), "ship".into(), EdgeKind::Stage),
                ("unit".into(), "ship".into(), EdgeKind::Stage),
            ]
        );
        assert_eq!(
            keys(graph.topological_order()),
            vec!["compile", "lint", "unit", "ship"]
        );
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let (graph, _) = plan(
            r#"
jobs:
  z_first:
    script: a
  a_second:
    script: b
    needs: [z_first]
  m_third:
    script: c
    needs: [a_second]
"#,
        )
        .unwrap();

        let order = keys(graph.topological_order());
        assert_eq!(order, vec!["z_first", "a_second", "m_third"]);
        let first = graph.index_of("z_first").unwrap();
        assert_eq!(graph.downstream_count(first), 2);
    }

    #[test]
    fn test_required_need_missing_is_config_error() {
        let err = plan(
            r#"
jobs:
  docs:
    script: make docs
    rules:
      - if: { event: [schedule] }
  publish:
    script: ./publish.sh
    needs:
      - job: docs
        optional: false
"#,
        )
        .unwrap_err();
        assert!(err.is_fatal());
    }

    /// Random DAG: every job needs a subset of the jobs declared before it.
    fn random_needs(rng: &mut StdRng, size: usize) -> Vec<Vec<usize>> {
        (0..size)
            .map(|job| (0..job).filter(|_| rng.gen_bool(0.3)).collect())
            .collect()
    }

    fn render(needs: &[Vec<usize>]) -> String {
        let mut yaml = String::from("jobs:\n");
        for (job, upstream) in needs.iter().enumerate() {
            let names: Vec<String> = upstream.iter().map(|n| format!("j{:02}", n)).collect();
            yaml.push_str(&format!(
                "  j{:02}:\n    script: run\n    needs: [{}]\n",
                job,
                names.join(", ")
            ));
        }
        yaml
    }

    #[test]
    fn test_generated_dags_order_and_downstream_counts() {
        let mut rng = StdRng::seed_from_u64(0x6a6e7472);
        for _ in 0..50 {
            let size = rng.gen_range(1..16);
            let needs = random_needs(&mut rng, size);
            let (graph, _) = plan(&render(&needs)).unwrap();

            let order = keys(graph.topological_order());
            assert_eq!(order.len(), size);
            let position: HashMap<String, usize> =
                order.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();
            for (job, upstream) in needs.iter().enumerate() {
                let to = format!("j{:02}", job);
                for from in upstream.iter().map(|n| format!("j{:02}", n)) {
                    assert!(position[&from] < position[&to], "{} must precede {}", from, to);
                }
            }

            for job in 0..size {
                let mut reached = HashSet::new();
                let mut stack = vec![job];
                while let Some(current) = stack.pop() {
                    for (next, upstream) in needs.iter().enumerate() {
                        if upstream.contains(&current) && reached.insert(next) {
                            stack.push(next);
                        }
                    }
                }
                let idx = graph.index_of(&format!("j{:02}", job)).unwrap();
                assert_eq!(graph.downstream_count(idx), reached.len());
            }
        }
    }

    #[test]
    fn test_generated_back_edge_is_a_cycle() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut checked = 0;
        while checked < 20 {
            let size = rng.gen_range(2..12);
            let mut needs = random_needs(&mut rng, size);
            let edges: Vec<(usize, usize)> = needs
                .iter()
                .enumerate()
                .flat_map(|(job, upstream)| upstream.iter().map(move |&from| (from, job)))
                .collect();
            if edges.is_empty() {
                continue;
            }
            let (from, to) = edges[rng.gen_range(0..edges.len())];
            needs[from].push(to);

            let result = plan(&render(&needs));
            assert!(matches!(result, Err(Error::Cycle { .. })), "{:?}", needs);
            checked += 1;
        }
    }
}
