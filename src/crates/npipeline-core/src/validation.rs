//! Graph validation - structural, type, cycle, and reachability rules
//!
//! Validation runs at build time, before any node instance exists. Rules
//! are evaluated in a fixed order and produce a [`ValidationResult`]:
//!
//! 1. **Structure** - at least one node and one sink; sources have no
//!    inbound edges; every non-source has at least one; no isolated nodes.
//! 2. **Edges** - no self-loops, no duplicates, both endpoints exist.
//! 3. **Types** - for every edge `(u, v)`, the output type of `u` must be
//!    identical to the input type of `v` (`TypeId` equality; Rust has no
//!    element-type covariance, and open generics only match on identical
//!    concrete instantiations).
//! 4. **Cycles** - depth-first search with grey/black coloring; each cycle
//!    is reported once with its canonical path (lexicographically smallest
//!    rotation).
//! 5. **Reachability** - every node must lie on some source-to-sink path.
//! 6. **Naming** - ids unique case-insensitively (the builder enforces
//!    this; validation double-checks graphs built by other means).
//! 7. **Configuration** - strategies, retry options, and lineage
//!    cardinality must be coherent; `ManyToMany` lineage requires a
//!    custom mapper.
//!
//! The builder's [`ValidationMode`](crate::validation::ValidationMode)
//! decides what happens with the result: `Strict` (default) fails the
//! build on the first error, `Warn` logs and builds anyway, `Off` skips
//! validation entirely.

use crate::graph::{NodeKind, PipelineGraph};
use crate::lineage::LineageCardinality;
use crate::merge::MergeType;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// How validation findings are enforced at build time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    /// Fail the build on the first error (default)
    Strict,
    /// Log findings and build anyway
    Warn,
    /// Skip validation entirely
    Off,
}

impl Default for ValidationMode {
    fn default() -> Self {
        Self::Strict
    }
}

/// Severity of a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Which rule produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValidationCategory {
    Structure,
    Edge,
    Type,
    Cycle,
    Reachability,
    Naming,
    Lineage,
    Configuration,
}

/// One validation finding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub severity: Severity,
    pub category: ValidationCategory,
    pub message: String,
    /// Node the finding is about, when node-scoped
    pub node_id: Option<String>,
    /// Edge the finding is about, when edge-scoped
    pub edge: Option<(String, String)>,
}

impl ValidationIssue {
    fn error(category: ValidationCategory, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            category,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    fn warning(category: ValidationCategory, message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            category,
            message: message.into(),
            node_id: None,
            edge: None,
        }
    }

    fn on_node(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = Some(node_id.into());
        self
    }

    fn on_edge(mut self, from: impl Into<String>, to: impl Into<String>) -> Self {
        self.edge = Some((from.into(), to.into()));
        self
    }
}

/// All findings for one graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub issues: Vec<ValidationIssue>,
}

impl ValidationResult {
    /// Findings with error severity
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .collect()
    }

    /// Findings with warning severity
    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .collect()
    }

    /// Whether the graph passed without errors
    pub fn is_ok(&self) -> bool {
        self.errors().is_empty()
    }
}

/// Run every rule against a graph
pub fn validate_graph(graph: &PipelineGraph) -> ValidationResult {
    let mut issues = Vec::new();

    check_structure(graph, &mut issues);
    check_edges(graph, &mut issues);
    check_types(graph, &mut issues);
    check_cycles(graph, &mut issues);
    check_reachability(graph, &mut issues);
    check_naming(graph, &mut issues);
    check_configuration(graph, &mut issues);

    ValidationResult { issues }
}

fn check_structure(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    if graph.is_empty() {
        issues.push(ValidationIssue::error(
            ValidationCategory::Structure,
            "pipeline has no nodes",
        ));
        return;
    }
    if graph.sinks().is_empty() {
        issues.push(ValidationIssue::error(
            ValidationCategory::Structure,
            "pipeline has no sink; every pipeline must end somewhere",
        ));
    }

    for node in graph.nodes() {
        let inbound = graph.inbound(&node.id).len();
        let outbound = graph.out_degree(&node.id);

        match node.kind {
            NodeKind::Source => {
                if inbound > 0 {
                    issues.push(
                        ValidationIssue::error(
                            ValidationCategory::Structure,
                            format!("source '{}' must not have inbound edges", node.id),
                        )
                        .on_node(&node.id),
                    );
                }
            }
            _ => {
                if inbound == 0 {
                    issues.push(
                        ValidationIssue::error(
                            ValidationCategory::Structure,
                            format!(
                                "{} '{}' has no inbound edges",
                                node.kind, node.id
                            ),
                        )
                        .on_node(&node.id),
                    );
                }
            }
        }

        if inbound == 0 && outbound == 0 {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Structure,
                    format!("node '{}' is isolated", node.id),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn check_edges(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    let mut seen: HashSet<(String, String)> = HashSet::new();

    for edge in graph.edges() {
        if edge.from.eq_ignore_ascii_case(&edge.to) {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Edge,
                    format!("self-loop on '{}'", edge.from),
                )
                .on_edge(&edge.from, &edge.to),
            );
        }
        if !seen.insert((edge.from.to_lowercase(), edge.to.to_lowercase())) {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Edge,
                    format!("duplicate edge {}", edge),
                )
                .on_edge(&edge.from, &edge.to),
            );
        }
        for endpoint in [&edge.from, &edge.to] {
            if graph.node(endpoint).is_none() {
                issues.push(
                    ValidationIssue::error(
                        ValidationCategory::Edge,
                        format!("edge {} references unknown node '{}'", edge, endpoint),
                    )
                    .on_edge(&edge.from, &edge.to),
                );
            }
        }
    }
}

fn check_types(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    for edge in graph.edges() {
        let (Some(from), Some(to)) = (graph.node(&edge.from), graph.node(&edge.to)) else {
            continue;
        };
        let (Some(output), Some(input)) = (from.output_type, to.input_type) else {
            continue;
        };
        if output.id != input.id {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Type,
                    format!(
                        "edge {}: output type {} is not assignable to input type {}",
                        edge, output.name, input.name
                    ),
                )
                .on_edge(&edge.from, &edge.to),
            );
        }
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Grey,
    Black,
}

fn check_cycles(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    let ids: Vec<String> = graph.nodes().iter().map(|n| n.id.clone()).collect();
    let index: HashMap<String, usize> = ids
        .iter()
        .enumerate()
        .map(|(i, id)| (id.to_lowercase(), i))
        .collect();

    let successors: Vec<Vec<usize>> = ids
        .iter()
        .map(|id| {
            graph
                .outbound(id)
                .iter()
                .filter_map(|e| index.get(&e.to.to_lowercase()).copied())
                .collect()
        })
        .collect();

    let mut colors = vec![Color::White; ids.len()];
    let mut stack: Vec<usize> = Vec::new();
    let mut reported: HashSet<String> = HashSet::new();

    fn visit(
        node: usize,
        ids: &[String],
        successors: &[Vec<usize>],
        colors: &mut [Color],
        stack: &mut Vec<usize>,
        reported: &mut HashSet<String>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        colors[node] = Color::Grey;
        stack.push(node);

        for &next in &successors[node] {
            match colors[next] {
                Color::White => {
                    visit(next, ids, successors, colors, stack, reported, issues)
                }
                Color::Grey => {
                    let start = stack
                        .iter()
                        .position(|&n| n == next)
                        .unwrap_or(stack.len() - 1);
                    let cycle: Vec<&str> =
                        stack[start..].iter().map(|&n| ids[n].as_str()).collect();
                    let path = canonical_cycle(&cycle);
                    if reported.insert(path.clone()) {
                        issues.push(ValidationIssue::error(
                            ValidationCategory::Cycle,
                            format!("Cycle detected: {}", path),
                        ));
                    }
                }
                Color::Black => {}
            }
        }

        stack.pop();
        colors[node] = Color::Black;
    }

    for node in 0..ids.len() {
        if colors[node] == Color::White {
            visit(
                node,
                &ids,
                &successors,
                &mut colors,
                &mut stack,
                &mut reported,
                issues,
            );
        }
    }
}

/// Lexicographically smallest rotation, closed by repeating the first node
fn canonical_cycle(cycle: &[&str]) -> String {
    if cycle.is_empty() {
        return String::new();
    }
    let smallest = (0..cycle.len())
        .min_by_key(|&i| {
            (0..cycle.len())
                .map(|k| cycle[(i + k) % cycle.len()])
                .collect::<Vec<_>>()
        })
        .unwrap_or(0);

    let mut path: Vec<&str> = (0..cycle.len())
        .map(|k| cycle[(smallest + k) % cycle.len()])
        .collect();
    path.push(cycle[smallest]);
    path.join(" -> ")
}

fn check_reachability(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    let forward = flood(graph, true);
    let backward = flood(graph, false);

    for node in graph.nodes() {
        let key = node.id.to_lowercase();
        let from_source =
            node.kind == NodeKind::Source || forward.contains(&key);
        let to_sink = node.kind == NodeKind::Sink || backward.contains(&key);
        if !from_source || !to_sink {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Reachability,
                    format!(
                        "node '{}' is unreachable: it lies on no source-to-sink path",
                        node.id
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

/// Nodes reachable from sources (forward) or reaching sinks (backward)
fn flood(graph: &PipelineGraph, forward: bool) -> HashSet<String> {
    let mut reached: HashSet<String> = if forward {
        graph.sources().iter().map(|n| n.id.to_lowercase()).collect()
    } else {
        graph.sinks().iter().map(|n| n.id.to_lowercase()).collect()
    };

    let mut frontier: Vec<String> = reached.iter().cloned().collect();
    while let Some(id) = frontier.pop() {
        let next_ids: Vec<String> = if forward {
            graph.outbound(&id).iter().map(|e| e.to.to_lowercase()).collect()
        } else {
            graph.inbound(&id).iter().map(|e| e.from.to_lowercase()).collect()
        };
        for next in next_ids {
            if reached.insert(next.clone()) {
                frontier.push(next);
            }
        }
    }
    reached
}

fn check_naming(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    let mut seen: HashMap<String, &str> = HashMap::new();
    for node in graph.nodes() {
        if let Some(previous) = seen.insert(node.id.to_lowercase(), &node.id) {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Naming,
                    format!(
                        "node id '{}' collides case-insensitively with '{}'",
                        node.id, previous
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

fn check_configuration(graph: &PipelineGraph, issues: &mut Vec<ValidationIssue>) {
    for node in graph.nodes() {
        if let Err(e) = node.strategy.validate() {
            issues.push(
                ValidationIssue::error(ValidationCategory::Configuration, e.to_string())
                    .on_node(&node.id),
            );
        }
        if let Some(retry) = &node.retry {
            if let Err(e) = retry.validate() {
                issues.push(
                    ValidationIssue::error(ValidationCategory::Configuration, e.to_string())
                        .on_node(&node.id),
                );
            }
        }

        if node.cardinality == LineageCardinality::ManyToMany && !node.has_lineage_mapper {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Lineage,
                    format!(
                        "node '{}' declares many-to-many lineage without a custom mapper",
                        node.id
                    ),
                )
                .on_node(&node.id),
            );
        }

        if node.merge_type == MergeType::Custom && node.kind != NodeKind::CustomMerge {
            issues.push(
                ValidationIssue::error(
                    ValidationCategory::Configuration,
                    format!(
                        "node '{}' selects a custom merge but is a {} node",
                        node.id, node.kind
                    ),
                )
                .on_node(&node.id),
            );
        }

        if node.merge_type == MergeType::KeyedJoin && graph.inbound(&node.id).len() < 2 {
            issues.push(
                ValidationIssue::warning(
                    ValidationCategory::Configuration,
                    format!(
                        "node '{}' configures a keyed join with fewer than two inputs",
                        node.id
                    ),
                )
                .on_node(&node.id),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeDef, NodeDefinition, TypeSignature};
    use std::sync::Arc;

    fn node(id: &str, kind: NodeKind) -> Arc<NodeDefinition> {
        Arc::new(NodeDefinition::new(id, kind))
    }

    fn linear() -> PipelineGraph {
        PipelineGraph::new(
            vec![
                node("src", NodeKind::Source),
                node("mid", NodeKind::Transform),
                node("out", NodeKind::Sink),
            ],
            vec![EdgeDef::new("src", "mid"), EdgeDef::new("mid", "out")],
        )
    }

    #[test]
    fn test_valid_linear_graph_passes() {
        assert!(validate_graph(&linear()).is_ok());
    }

    #[test]
    fn test_empty_graph_fails() {
        let g = PipelineGraph::new(vec![], vec![]);
        let result = validate_graph(&g);
        assert!(!result.is_ok());
        assert_eq!(result.errors()[0].category, ValidationCategory::Structure);
    }

    #[test]
    fn test_missing_sink_fails() {
        let g = PipelineGraph::new(
            vec![node("src", NodeKind::Source), node("mid", NodeKind::Transform)],
            vec![EdgeDef::new("src", "mid")],
        );
        let result = validate_graph(&g);
        assert!(result
            .errors()
            .iter()
            .any(|i| i.message.contains("no sink")));
    }

    #[test]
    fn test_isolated_node_fails() {
        let g = PipelineGraph::new(
            vec![
                node("src", NodeKind::Source),
                node("out", NodeKind::Sink),
                node("island", NodeKind::Transform),
            ],
            vec![EdgeDef::new("src", "out")],
        );
        let result = validate_graph(&g);
        assert!(result
            .errors()
            .iter()
            .any(|i| i.message.contains("isolated")));
    }

    #[test]
    fn test_self_loop_and_duplicate_edges_fail() {
        let g = PipelineGraph::new(
            vec![node("src", NodeKind::Source), node("out", NodeKind::Sink)],
            vec![
                EdgeDef::new("src", "out"),
                EdgeDef::new("src", "out"),
                EdgeDef::new("out", "out"),
            ],
        );
        let result = validate_graph(&g);
        assert!(result.errors().iter().any(|i| i.message.contains("duplicate")));
        assert!(result.errors().iter().any(|i| i.message.contains("self-loop")));
    }

    #[test]
    fn test_unknown_endpoint_fails() {
        let g = PipelineGraph::new(
            vec![node("src", NodeKind::Source), node("out", NodeKind::Sink)],
            vec![EdgeDef::new("src", "out"), EdgeDef::new("src", "ghost")],
        );
        let result = validate_graph(&g);
        assert!(result
            .errors()
            .iter()
            .any(|i| i.message.contains("unknown node 'ghost'")));
    }

    #[test]
    fn test_type_mismatch_fails() {
        let g = PipelineGraph::new(
            vec![
                Arc::new(
                    NodeDefinition::new("src", NodeKind::Source)
                        .with_output_type(TypeSignature::of::<i64>()),
                ),
                Arc::new(
                    NodeDefinition::new("out", NodeKind::Sink)
                        .with_input_type(TypeSignature::of::<String>()),
                ),
            ],
            vec![EdgeDef::new("src", "out")],
        );
        let result = validate_graph(&g);
        let type_errors: Vec<_> = result
            .errors()
            .into_iter()
            .filter(|i| i.category == ValidationCategory::Type)
            .collect();
        assert_eq!(type_errors.len(), 1);
        assert!(type_errors[0].message.contains("not assignable"));
    }

    #[test]
    fn test_cycle_reports_canonical_path() {
        let g = PipelineGraph::new(
            vec![
                node("S", NodeKind::Source),
                node("T1", NodeKind::Transform),
                node("T2", NodeKind::Transform),
                node("out", NodeKind::Sink),
            ],
            vec![
                EdgeDef::new("S", "T1"),
                EdgeDef::new("T1", "T2"),
                EdgeDef::new("T2", "T1"),
                EdgeDef::new("T2", "out"),
            ],
        );
        let result = validate_graph(&g);
        let cycle = result
            .errors()
            .into_iter()
            .find(|i| i.category == ValidationCategory::Cycle)
            .cloned()
            .expect("cycle issue expected");
        assert!(cycle.message.contains("Cycle detected"));
        assert!(cycle.message.contains("T1 -> T2 -> T1"));
    }

    #[test]
    fn test_unreachable_branch_fails() {
        // "dangling" consumes from src but never reaches a sink.
        let g = PipelineGraph::new(
            vec![
                node("src", NodeKind::Source),
                node("dangling", NodeKind::Transform),
                node("out", NodeKind::Sink),
            ],
            vec![EdgeDef::new("src", "out"), EdgeDef::new("src", "dangling")],
        );
        let result = validate_graph(&g);
        assert!(result
            .errors()
            .iter()
            .any(|i| i.category == ValidationCategory::Reachability
                && i.node_id.as_deref() == Some("dangling")));
    }

    #[test]
    fn test_case_insensitive_name_collision_fails() {
        let g = PipelineGraph::new(
            vec![
                node("src", NodeKind::Source),
                node("SRC", NodeKind::Transform),
                node("out", NodeKind::Sink),
            ],
            vec![EdgeDef::new("src", "out"), EdgeDef::new("SRC", "out")],
        );
        let result = validate_graph(&g);
        assert!(result
            .errors()
            .iter()
            .any(|i| i.category == ValidationCategory::Naming));
    }

    #[test]
    fn test_many_to_many_requires_mapper() {
        let g = PipelineGraph::new(
            vec![
                node("src", NodeKind::Source),
                Arc::new(
                    NodeDefinition::new("reshape", NodeKind::Transform)
                        .with_cardinality(LineageCardinality::ManyToMany),
                ),
                node("out", NodeKind::Sink),
            ],
            vec![EdgeDef::new("src", "reshape"), EdgeDef::new("reshape", "out")],
        );
        let result = validate_graph(&g);
        assert!(result
            .errors()
            .iter()
            .any(|i| i.category == ValidationCategory::Lineage));

        let with_mapper = PipelineGraph::new(
            vec![
                node("src", NodeKind::Source),
                Arc::new(
                    NodeDefinition::new("reshape", NodeKind::Transform)
                        .with_cardinality(LineageCardinality::ManyToMany)
                        .with_lineage_mapper_flag(true),
                ),
                node("out", NodeKind::Sink),
            ],
            vec![EdgeDef::new("src", "reshape"), EdgeDef::new("reshape", "out")],
        );
        assert!(validate_graph(&with_mapper).is_ok());
    }
}
