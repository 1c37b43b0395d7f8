//! Graph model - immutable node definitions and edges
//!
//! The builder produces a [`PipelineGraph`]: a mapping of node id to
//! [`NodeDefinition`] plus an ordered edge list. Definitions are frozen at
//! build time; the runner binds them to instances per run.
//!
//! A definition carries everything the runtime needs to know about a node
//! without touching its concrete types: identity, type signatures for
//! validation, kind, execution strategy, resilience options, merge type,
//! and lineage cardinality. The typed half (factories, merge configs,
//! lineage mappers) lives in the execution plans the builder captures
//! alongside the graph.

use crate::breaker::CircuitBreakerOptions;
use crate::error::{PipelineError, Result};
use crate::lineage::LineageCardinality;
use crate::merge::MergeType;
use crate::retry::RetryOptions;
use crate::strategy::StrategyKind;
use npipeline_checkpoint::CheckpointStrategy;
use serde::{Deserialize, Serialize};
use std::any::TypeId;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Node identifier - unique within a graph, case-insensitively
pub type NodeId = String;

/// The four node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Source,
    Transform,
    Sink,
    CustomMerge,
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Source => write!(f, "source"),
            Self::Transform => write!(f, "transform"),
            Self::Sink => write!(f, "sink"),
            Self::CustomMerge => write!(f, "custom-merge"),
        }
    }
}

/// Runtime type signature of a pipe element, for edge compatibility checks
///
/// Compatibility is `TypeId` equality: Rust has no covariance over owned
/// element types, so "assignable" collapses to "identical".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeSignature {
    /// Runtime identity of the type
    pub id: TypeId,
    /// Human-readable name for diagnostics
    pub name: &'static str,
}

impl TypeSignature {
    /// The signature of `T`
    pub fn of<T: 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }
}

/// Immutable description of one node
#[derive(Debug, Clone)]
pub struct NodeDefinition {
    /// Unique id (case-insensitive) within the graph
    pub id: NodeId,
    /// Human-facing name; defaults to the id
    pub display_name: String,
    /// Capability kind
    pub kind: NodeKind,
    /// Element type consumed; `None` for sources
    pub input_type: Option<TypeSignature>,
    /// Element type produced; `None` for sinks
    pub output_type: Option<TypeSignature>,
    /// How the node is driven
    pub strategy: StrategyKind,
    /// Node-scoped retry options; falls back to the run defaults
    pub retry: Option<RetryOptions>,
    /// Node-scoped breaker options; falls back to the run defaults
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    /// Dead-letter failing items instead of failing the node
    pub continue_on_error: bool,
    /// How multiple inbound pipes combine; meaningful with >= 2 inbound
    /// edges
    pub merge_type: MergeType,
    /// Declared lineage cardinality
    pub cardinality: LineageCardinality,
    /// Whether a custom lineage mapper was registered
    pub has_lineage_mapper: bool,
    /// Declared checkpoint strategy; `Some` registers the node with the
    /// state registry
    pub stateful: Option<CheckpointStrategy>,
}

impl NodeDefinition {
    /// Definition with defaults: sequential, interleave, one-to-one
    pub fn new(id: impl Into<NodeId>, kind: NodeKind) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            kind,
            input_type: None,
            output_type: None,
            strategy: StrategyKind::Sequential,
            retry: None,
            circuit_breaker: None,
            continue_on_error: false,
            merge_type: MergeType::Interleave,
            cardinality: LineageCardinality::OneToOne,
            has_lineage_mapper: false,
            stateful: None,
        }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = name.into();
        self
    }

    pub fn with_input_type(mut self, signature: TypeSignature) -> Self {
        self.input_type = Some(signature);
        self
    }

    pub fn with_output_type(mut self, signature: TypeSignature) -> Self {
        self.output_type = Some(signature);
        self
    }

    pub fn with_strategy(mut self, strategy: StrategyKind) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_circuit_breaker(mut self, options: CircuitBreakerOptions) -> Self {
        self.circuit_breaker = Some(options);
        self
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    pub fn with_merge_type(mut self, merge_type: MergeType) -> Self {
        self.merge_type = merge_type;
        self
    }

    pub fn with_cardinality(mut self, cardinality: LineageCardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_lineage_mapper_flag(mut self, has_mapper: bool) -> Self {
        self.has_lineage_mapper = has_mapper;
        self
    }

    pub fn with_stateful(mut self, strategy: CheckpointStrategy) -> Self {
        self.stateful = Some(strategy);
        self
    }
}

/// Directed edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EdgeDef {
    pub from: NodeId,
    pub to: NodeId,
}

impl EdgeDef {
    pub fn new(from: impl Into<NodeId>, to: impl Into<NodeId>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }
}

impl std::fmt::Display for EdgeDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// Immutable graph: nodes in insertion order plus an ordered edge list
#[derive(Debug, Clone)]
pub struct PipelineGraph {
    nodes: Vec<Arc<NodeDefinition>>,
    index: HashMap<String, usize>,
    edges: Vec<EdgeDef>,
}

impl PipelineGraph {
    pub(crate) fn new(nodes: Vec<Arc<NodeDefinition>>, edges: Vec<EdgeDef>) -> Self {
        let index = nodes
            .iter()
            .enumerate()
            .map(|(i, n)| (n.id.to_lowercase(), i))
            .collect();
        Self {
            nodes,
            index,
            edges,
        }
    }

    /// Look up a node by id (case-insensitive)
    pub fn node(&self, id: &str) -> Option<&Arc<NodeDefinition>> {
        self.index
            .get(&id.to_lowercase())
            .map(|&i| &self.nodes[i])
    }

    /// All nodes in insertion order
    pub fn nodes(&self) -> &[Arc<NodeDefinition>] {
        &self.nodes
    }

    /// All edges in insertion order
    pub fn edges(&self) -> &[EdgeDef] {
        &self.edges
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Inbound edges of a node, in edge insertion order
    pub fn inbound(&self, id: &str) -> Vec<&EdgeDef> {
        self.edges
            .iter()
            .filter(|e| e.to.eq_ignore_ascii_case(id))
            .collect()
    }

    /// Outbound edges of a node, in edge insertion order
    pub fn outbound(&self, id: &str) -> Vec<&EdgeDef> {
        self.edges
            .iter()
            .filter(|e| e.from.eq_ignore_ascii_case(id))
            .collect()
    }

    /// Number of outbound edges of a node
    pub fn out_degree(&self, id: &str) -> usize {
        self.outbound(id).len()
    }

    /// All source nodes in insertion order
    pub fn sources(&self) -> Vec<&Arc<NodeDefinition>> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Source)
            .collect()
    }

    /// All sink nodes in insertion order
    pub fn sinks(&self) -> Vec<&Arc<NodeDefinition>> {
        self.nodes
            .iter()
            .filter(|n| n.kind == NodeKind::Sink)
            .collect()
    }

    /// Topological order of node ids; ties break by insertion order
    ///
    /// Validated graphs are acyclic, so this only fails for graphs built
    /// with validation off.
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut indegree = vec![0usize; self.nodes.len()];
        for edge in &self.edges {
            if let Some(&to) = self.index.get(&edge.to.to_lowercase()) {
                indegree[to] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| i)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(&next) = ready.iter().next() {
            ready.remove(&next);
            let id = self.nodes[next].id.clone();
            for edge in self.outbound(&id) {
                if let Some(&to) = self.index.get(&edge.to.to_lowercase()) {
                    indegree[to] -= 1;
                    if indegree[to] == 0 {
                        ready.insert(to);
                    }
                }
            }
            order.push(id);
        }

        if order.len() != self.nodes.len() {
            return Err(PipelineError::Validation(
                "graph contains a cycle; topological order is undefined".to_string(),
            ));
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn graph(ids: &[(&str, NodeKind)], edges: &[(&str, &str)]) -> PipelineGraph {
        PipelineGraph::new(
            ids.iter()
                .map(|(id, kind)| Arc::new(NodeDefinition::new(*id, *kind)))
                .collect(),
            edges
                .iter()
                .map(|(from, to)| EdgeDef::new(*from, *to))
                .collect(),
        )
    }

    #[test]
    fn test_lookup_is_case_insensitive() {
        let g = graph(&[("Reader", NodeKind::Source)], &[]);
        assert!(g.node("reader").is_some());
        assert!(g.node("READER").is_some());
        assert!(g.node("writer").is_none());
    }

    #[test]
    fn test_inbound_preserves_edge_order() {
        let g = graph(
            &[
                ("a", NodeKind::Source),
                ("b", NodeKind::Source),
                ("m", NodeKind::Transform),
            ],
            &[("b", "m"), ("a", "m")],
        );

        let inbound: Vec<&str> = g.inbound("m").iter().map(|e| e.from.as_str()).collect();
        assert_eq!(inbound, vec!["b", "a"]);
    }

    #[test]
    fn test_topological_order_respects_edges() {
        let g = graph(
            &[
                ("sink", NodeKind::Sink),
                ("src", NodeKind::Source),
                ("mid", NodeKind::Transform),
            ],
            &[("src", "mid"), ("mid", "sink")],
        );

        assert_eq!(g.topological_order().unwrap(), vec!["src", "mid", "sink"]);
    }

    #[test]
    fn test_topological_tie_break_is_insertion_order() {
        let g = graph(
            &[
                ("s2", NodeKind::Source),
                ("s1", NodeKind::Source),
                ("sink", NodeKind::Sink),
            ],
            &[("s2", "sink"), ("s1", "sink")],
        );

        // Both sources are ready immediately; insertion order wins.
        assert_eq!(g.topological_order().unwrap(), vec!["s2", "s1", "sink"]);
    }

    #[test]
    fn test_cycle_makes_topological_order_fail() {
        let g = graph(
            &[("a", NodeKind::Transform), ("b", NodeKind::Transform)],
            &[("a", "b"), ("b", "a")],
        );
        assert!(g.topological_order().is_err());
    }

    #[test]
    fn test_type_signature_identity() {
        assert_eq!(TypeSignature::of::<i64>(), TypeSignature::of::<i64>());
        assert_ne!(
            TypeSignature::of::<i64>().id,
            TypeSignature::of::<String>().id
        );
    }
}
