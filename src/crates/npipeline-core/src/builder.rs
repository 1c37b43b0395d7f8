//! Pipeline builder - fluent graph construction
//!
//! [`PipelineBuilder`] is the only way to produce a runnable
//! [`Pipeline`]. Nodes register with a name and a per-run factory;
//! [`PipelineBuilder::connect`] wires edges; [`PipelineBuilder::build`]
//! validates and freezes everything.
//!
//! # Quick Start
//!
//! ```rust
//! use npipeline_core::builder::PipelineBuilder;
//! use npipeline_core::node::{CollectingSink, FnSource, FnTransform};
//!
//! fn build() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut builder = PipelineBuilder::new();
//!     builder
//!         .add_source("numbers", || FnSource::new(|| vec![1_i64, 2, 3]))?
//!         .add_transform("double", || FnTransform::new(|x: i64| Ok(x * 2)))?
//!         .add_sink("collect", CollectingSink::<i64>::new)?;
//!     builder.connect("numbers", "double").connect("double", "collect");
//!
//!     let pipeline = builder.build()?;
//!     assert_eq!(pipeline.graph().len(), 3);
//!     Ok(())
//! }
//! # build().unwrap();
//! ```
//!
//! # Naming
//!
//! Names are node ids and must be unique case-insensitively. By default a
//! collision is resolved at build time by suffixing `-<n>` with a
//! monotonically increasing `n` (edges keep binding to the first bearer
//! of the name). With [`PipelineBuilder::with_early_name_check`] the
//! colliding `add_*` call fails instead.
//!
//! # Validation
//!
//! [`ValidationMode::Strict`] (default) fails `build` on the first error;
//! `Warn` logs every finding and builds anyway; `Off` skips validation.
//! The full rule set lives in [`crate::validation`]. No node factory runs
//! before validation passes - instances are created per run, never at
//! build time.

use crate::breaker::CircuitBreakerOptions;
use crate::error::{PipelineError, Result};
use crate::graph::{EdgeDef, NodeDefinition, NodeKind, PipelineGraph, TypeSignature};
use crate::handler::ErrorHandler;
use crate::lineage::{LineageCardinality, LineageMapper};
use crate::merge::{MergePolicy, MergeType};
use crate::node::{CustomMerge, Sink, Source, Transform};
use crate::pipe::PipeItem;
use crate::plan::{ErasedNodeFactory, MergeNodeExec, SinkExec, SourceExec, TransformExec};
use crate::retry::RetryOptions;
use crate::strategy::StrategyKind;
use crate::validation::{validate_graph, ValidationMode, ValidationResult};
use npipeline_checkpoint::CheckpointStrategy;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-node configuration supplied to the `add_*_with` registrations
///
/// `T` is the node's input element type (output type for sources), which
/// types the merge policy. Everything defaults to the simplest choice:
/// sequential strategy, interleave merge, one-to-one lineage.
pub struct NodeOptions<T> {
    /// Human-facing name; defaults to the node id
    pub display_name: Option<String>,
    /// Execution strategy
    pub strategy: StrategyKind,
    /// Node-scoped retry options
    pub retry: Option<RetryOptions>,
    /// Node-scoped breaker options
    pub circuit_breaker: Option<CircuitBreakerOptions>,
    /// Dead-letter failing items instead of failing the node
    pub continue_on_error: bool,
    /// How multiple inbound pipes combine
    pub merge: MergePolicy<T>,
    /// Declared lineage cardinality
    pub cardinality: LineageCardinality,
    /// Custom lineage ancestry callback
    pub lineage_mapper: Option<LineageMapper>,
    /// Node-scoped error handler override
    pub error_handler: Option<Arc<dyn ErrorHandler>>,
    /// Declare the node stateful with the given checkpoint strategy
    pub stateful: Option<CheckpointStrategy>,
}

impl<T> NodeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
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

    pub fn with_merge(mut self, merge: MergePolicy<T>) -> Self {
        self.merge = merge;
        self
    }

    pub fn with_cardinality(mut self, cardinality: LineageCardinality) -> Self {
        self.cardinality = cardinality;
        self
    }

    pub fn with_lineage_mapper(mut self, mapper: LineageMapper) -> Self {
        self.lineage_mapper = Some(mapper);
        self
    }

    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = Some(handler);
        self
    }

    pub fn with_stateful(mut self, strategy: CheckpointStrategy) -> Self {
        self.stateful = Some(strategy);
        self
    }
}

impl<T> Default for NodeOptions<T> {
    fn default() -> Self {
        Self {
            display_name: None,
            strategy: StrategyKind::Sequential,
            retry: None,
            circuit_breaker: None,
            continue_on_error: false,
            merge: MergePolicy::default(),
            cardinality: LineageCardinality::OneToOne,
            lineage_mapper: None,
            error_handler: None,
            stateful: None,
        }
    }
}

struct Registration {
    def: NodeDefinition,
    factory: ErasedNodeFactory,
}

/// Fluent construction of a [`Pipeline`]
pub struct PipelineBuilder {
    registrations: Vec<Registration>,
    edges: Vec<EdgeDef>,
    mode: ValidationMode,
    early_name_check: bool,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self {
            registrations: Vec::new(),
            edges: Vec::new(),
            mode: ValidationMode::default(),
            early_name_check: false,
        }
    }

    /// Set how validation findings are enforced at build time
    pub fn with_validation_mode(mut self, mode: ValidationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Fail `add_*` on a name collision instead of suffixing at build time
    pub fn with_early_name_check(mut self, early: bool) -> Self {
        self.early_name_check = early;
        self
    }

    /// Register a source node
    pub fn add_source<T, S, F>(&mut self, name: impl Into<String>, factory: F) -> Result<&mut Self>
    where
        T: PipeItem,
        S: Source<T>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        self.add_source_with(name, factory, NodeOptions::default())
    }

    /// Register a source node with options
    pub fn add_source_with<T, S, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
        options: NodeOptions<T>,
    ) -> Result<&mut Self>
    where
        T: PipeItem,
        S: Source<T>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        let def = self
            .definition(name.into(), NodeKind::Source, &options)
            .with_output_type(TypeSignature::of::<T>());
        self.register(def, SourceExec::<T>::factory(factory))
    }

    /// Register a per-item or whole-stream transform node
    pub fn add_transform<TIn, TOut, N, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<&mut Self>
    where
        TIn: PipeItem,
        TOut: PipeItem,
        N: Transform<TIn, TOut>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        self.add_transform_with(name, factory, NodeOptions::default())
    }

    /// Register a transform node with options
    pub fn add_transform_with<TIn, TOut, N, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
        options: NodeOptions<TIn>,
    ) -> Result<&mut Self>
    where
        TIn: PipeItem,
        TOut: PipeItem,
        N: Transform<TIn, TOut>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        let def = self
            .definition(name.into(), NodeKind::Transform, &options)
            .with_input_type(TypeSignature::of::<TIn>())
            .with_output_type(TypeSignature::of::<TOut>());
        let erased = TransformExec::<TIn, TOut>::factory(
            factory,
            options.merge,
            options.lineage_mapper,
            options.error_handler,
        );
        self.register(def, erased)
    }

    /// Register a sink node
    pub fn add_sink<T, N, F>(&mut self, name: impl Into<String>, factory: F) -> Result<&mut Self>
    where
        T: PipeItem,
        N: Sink<T>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        self.add_sink_with(name, factory, NodeOptions::default())
    }

    /// Register a sink node with options
    pub fn add_sink_with<T, N, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
        options: NodeOptions<T>,
    ) -> Result<&mut Self>
    where
        T: PipeItem,
        N: Sink<T>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        let def = self
            .definition(name.into(), NodeKind::Sink, &options)
            .with_input_type(TypeSignature::of::<T>());
        let erased = SinkExec::<T>::factory(factory, options.merge);
        self.register(def, erased)
    }

    /// Register a custom-merge node
    pub fn add_custom_merge<T, N, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
    ) -> Result<&mut Self>
    where
        T: PipeItem,
        N: CustomMerge<T>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        self.add_custom_merge_with(name, factory, NodeOptions::default())
    }

    /// Register a custom-merge node with options
    pub fn add_custom_merge_with<T, N, F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
        options: NodeOptions<T>,
    ) -> Result<&mut Self>
    where
        T: PipeItem,
        N: CustomMerge<T>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        let def = self
            .definition(name.into(), NodeKind::CustomMerge, &options)
            .with_input_type(TypeSignature::of::<T>())
            .with_output_type(TypeSignature::of::<T>())
            .with_merge_type(MergeType::Custom);
        self.register(def, MergeNodeExec::<T>::factory(factory))
    }

    /// Append an edge from `from` to `to` (names, case-insensitive)
    pub fn connect(&mut self, from: impl Into<String>, to: impl Into<String>) -> &mut Self {
        self.edges.push(EdgeDef::new(from, to));
        self
    }

    /// Validate and freeze the graph into a runnable [`Pipeline`]
    ///
    /// # Errors
    ///
    /// [`PipelineError::Validation`] in strict mode when any rule fails.
    pub fn build(self) -> Result<Pipeline> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut suffix: HashMap<String, u32> = HashMap::new();
        let mut nodes = Vec::with_capacity(self.registrations.len());
        let mut factories: HashMap<String, ErasedNodeFactory> = HashMap::new();

        for registration in self.registrations {
            let mut def = registration.def;
            if !seen.insert(def.id.to_lowercase()) {
                let base = def.id.clone();
                let renamed = loop {
                    let n = suffix.entry(base.to_lowercase()).or_insert(0);
                    *n += 1;
                    let candidate = format!("{}-{}", base, n);
                    if seen.insert(candidate.to_lowercase()) {
                        break candidate;
                    }
                };
                tracing::debug!(
                    original = %base,
                    renamed = %renamed,
                    "node name collision resolved with suffix"
                );
                if def.display_name == def.id {
                    def.display_name = renamed.clone();
                }
                def.id = renamed;
            }
            factories.insert(def.id.clone(), registration.factory);
            nodes.push(Arc::new(def));
        }

        let graph = PipelineGraph::new(nodes, self.edges);

        let validation = match self.mode {
            ValidationMode::Off => ValidationResult::default(),
            ValidationMode::Strict => {
                let result = validate_graph(&graph);
                if let Some(first) = result.errors().first() {
                    return Err(PipelineError::Validation(first.message.clone()));
                }
                result
            }
            ValidationMode::Warn => {
                let result = validate_graph(&graph);
                for issue in &result.issues {
                    tracing::warn!(
                        category = ?issue.category,
                        node = issue.node_id.as_deref().unwrap_or(""),
                        "{}",
                        issue.message
                    );
                }
                result
            }
        };

        tracing::debug!(
            nodes = graph.len(),
            edges = graph.edges().len(),
            "pipeline built"
        );
        Ok(Pipeline {
            graph,
            factories,
            validation,
        })
    }

    fn definition<T>(
        &self,
        name: String,
        kind: NodeKind,
        options: &NodeOptions<T>,
    ) -> NodeDefinition {
        let mut def = NodeDefinition::new(name, kind)
            .with_strategy(options.strategy.clone())
            .with_continue_on_error(options.continue_on_error)
            .with_merge_type(options.merge.merge_type())
            .with_cardinality(options.cardinality)
            .with_lineage_mapper_flag(options.lineage_mapper.is_some());
        if let Some(display_name) = &options.display_name {
            def = def.with_display_name(display_name.clone());
        }
        if let Some(retry) = &options.retry {
            def = def.with_retry(retry.clone());
        }
        if let Some(breaker) = &options.circuit_breaker {
            def = def.with_circuit_breaker(breaker.clone());
        }
        if let Some(strategy) = options.stateful {
            def = def.with_stateful(strategy);
        }
        def
    }

    fn register(&mut self, def: NodeDefinition, factory: ErasedNodeFactory) -> Result<&mut Self> {
        if self.early_name_check
            && self
                .registrations
                .iter()
                .any(|r| r.def.id.eq_ignore_ascii_case(&def.id))
        {
            return Err(PipelineError::Validation(format!(
                "node name '{}' is already taken",
                def.id
            )));
        }
        self.registrations.push(Registration { def, factory });
        Ok(self)
    }
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A validated, runnable pipeline
///
/// Produced by [`PipelineBuilder::build`]; executed by
/// [`PipelineRunner`](crate::runner::PipelineRunner). Holds the frozen
/// graph plus the per-run node factories; no node instance exists until a
/// run starts.
pub struct Pipeline {
    graph: PipelineGraph,
    pub(crate) factories: HashMap<String, ErasedNodeFactory>,
    validation: ValidationResult,
}

impl Pipeline {
    /// The frozen graph
    pub fn graph(&self) -> &PipelineGraph {
        &self.graph
    }

    /// Findings collected at build time (empty with validation off)
    pub fn validation(&self) -> &ValidationResult {
        &self.validation
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("nodes", &self.graph.len())
            .field("edges", &self.graph.edges().len())
            .finish()
    }
}
