//! # npipeline-core - Typed DAG Pipeline Runtime
//!
//! **Build and execute typed data-processing pipelines** shaped as
//! directed acyclic graphs of nodes exchanging lazy item streams.
//!
//! ## Overview
//!
//! `npipeline-core` is a library (no CLI, no config files) providing:
//!
//! - **Typed graph construction** - a fluent builder with full structural,
//!   type, cycle, and reachability validation before anything runs
//! - **Lazy streaming execution** - pull-based pipes with inherent
//!   backpressure; nothing flows until a sink asks
//! - **Per-node execution strategies** - sequential, parallel worker
//!   pools, and a resilient wrapper with restarts and circuit breaking
//! - **Merge strategies** - interleave, concatenate, keyed join, or fully
//!   custom fan-in for multi-input nodes
//! - **Item-level lineage** - provenance packets tracking every item's
//!   path through the graph, with mismatch detection
//! - **Resilience plumbing** - retry backoff x jitter composition,
//!   per-node circuit breakers with a bounded LRU manager, a bounded
//!   dead-letter sink, and pluggable error-handler decisions
//! - **State handoffs** - stateful nodes checkpoint through
//!   `npipeline-checkpoint`'s state registry
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ PipelineBuilder ── validate ──> Pipeline (graph + plans)     │
//! └──────────────┬───────────────────────────────────────────────┘
//!                │ PipelineRunner::run
//!                ↓
//! ┌──────────────────────────────────────────────────────────────┐
//! │ topo-sort ─> per node: merge inputs ─> strategy ─> fan out   │
//! │                                                              │
//! │   Source ──> Transform(Sequential/Parallel/Resilient) ──┐    │
//! │   Source ──> CustomMerge ───────────────────────────────┼──> │
//! │                 [lineage packets ride along each item]  Sink │
//! └──────────────────────────────────────────────────────────────┘
//!                ↓
//!        ExecutionResult { success, errors, duration, node_stats }
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use npipeline_core::builder::PipelineBuilder;
//! use npipeline_core::node::{CollectingSink, FnSource, FnTransform};
//! use npipeline_core::runner::PipelineRunner;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let sink = CollectingSink::<i64>::new();
//!     let collected = sink.clone();
//!
//!     let mut builder = PipelineBuilder::new();
//!     builder
//!         .add_source("numbers", || FnSource::new(|| vec![1_i64, 2, 3]))?
//!         .add_transform("double", || FnTransform::new(|x: i64| Ok(x * 2)))?
//!         .add_sink("collect", move || sink.clone())?;
//!     builder.connect("numbers", "double").connect("double", "collect");
//!
//!     let pipeline = builder.build()?;
//!     let result = PipelineRunner::run(&pipeline).await;
//!
//!     assert!(result.success);
//!     assert_eq!(collected.collected(), vec![2, 4, 6]);
//!     Ok(())
//! }
//! ```
//!
//! ## Non-Goals
//!
//! Distributed execution across hosts, exactly-once delivery to external
//! systems (at-least-once with acknowledgement hooks only), and query
//! planning are out of scope. Concrete connectors live outside this
//! crate and implement the [`node::Source`] / [`node::Sink`] contracts.

pub mod breaker;
pub mod builder;
pub mod context;
pub mod dead_letter;
pub mod error;
pub mod graph;
pub mod handler;
pub mod lineage;
pub mod merge;
pub mod node;
pub mod observer;
pub mod pipe;
mod plan;
pub mod result;
pub mod retry;
pub mod runner;
pub mod strategy;
pub mod validation;
pub mod visualization;

pub use breaker::{
    CircuitBreaker, CircuitBreakerManager, CircuitBreakerManagerOptions, CircuitBreakerOptions,
    CircuitState, TripThreshold,
};
pub use builder::{NodeOptions, Pipeline, PipelineBuilder};
pub use context::{context_keys, PipelineContext, RunOptions};
pub use dead_letter::{DeadLetterEntry, DeadLetterHandler, DeadLetterSink};
pub use error::{PipelineError, Result};
pub use graph::{EdgeDef, NodeDefinition, NodeId, NodeKind, PipelineGraph, TypeSignature};
pub use handler::{DefaultErrorHandler, ErrorDecision, ErrorHandler, FixedDecisionHandler};
pub use lineage::{
    HopOutcome, HopRecord, LineageCardinality, LineageMapper, LineageMismatchContext,
    LineageOptions, LineageOverflowPolicy, LineagePacket, ObservedCardinality, Traced,
};
pub use merge::{JoinConfig, MergePolicy, MergeType};
pub use node::{
    Acknowledgable, CollectingSink, CustomMerge, FnSink, FnSource, FnTransform, Sink, Source,
    Transform,
};
pub use observer::{CompositeObserver, ExecutionObserver, NullObserver, TracingObserver};
pub use pipe::{BoxItemStream, DataPipe, PipeItem};
pub use result::{ExecutionResult, NodeStats};
pub use retry::{BackoffKind, JitterKind, RetryOptions, RetryPolicy};
pub use runner::PipelineRunner;
pub use strategy::{ParallelOptions, ResilientOptions, StrategyKind};
pub use validation::{
    Severity, ValidationCategory, ValidationIssue, ValidationMode, ValidationResult,
};
pub use visualization::{visualize, VisualizationFormat, VisualizationOptions};

// The checkpoint crate is part of the public surface for stateful nodes.
pub use npipeline_checkpoint::{Checkpoint, CheckpointStrategy, StateRegistry};
