//! Pipeline context - per-run state shared by every node and strategy
//!
//! One [`PipelineContext`] exists per run. It carries:
//!
//! - the run's **cancellation token** (one signal fanned into every pipe,
//!   strategy, and connector),
//! - the composite **observer**, the **error handler**, and the
//!   **dead-letter sink**,
//! - **lineage options**, **retry defaults**, the **circuit-breaker
//!   manager**, and the **state registry**,
//! - a **scoped-node stack** naming the node currently being driven (for
//!   logging and diagnostics),
//! - a free-form **items map** for user extensions.
//!
//! The items map is written only while the runner builds the context;
//! execution reads it lock-free. Well-known keys for the built-in services
//! live in [`context_keys`] so extensions and connectors can find them
//! without a typed dependency.
//!
//! [`RunOptions`] is the knob surface callers hand to the runner; the
//! context is the frozen result.

use crate::breaker::{CircuitBreakerManager, CircuitBreakerManagerOptions, CircuitBreakerOptions};
use crate::dead_letter::{DeadLetterHandler, DeadLetterSink};
use crate::handler::{DefaultErrorHandler, ErrorHandler};
use crate::lineage::LineageOptions;
use crate::observer::{CompositeObserver, ExecutionObserver};
use crate::result::StatsRecorder;
use crate::retry::RetryOptions;
use npipeline_checkpoint::StateRegistry;
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Well-known keys under which the built-in services are mirrored into the
/// context items map
pub mod context_keys {
    /// [`crate::breaker::CircuitBreakerManager`]
    pub const CIRCUIT_BREAKER_MANAGER: &str = "npipeline.circuit_breaker_manager";
    /// Default [`crate::breaker::CircuitBreakerOptions`]
    pub const CIRCUIT_BREAKER_OPTIONS: &str = "npipeline.circuit_breaker_options";
    /// Default [`crate::retry::RetryOptions`]
    pub const RETRY_OPTIONS: &str = "npipeline.retry_options";
    /// [`npipeline_checkpoint::StateRegistry`]
    pub const STATE_REGISTRY: &str = "npipeline.state_registry";
}

/// Configuration for one pipeline run
///
/// Everything has a sensible default; construct with
/// `RunOptions::default()` and override what you need.
///
/// # Example
///
/// ```rust
/// use npipeline_core::context::RunOptions;
/// use npipeline_core::lineage::LineageOptions;
/// use npipeline_core::observer::TracingObserver;
/// use std::sync::Arc;
///
/// let options = RunOptions::default()
///     .with_observer(Arc::new(TracingObserver))
///     .with_lineage(LineageOptions::enabled());
/// ```
pub struct RunOptions {
    /// Observers receiving lifecycle events
    pub observers: Vec<Arc<dyn ExecutionObserver>>,
    /// Pipeline-scoped error handler
    pub error_handler: Arc<dyn ErrorHandler>,
    /// Dead-letter capacity; `None` disables the sink entirely
    pub dead_letter_capacity: Option<usize>,
    /// Optional external dead-letter handler
    pub dead_letter_handler: Option<Arc<dyn DeadLetterHandler>>,
    /// Lineage configuration
    pub lineage: LineageOptions,
    /// Retry defaults for nodes without their own options
    pub retry: RetryOptions,
    /// Breaker defaults for nodes without their own options
    pub circuit_breaker: CircuitBreakerOptions,
    /// Share a breaker manager across runs; a fresh one is created when
    /// absent
    pub breaker_manager: Option<Arc<CircuitBreakerManager>>,
    /// Capacity options for a freshly created manager
    pub breaker_manager_options: CircuitBreakerManagerOptions,
    /// Share a state registry across runs; a fresh in-memory one is
    /// created when absent
    pub state_registry: Option<Arc<StateRegistry>>,
    /// User extension values, exposed through [`PipelineContext::item`]
    pub items: HashMap<String, Arc<dyn Any + Send + Sync>>,
    /// How long the runner waits for in-flight work after a fatal error
    pub grace_period: Duration,
    /// External cancellation; a fresh token is created when absent
    pub cancellation: Option<CancellationToken>,
}

impl RunOptions {
    /// Add an observer
    pub fn with_observer(mut self, observer: Arc<dyn ExecutionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Replace the pipeline-scoped error handler
    pub fn with_error_handler(mut self, handler: Arc<dyn ErrorHandler>) -> Self {
        self.error_handler = handler;
        self
    }

    /// Set the dead-letter capacity
    pub fn with_dead_letter_capacity(mut self, capacity: usize) -> Self {
        self.dead_letter_capacity = Some(capacity);
        self
    }

    /// Disable the dead-letter sink
    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter_capacity = None;
        self
    }

    /// Attach an external dead-letter handler
    pub fn with_dead_letter_handler(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.dead_letter_handler = Some(handler);
        self
    }

    /// Set lineage options
    pub fn with_lineage(mut self, lineage: LineageOptions) -> Self {
        self.lineage = lineage;
        self
    }

    /// Set retry defaults
    pub fn with_retry(mut self, retry: RetryOptions) -> Self {
        self.retry = retry;
        self
    }

    /// Set breaker defaults
    pub fn with_circuit_breaker(mut self, options: CircuitBreakerOptions) -> Self {
        self.circuit_breaker = options;
        self
    }

    /// Share a breaker manager across runs
    pub fn with_breaker_manager(mut self, manager: Arc<CircuitBreakerManager>) -> Self {
        self.breaker_manager = Some(manager);
        self
    }

    /// Share a state registry across runs
    pub fn with_state_registry(mut self, registry: Arc<StateRegistry>) -> Self {
        self.state_registry = Some(registry);
        self
    }

    /// Stash a user extension value
    pub fn with_item(
        mut self,
        key: impl Into<String>,
        value: Arc<dyn Any + Send + Sync>,
    ) -> Self {
        self.items.insert(key.into(), value);
        self
    }

    /// Set the post-failure grace period
    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    /// Bind the run to an external cancellation token
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = Some(cancellation);
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            observers: Vec::new(),
            error_handler: Arc::new(DefaultErrorHandler),
            dead_letter_capacity: Some(DeadLetterSink::DEFAULT_CAPACITY),
            dead_letter_handler: None,
            lineage: LineageOptions::default(),
            retry: RetryOptions::default(),
            circuit_breaker: CircuitBreakerOptions::default(),
            breaker_manager: None,
            breaker_manager_options: CircuitBreakerManagerOptions::default(),
            state_registry: None,
            items: HashMap::new(),
            grace_period: Duration::from_secs(30),
            cancellation: None,
        }
    }
}

/// Frozen per-run state; see the [module docs](self)
pub struct PipelineContext {
    run_id: Uuid,
    cancel: CancellationToken,
    observer: Arc<CompositeObserver>,
    error_handler: Arc<dyn ErrorHandler>,
    dead_letter: Option<Arc<DeadLetterSink>>,
    lineage: LineageOptions,
    retry: RetryOptions,
    circuit_breaker: CircuitBreakerOptions,
    breakers: Arc<CircuitBreakerManager>,
    state_registry: Arc<StateRegistry>,
    stats: Arc<StatsRecorder>,
    items: HashMap<String, Arc<dyn Any + Send + Sync>>,
    node_scope: Mutex<Vec<String>>,
    grace_period: Duration,
}

impl PipelineContext {
    /// Freeze run options into a context
    pub fn new(options: RunOptions) -> Self {
        let breakers = options
            .breaker_manager
            .unwrap_or_else(|| Arc::new(CircuitBreakerManager::new(options.breaker_manager_options)));
        let state_registry = options
            .state_registry
            .unwrap_or_else(|| Arc::new(StateRegistry::in_memory()));
        let dead_letter = options.dead_letter_capacity.map(|capacity| {
            let sink = DeadLetterSink::new(capacity);
            let sink = match options.dead_letter_handler {
                Some(handler) => sink.with_handler(handler),
                None => sink,
            };
            Arc::new(sink)
        });

        let mut items = options.items;
        items.insert(
            context_keys::CIRCUIT_BREAKER_MANAGER.to_string(),
            Arc::clone(&breakers) as Arc<dyn Any + Send + Sync>,
        );
        items.insert(
            context_keys::CIRCUIT_BREAKER_OPTIONS.to_string(),
            Arc::new(options.circuit_breaker.clone()) as Arc<dyn Any + Send + Sync>,
        );
        items.insert(
            context_keys::RETRY_OPTIONS.to_string(),
            Arc::new(options.retry.clone()) as Arc<dyn Any + Send + Sync>,
        );
        items.insert(
            context_keys::STATE_REGISTRY.to_string(),
            Arc::clone(&state_registry) as Arc<dyn Any + Send + Sync>,
        );

        Self {
            run_id: Uuid::new_v4(),
            cancel: options.cancellation.unwrap_or_default(),
            observer: Arc::new(CompositeObserver::new(options.observers)),
            error_handler: options.error_handler,
            dead_letter,
            lineage: options.lineage,
            retry: options.retry,
            circuit_breaker: options.circuit_breaker,
            breakers,
            state_registry,
            stats: Arc::new(StatsRecorder::new()),
            items,
            node_scope: Mutex::new(Vec::new()),
            grace_period: options.grace_period,
        }
    }

    /// Unique id of this run
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// The run's cancellation token
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Composite observer for lifecycle events
    pub fn observer(&self) -> &CompositeObserver {
        &self.observer
    }

    /// Pipeline-scoped error handler
    pub fn error_handler(&self) -> &Arc<dyn ErrorHandler> {
        &self.error_handler
    }

    /// The dead-letter sink, when configured
    pub fn dead_letter(&self) -> Option<&Arc<DeadLetterSink>> {
        self.dead_letter.as_ref()
    }

    /// Lineage configuration
    pub fn lineage_options(&self) -> &LineageOptions {
        &self.lineage
    }

    /// Retry defaults for nodes without their own options
    pub fn retry_defaults(&self) -> &RetryOptions {
        &self.retry
    }

    /// Breaker defaults for nodes without their own options
    pub fn breaker_defaults(&self) -> &CircuitBreakerOptions {
        &self.circuit_breaker
    }

    /// The run's circuit-breaker manager
    pub fn breakers(&self) -> &Arc<CircuitBreakerManager> {
        &self.breakers
    }

    /// State registry for checkpoint handoffs
    pub fn state_registry(&self) -> &Arc<StateRegistry> {
        &self.state_registry
    }

    /// Per-node counters for the final result
    pub fn stats(&self) -> &Arc<StatsRecorder> {
        &self.stats
    }

    /// How long the runner waits for in-flight work after a fatal error
    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    /// A typed user extension value
    pub fn item<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.items
            .get(key)
            .and_then(|value| Arc::clone(value).downcast::<T>().ok())
    }

    /// Push a node onto the scope stack for the duration of the guard
    pub fn enter_node(&self, node_id: &str) -> NodeScope<'_> {
        self.node_scope
            .lock()
            .expect("node scope lock poisoned")
            .push(node_id.to_string());
        NodeScope { ctx: self }
    }

    /// The node currently being driven, if any
    pub fn current_node(&self) -> Option<String> {
        self.node_scope
            .lock()
            .expect("node scope lock poisoned")
            .last()
            .cloned()
    }
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("run_id", &self.run_id)
            .field("current_node", &self.current_node())
            .finish()
    }
}

/// Guard returned by [`PipelineContext::enter_node`]; pops the scope on
/// drop
pub struct NodeScope<'a> {
    ctx: &'a PipelineContext,
}

impl Drop for NodeScope<'_> {
    fn drop(&mut self) {
        self.ctx
            .node_scope
            .lock()
            .expect("node scope lock poisoned")
            .pop();
    }
}
