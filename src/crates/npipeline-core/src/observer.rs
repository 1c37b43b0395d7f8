//! Execution observers - lifecycle events for metrics and tracing
//!
//! The core emits run, node, item, retry, and breaker events to a
//! composite observer. Observers are passive: a panicking observer is
//! caught and logged, and no observer can cancel or slow a run beyond the
//! cost of its own callback. When nothing is configured, the null object
//! keeps every call site unconditional.
//!
//! # Events
//!
//! - `pipeline_starting` / `pipeline_finished` / `pipeline_failed`
//! - `node_executing` / `node_finished` / `node_failed`
//! - `item_produced(node)` / `item_dropped(node, reason)`
//! - `retry_scheduled(node, attempt, delay)`
//! - `breaker_transition(node, from, to)`
//!
//! # Implementations
//!
//! | Type | Purpose |
//! |------|---------|
//! | [`NullObserver`] | no-op placeholder |
//! | [`TracingObserver`] | structured `tracing` events |
//! | [`CompositeObserver`] | fan-out to several observers, panic-isolated |

use crate::breaker::CircuitState;
use crate::error::PipelineError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Receiver of pipeline lifecycle events
///
/// All methods default to no-ops; implement the ones you care about.
/// Implementations must tolerate being called from any worker thread.
#[allow(unused_variables)]
pub trait ExecutionObserver: Send + Sync {
    /// A run is about to execute its first node
    fn pipeline_starting(&self, run_id: Uuid) {}

    /// A run finished without a fatal error
    fn pipeline_finished(&self, run_id: Uuid, duration: Duration) {}

    /// A run failed; `error` is the primary cause
    fn pipeline_failed(&self, run_id: Uuid, error: &PipelineError) {}

    /// A node's execution plan is being bound and driven
    fn node_executing(&self, node_id: &str) {}

    /// A node completed its part of the run
    fn node_finished(&self, node_id: &str, duration: Duration) {}

    /// A node failed fatally
    fn node_failed(&self, node_id: &str, error: &PipelineError) {}

    /// A node emitted one item downstream
    fn item_produced(&self, node_id: &str) {}

    /// An item was dropped (dead-lettered, join-expired, ...)
    fn item_dropped(&self, node_id: &str, reason: &str) {}

    /// A retry was scheduled after a failure
    fn retry_scheduled(&self, node_id: &str, attempt: u32, delay: Duration) {}

    /// A circuit breaker changed state
    fn breaker_transition(&self, node_id: &str, from: CircuitState, to: CircuitState) {}
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NullObserver;

impl ExecutionObserver for NullObserver {}

/// Observer that forwards events to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ExecutionObserver for TracingObserver {
    fn pipeline_starting(&self, run_id: Uuid) {
        tracing::info!(%run_id, "pipeline starting");
    }

    fn pipeline_finished(&self, run_id: Uuid, duration: Duration) {
        tracing::info!(%run_id, duration_ms = duration.as_millis() as u64, "pipeline finished");
    }

    fn pipeline_failed(&self, run_id: Uuid, error: &PipelineError) {
        tracing::error!(%run_id, %error, "pipeline failed");
    }

    fn node_executing(&self, node_id: &str) {
        tracing::debug!(node = %node_id, "node executing");
    }

    fn node_finished(&self, node_id: &str, duration: Duration) {
        tracing::debug!(node = %node_id, duration_ms = duration.as_millis() as u64, "node finished");
    }

    fn node_failed(&self, node_id: &str, error: &PipelineError) {
        tracing::error!(node = %node_id, %error, "node failed");
    }

    fn item_dropped(&self, node_id: &str, reason: &str) {
        tracing::debug!(node = %node_id, reason, "item dropped");
    }

    fn retry_scheduled(&self, node_id: &str, attempt: u32, delay: Duration) {
        tracing::warn!(
            node = %node_id,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "retry scheduled"
        );
    }

    fn breaker_transition(&self, node_id: &str, from: CircuitState, to: CircuitState) {
        tracing::info!(node = %node_id, %from, %to, "circuit breaker transition");
    }
}

/// Fan-out to several observers with panic isolation
///
/// Panics from individual observers are caught and logged; the remaining
/// observers still receive the event.
#[derive(Clone, Default)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn ExecutionObserver>>,
}

impl CompositeObserver {
    pub fn new(observers: Vec<Arc<dyn ExecutionObserver>>) -> Self {
        Self { observers }
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn each(&self, event: &str, f: impl Fn(&dyn ExecutionObserver)) {
        for observer in &self.observers {
            let call = AssertUnwindSafe(|| f(observer.as_ref()));
            if std::panic::catch_unwind(call).is_err() {
                tracing::warn!(event, "execution observer panicked; event skipped");
            }
        }
    }
}

impl ExecutionObserver for CompositeObserver {
    fn pipeline_starting(&self, run_id: Uuid) {
        self.each("pipeline_starting", |o| o.pipeline_starting(run_id));
    }

    fn pipeline_finished(&self, run_id: Uuid, duration: Duration) {
        self.each("pipeline_finished", |o| o.pipeline_finished(run_id, duration));
    }

    fn pipeline_failed(&self, run_id: Uuid, error: &PipelineError) {
        self.each("pipeline_failed", |o| o.pipeline_failed(run_id, error));
    }

    fn node_executing(&self, node_id: &str) {
        self.each("node_executing", |o| o.node_executing(node_id));
    }

    fn node_finished(&self, node_id: &str, duration: Duration) {
        self.each("node_finished", |o| o.node_finished(node_id, duration));
    }

    fn node_failed(&self, node_id: &str, error: &PipelineError) {
        self.each("node_failed", |o| o.node_failed(node_id, error));
    }

    fn item_produced(&self, node_id: &str) {
        self.each("item_produced", |o| o.item_produced(node_id));
    }

    fn item_dropped(&self, node_id: &str, reason: &str) {
        self.each("item_dropped", |o| o.item_dropped(node_id, reason));
    }

    fn retry_scheduled(&self, node_id: &str, attempt: u32, delay: Duration) {
        self.each("retry_scheduled", |o| o.retry_scheduled(node_id, attempt, delay));
    }

    fn breaker_transition(&self, node_id: &str, from: CircuitState, to: CircuitState) {
        self.each("breaker_transition", |o| o.breaker_transition(node_id, from, to));
    }
}

impl std::fmt::Debug for CompositeObserver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeObserver")
            .field("observers", &self.observers.len())
            .finish()
    }
}
