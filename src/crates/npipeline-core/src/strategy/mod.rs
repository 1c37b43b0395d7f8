//! Execution strategies - how a node is driven over its input
//!
//! A strategy wraps a transform node's execution over the merged input
//! stream and produces its output stream:
//!
//! | Strategy | Concurrency | Resilience | Use when |
//! |----------|-------------|------------|----------|
//! | [`StrategyKind::Sequential`] | pull-based, one item at a time | none | default; ordering matters |
//! | [`StrategyKind::Parallel`] | worker pool over bounded channels | per-item retries | CPU- or I/O-heavy per-item work |
//! | [`StrategyKind::Resilient`] | wraps Sequential or Parallel | node restarts + circuit breaker | flaky nodes, external systems |
//!
//! Resilient never nests inside Resilient; item retries (Parallel) and
//! node restarts (Resilient) are independent budgets - an item retry never
//! escalates to a node restart unless the whole attempt fails.

pub mod parallel;
pub mod resilient;
pub mod sequential;

pub use parallel::ParallelOptions;
pub use resilient::ResilientOptions;

use crate::error::{PipelineError, Result};

/// Per-node execution strategy selection
#[derive(Debug, Clone, PartialEq)]
pub enum StrategyKind {
    /// Single consumer, single producer; backpressure is inherent
    Sequential,
    /// Fan-out to a worker pool, fan-in to the output
    Parallel(ParallelOptions),
    /// Retry, circuit breaker, and restart around an inner strategy
    Resilient(ResilientOptions),
}

impl StrategyKind {
    /// Short name for logs and diagnostics
    pub fn name(&self) -> &'static str {
        match self {
            Self::Sequential => "sequential",
            Self::Parallel(_) => "parallel",
            Self::Resilient(_) => "resilient",
        }
    }

    /// Whether this strategy carries restart/breaker behavior
    pub fn is_resilient(&self) -> bool {
        matches!(self, Self::Resilient(_))
    }

    /// Check structural invariants (no nested Resilient, sane bounds)
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Sequential => Ok(()),
            Self::Parallel(options) => options.validate(),
            Self::Resilient(options) => {
                if options.inner.is_resilient() {
                    return Err(PipelineError::configuration(
                        "resilient strategies cannot nest",
                    ));
                }
                options.inner.validate()
            }
        }
    }
}

impl Default for StrategyKind {
    fn default() -> Self {
        Self::Sequential
    }
}

/// Scope an error to a node unless it already is (or is a cancellation)
pub(crate) fn attach_node(node_id: &str, error: PipelineError) -> PipelineError {
    match error {
        e @ PipelineError::Cancelled => e,
        e if e.node_id().is_some() => e,
        e => {
            let transient = e.is_transient();
            PipelineError::NodeExecution {
                node: node_id.to_string(),
                error: e.to_string(),
                transient,
            }
        }
    }
}
