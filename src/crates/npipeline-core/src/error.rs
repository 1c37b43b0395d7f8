//! Error types and error handling for pipeline operations
//!
//! This module defines all error kinds that can occur during graph
//! construction, validation, and execution. All errors implement
//! `std::error::Error` via the `thiserror` crate.
//!
//! # Error Hierarchy
//!
//! ```text
//! PipelineError
//! ├── Validation                      - Graph structure errors
//! ├── NodeExecution                   - A node failed while processing
//! ├── PipelineExecution               - Top-level run failure
//! ├── RetryExhausted                  - Item/attempt budget exceeded
//! ├── CircuitBreakerOpen              - Blocked by an open breaker
//! ├── CircuitBreakerTripped           - Breaker threshold was met
//! ├── NodeRestart                     - Internal restart control signal
//! ├── MaxNodeRestartAttemptsExceeded  - Restart budget exceeded
//! ├── MergeOverflow                   - Bounded merge buffer at capacity
//! ├── LineageMismatch                 - 1:1 cardinality violation
//! ├── PipeAlreadyConsumed             - Programming error
//! ├── DeadLetterOverflow              - Dead-letter capacity exceeded
//! ├── DeadLetterFailure               - Dead-letter handler failed
//! ├── Cancelled                       - Cooperative cancellation
//! ├── Checkpoint                      - State registry errors
//! ├── Configuration                   - Invalid options
//! └── Io                              - I/O errors
//! ```
//!
//! # Error Handling Patterns
//!
//! ## Matching Specific Errors
//!
//! ```rust
//! use npipeline_core::error::PipelineError;
//!
//! fn describe(err: &PipelineError) -> String {
//!     match err {
//!         PipelineError::NodeExecution { node, error, .. } => {
//!             format!("node '{}' failed: {}", node, error)
//!         }
//!         PipelineError::CircuitBreakerOpen { node } => {
//!             format!("node '{}' is short-circuited", node)
//!         }
//!         PipelineError::Cancelled => "run was cancelled".to_string(),
//!         other => format!("{}", other),
//!     }
//! }
//! ```
//!
//! ## Transient vs. Permanent Failures
//!
//! Node failures carry a `transient` flag that feeds the default error
//! handler's decision table: transient failures restart the node, permanent
//! ones dead-letter or fail it. Use [`PipelineError::transient_io`] when a
//! connector hits a failure that a retry can plausibly fix (timeouts,
//! connection resets, throttling) and [`PipelineError::node_execution`] for
//! everything else.
//!
//! # See Also
//!
//! - [`Result`] - Convenience type alias
//! - [`crate::handler`] - Error handler decisions consuming these kinds

use npipeline_checkpoint::CheckpointError;
use thiserror::Error;

/// Convenience result type using [`PipelineError`]
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Comprehensive error type for all pipeline operations
///
/// The taxonomy is deliberately kind-oriented: resilience components
/// (retry, breaker, dead-letter, restart control) match on variants, not on
/// message contents.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Graph structure validation failed
    ///
    /// Occurs at build time when the graph violates a structural, type,
    /// cycle, reachability, or naming rule.
    #[error("Pipeline validation failed: {0}")]
    Validation(String),

    /// A node failed while processing
    ///
    /// `transient` marks failures a retry can plausibly fix; the default
    /// error handler restarts transient failures and dead-letters or fails
    /// permanent ones.
    #[error("Node '{node}' execution failed: {error}")]
    NodeExecution {
        /// Id of the node that failed
        node: String,
        /// Error message from node execution
        error: String,
        /// Whether a retry can plausibly fix the failure
        transient: bool,
    },

    /// Top-level run failure wrapping the first fatal cause
    #[error("Pipeline execution failed: {0}")]
    PipelineExecution(String),

    /// The attempt budget for an item or call was exceeded
    #[error("Node '{node}' exhausted {attempts} attempts: {last_error}")]
    RetryExhausted {
        /// Id of the node whose retries ran out
        node: String,
        /// Attempts made, including the first
        attempts: u32,
        /// Error message of the last attempt
        last_error: String,
    },

    /// The node's circuit breaker is open; the call was rejected
    #[error("Circuit breaker for node '{node}' is open")]
    CircuitBreakerOpen {
        /// Id of the short-circuited node
        node: String,
    },

    /// The breaker's failure threshold was met and the circuit opened
    #[error("Circuit breaker for node '{node}' tripped")]
    CircuitBreakerTripped {
        /// Id of the node whose breaker tripped
        node: String,
    },

    /// Internal control signal requesting a node restart
    #[error("Node '{node}' restart requested: {reason}")]
    NodeRestart {
        /// Id of the node to restart
        node: String,
        /// Why a restart was requested
        reason: String,
    },

    /// The restart budget for a node was exceeded
    #[error("Node '{node}' exceeded {attempts} restart attempts")]
    MaxNodeRestartAttemptsExceeded {
        /// Id of the node that kept failing
        node: String,
        /// Restart attempts made
        attempts: u32,
    },

    /// A bounded merge/join buffer reached capacity
    #[error("Merge buffer for node '{node}' overflowed its capacity of {capacity}")]
    MergeOverflow {
        /// Id of the merging node
        node: String,
        /// Configured buffer capacity
        capacity: usize,
    },

    /// One-to-one lineage cardinality was violated under strict mode
    #[error("Lineage mismatch at node '{node}': {detail}")]
    LineageMismatch {
        /// Id of the node where input/output counts diverged
        node: String,
        /// Human-readable mismatch summary
        detail: String,
    },

    /// A pipe was consumed twice (programming error)
    #[error("Pipe was already consumed; pipes are single-consumer")]
    PipeAlreadyConsumed,

    /// The dead-letter sink reached its bounded capacity
    #[error("Dead-letter sink overflowed its capacity of {capacity}")]
    DeadLetterOverflow {
        /// Configured dead-letter capacity
        capacity: usize,
    },

    /// A custom dead-letter handler failed
    #[error("Dead-letter handler failed for node '{node}': {error}")]
    DeadLetterFailure {
        /// Id of the node whose item was being dead-lettered
        node: String,
        /// Handler error message
        error: String,
    },

    /// Cooperative cancellation; propagates to the caller unwrapped
    #[error("Pipeline execution was cancelled")]
    Cancelled,

    /// State registry / checkpoint error
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Create a permanent node execution error
    ///
    /// # Examples
    ///
    /// ```rust
    /// use npipeline_core::error::PipelineError;
    ///
    /// let err = PipelineError::node_execution("parser", "malformed record");
    /// assert_eq!(
    ///     format!("{}", err),
    ///     "Node 'parser' execution failed: malformed record"
    /// );
    /// ```
    pub fn node_execution(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
            transient: false,
        }
    }

    /// Create a transient node execution error (eligible for restart)
    ///
    /// Use for timeouts, connection resets, throttling, and other failures
    /// that a retry can plausibly fix.
    pub fn transient_io(node: impl Into<String>, error: impl Into<String>) -> Self {
        Self::NodeExecution {
            node: node.into(),
            error: error.into(),
            transient: true,
        }
    }

    /// Create a top-level pipeline execution error
    pub fn pipeline_execution(message: impl Into<String>) -> Self {
        Self::PipelineExecution(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Whether this error marks a failure a retry can plausibly fix
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NodeExecution { transient: true, .. } | Self::Io(_)
        )
    }

    /// Whether this error is a cooperative cancellation
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The node id this error is scoped to, if any
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Self::NodeExecution { node, .. }
            | Self::RetryExhausted { node, .. }
            | Self::CircuitBreakerOpen { node }
            | Self::CircuitBreakerTripped { node }
            | Self::NodeRestart { node, .. }
            | Self::MaxNodeRestartAttemptsExceeded { node, .. }
            | Self::MergeOverflow { node, .. }
            | Self::LineageMismatch { node, .. }
            | Self::DeadLetterFailure { node, .. } => Some(node),
            _ => None,
        }
    }

    /// Structural copy for broadcast paths (fan-out edges deliver the same
    /// failure to every branch). Non-clonable payloads are stringified.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Self::Validation(m) => Self::Validation(m.clone()),
            Self::NodeExecution {
                node,
                error,
                transient,
            } => Self::NodeExecution {
                node: node.clone(),
                error: error.clone(),
                transient: *transient,
            },
            Self::PipelineExecution(m) => Self::PipelineExecution(m.clone()),
            Self::RetryExhausted {
                node,
                attempts,
                last_error,
            } => Self::RetryExhausted {
                node: node.clone(),
                attempts: *attempts,
                last_error: last_error.clone(),
            },
            Self::CircuitBreakerOpen { node } => Self::CircuitBreakerOpen { node: node.clone() },
            Self::CircuitBreakerTripped { node } => {
                Self::CircuitBreakerTripped { node: node.clone() }
            }
            Self::NodeRestart { node, reason } => Self::NodeRestart {
                node: node.clone(),
                reason: reason.clone(),
            },
            Self::MaxNodeRestartAttemptsExceeded { node, attempts } => {
                Self::MaxNodeRestartAttemptsExceeded {
                    node: node.clone(),
                    attempts: *attempts,
                }
            }
            Self::MergeOverflow { node, capacity } => Self::MergeOverflow {
                node: node.clone(),
                capacity: *capacity,
            },
            Self::LineageMismatch { node, detail } => Self::LineageMismatch {
                node: node.clone(),
                detail: detail.clone(),
            },
            Self::PipeAlreadyConsumed => Self::PipeAlreadyConsumed,
            Self::DeadLetterOverflow { capacity } => Self::DeadLetterOverflow {
                capacity: *capacity,
            },
            Self::DeadLetterFailure { node, error } => Self::DeadLetterFailure {
                node: node.clone(),
                error: error.clone(),
            },
            Self::Cancelled => Self::Cancelled,
            Self::Checkpoint(e) => Self::PipelineExecution(format!("checkpoint error: {}", e)),
            Self::Configuration(m) => Self::Configuration(m.clone()),
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
        }
    }
}
