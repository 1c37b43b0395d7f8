//! Error handler decisions - what to do when a node fails
//!
//! Restart and cancellation are **not** exceptions-as-control-flow here:
//! a failing node produces an error value, the error handler returns an
//! explicit [`ErrorDecision`], and the Resilient strategy acts on it. The
//! node-scoped handler override (if any) is consulted first, then the
//! pipeline-scoped handler.
//!
//! # Default Decision Table
//!
//! | Error kind | Decision |
//! |------------|----------|
//! | Transient node failure (`NodeExecution { transient: true }`, `Io`) | `RestartNode` |
//! | Validation / data failure (`NodeExecution { transient: false }`) | `Continue` when a dead-letter sink is configured, else `FailNode` |
//! | Programming error (`PipeAlreadyConsumed`) | `StopPipeline` |
//! | `CircuitBreakerOpen` | `FailNode` (never consumes a retry) |
//! | `RetryExhausted` | `StopPipeline` (the strategy downgrades to `Continue` when the node sets `continue_on_error`) |
//! | `Cancelled` | `StopPipeline` |
//! | anything else | `FailNode` |

use crate::context::PipelineContext;
use crate::error::PipelineError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// What the strategy should do about a node failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDecision {
    /// Keep the output produced so far and move on
    Continue,
    /// Fail this node (and with it the run, unless a downstream policy
    /// absorbs it)
    FailNode,
    /// Drop partial output, re-initialize the node, and try again
    RestartNode,
    /// Cancel the whole run
    StopPipeline,
}

/// Plugin deciding how node failures are handled
///
/// Handlers are consulted with the failing node id, the error, and the run
/// context; they must tolerate being called from any worker thread.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    /// Decide what to do about a node failure
    async fn handle_node_failure(
        &self,
        node_id: &str,
        error: &PipelineError,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> ErrorDecision;
}

/// The built-in decision table (see module docs)
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle_node_failure(
        &self,
        node_id: &str,
        error: &PipelineError,
        ctx: &PipelineContext,
        _cancel: &CancellationToken,
    ) -> ErrorDecision {
        let decision = match error {
            PipelineError::Cancelled => ErrorDecision::StopPipeline,
            PipelineError::PipeAlreadyConsumed => ErrorDecision::StopPipeline,
            PipelineError::CircuitBreakerOpen { .. } => ErrorDecision::FailNode,
            PipelineError::RetryExhausted { .. } => ErrorDecision::StopPipeline,
            e if e.is_transient() => ErrorDecision::RestartNode,
            PipelineError::NodeExecution { .. } => {
                if ctx.dead_letter().is_some() {
                    ErrorDecision::Continue
                } else {
                    ErrorDecision::FailNode
                }
            }
            _ => ErrorDecision::FailNode,
        };

        tracing::debug!(
            node = %node_id,
            error = %error,
            ?decision,
            "error handler decision"
        );
        decision
    }
}

/// Handler that always returns the same decision; useful in tests and for
/// pipelines with a blanket policy
#[derive(Debug, Clone, Copy)]
pub struct FixedDecisionHandler(pub ErrorDecision);

#[async_trait]
impl ErrorHandler for FixedDecisionHandler {
    async fn handle_node_failure(
        &self,
        _node_id: &str,
        _error: &PipelineError,
        _ctx: &PipelineContext,
        _cancel: &CancellationToken,
    ) -> ErrorDecision {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;

    async fn decide(error: PipelineError, options: RunOptions) -> ErrorDecision {
        let ctx = PipelineContext::new(options);
        let cancel = CancellationToken::new();
        DefaultErrorHandler
            .handle_node_failure("t", &error, &ctx, &cancel)
            .await
    }

    #[tokio::test]
    async fn test_transient_failures_restart() {
        let decision = decide(
            PipelineError::transient_io("t", "connection reset"),
            RunOptions::default(),
        )
        .await;
        assert_eq!(decision, ErrorDecision::RestartNode);
    }

    #[tokio::test]
    async fn test_data_failures_continue_with_dead_letter() {
        let decision = decide(
            PipelineError::node_execution("t", "malformed record"),
            RunOptions::default(),
        )
        .await;
        assert_eq!(decision, ErrorDecision::Continue);
    }

    #[tokio::test]
    async fn test_data_failures_fail_node_without_dead_letter() {
        let options = RunOptions::default().without_dead_letter();
        let decision = decide(PipelineError::node_execution("t", "malformed record"), options).await;
        assert_eq!(decision, ErrorDecision::FailNode);
    }

    #[tokio::test]
    async fn test_programming_errors_stop_pipeline() {
        let decision = decide(PipelineError::PipeAlreadyConsumed, RunOptions::default()).await;
        assert_eq!(decision, ErrorDecision::StopPipeline);
    }

    #[tokio::test]
    async fn test_breaker_open_fails_node() {
        let decision = decide(
            PipelineError::CircuitBreakerOpen {
                node: "t".to_string(),
            },
            RunOptions::default(),
        )
        .await;
        assert_eq!(decision, ErrorDecision::FailNode);
    }

    #[tokio::test]
    async fn test_retry_exhausted_stops_pipeline() {
        let decision = decide(
            PipelineError::RetryExhausted {
                node: "t".to_string(),
                attempts: 3,
                last_error: "boom".to_string(),
            },
            RunOptions::default(),
        )
        .await;
        assert_eq!(decision, ErrorDecision::StopPipeline);
    }
}
