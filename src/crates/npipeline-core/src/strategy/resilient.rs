//! Resilient strategy - restarts, retry delays, and circuit breaking
//!
//! Wraps Sequential or Parallel execution of a transform with the full
//! failure machinery. Per attempt:
//!
//! ```text
//! Start -> Running -> Success (breaker Closed / HalfOpen->Closed)
//!              \-> Failure -> consult error handler
//!                     |- Continue      -> return partial output
//!                     |- FailNode      -> node execution error
//!                     |- RestartNode   -> delay; re-init; attempt n+1 (until the budget)
//!                     \- StopPipeline  -> cancel the run
//! ```
//!
//! - The node's circuit breaker is consulted **before** each attempt; an
//!   open breaker fails fast with `CircuitBreakerOpen` and never consumes
//!   a restart.
//! - Restart needs replayable input, so the merged input is materialized
//!   up to `max_materialized_items`. Longer inputs disable restart with a
//!   diagnostic and run a single breaker-monitored attempt instead.
//! - Partial output of a failed attempt is dropped; only a `Continue`
//!   decision surfaces it.
//! - Restarted attempts run against a **fresh node instance** from the
//!   factory; the failed instance is disposed best-effort.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::graph::NodeDefinition;
use crate::handler::{ErrorDecision, ErrorHandler};
use crate::lineage::{LineageMapper, Traced, TracedStream};
use crate::node::Transform;
use crate::observer::ExecutionObserver;
use crate::pipe::PipeItem;
use crate::retry::RetryPolicy;
use crate::strategy::parallel::run_parallel;
use crate::strategy::sequential::run_sequential;
use crate::strategy::{attach_node, StrategyKind};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Tuning for the resilient wrapper
#[derive(Debug, Clone, PartialEq)]
pub struct ResilientOptions {
    /// The strategy actually driving the node; never Resilient itself
    pub inner: Box<StrategyKind>,
    /// Restart budget (total attempts, including the first)
    pub max_node_restart_attempts: u32,
    /// Input items buffered for replay before restart is disabled
    pub max_materialized_items: usize,
}

impl ResilientOptions {
    pub fn new(max_node_restart_attempts: u32) -> Self {
        Self {
            max_node_restart_attempts,
            ..Self::default()
        }
    }

    /// Set the inner strategy
    pub fn with_inner(mut self, inner: StrategyKind) -> Self {
        self.inner = Box::new(inner);
        self
    }

    /// Set the input replay budget
    pub fn with_max_materialized_items(mut self, max: usize) -> Self {
        self.max_materialized_items = max;
        self
    }
}

impl Default for ResilientOptions {
    fn default() -> Self {
        Self {
            inner: Box::new(StrategyKind::Sequential),
            max_node_restart_attempts: 3,
            max_materialized_items: 10_000,
        }
    }
}

/// Node factory used to re-initialize across restarts
pub(crate) type TransformFactory<TIn, TOut> =
    Arc<dyn Fn() -> Arc<dyn Transform<TIn, TOut>> + Send + Sync>;

/// Drive a transform with restart, retry delays, and circuit breaking
#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_resilient<TIn: PipeItem, TOut: PipeItem>(
    primary: Arc<dyn Transform<TIn, TOut>>,
    factory: TransformFactory<TIn, TOut>,
    mut input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    opts: ResilientOptions,
    mapper: Option<LineageMapper>,
    handler_override: Option<Arc<dyn ErrorHandler>>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> Result<TracedStream<TOut>> {
    let node_id = def.id.clone();
    let breaker = ctx.breakers().breaker_for(
        &node_id,
        def.circuit_breaker
            .as_ref()
            .unwrap_or_else(|| ctx.breaker_defaults()),
    )?;
    let policy = RetryPolicy::new(
        def.retry
            .clone()
            .unwrap_or_else(|| ctx.retry_defaults().clone()),
    );

    // Restart needs replayable input; buffer it within budget.
    let mut buffered: Vec<Traced<TIn>> = Vec::new();
    let mut unbounded = false;
    while let Some(item) = input.next().await {
        match item {
            Ok(traced) => {
                buffered.push(traced);
                if buffered.len() > opts.max_materialized_items {
                    unbounded = true;
                    break;
                }
            }
            Err(e) => return Err(e),
        }
    }

    if unbounded {
        tracing::warn!(
            node = %node_id,
            budget = opts.max_materialized_items,
            "input exceeds the materialization budget; node restart disabled"
        );
        match breaker.try_acquire() {
            Ok(Some((from, to))) => ctx.observer().breaker_transition(&node_id, from, to),
            Ok(None) => {}
            Err(open) => return Err(open),
        }
        let remaining: TracedStream<TIn> = Box::pin(
            futures::stream::iter(buffered.into_iter().map(Ok)).chain(input),
        );
        let out = dispatch_inner(
            Arc::clone(&primary),
            remaining,
            Arc::clone(&def),
            &opts.inner,
            mapper,
            Arc::clone(&ctx),
            cancel.clone(),
        )
        .await?;
        return Ok(monitor_single_attempt(out, breaker, ctx, node_id));
    }

    let mut attempt = 0u32;
    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        match breaker.try_acquire() {
            Ok(Some((from, to))) => ctx.observer().breaker_transition(&node_id, from, to),
            Ok(None) => {}
            // Fails the node without consuming a restart.
            Err(open) => return Err(open),
        }

        let node = if attempt == 0 {
            Arc::clone(&primary)
        } else {
            factory()
        };
        let attempt_input: TracedStream<TIn> = Box::pin(futures::stream::iter(
            buffered.clone().into_iter().map(Ok),
        ));

        tracing::debug!(
            node = %node_id,
            attempt = attempt + 1,
            max_attempts = opts.max_node_restart_attempts,
            strategy = opts.inner.name(),
            "executing node attempt"
        );

        let outcome = run_attempt(
            Arc::clone(&node),
            attempt_input,
            Arc::clone(&def),
            &opts.inner,
            mapper.clone(),
            Arc::clone(&ctx),
            cancel.clone(),
        )
        .await;

        if attempt > 0 {
            // Restarted instances are scoped to their attempt.
            if let Err(e) = node.dispose().await {
                tracing::warn!(node = %node_id, error = %e, "attempt instance dispose failed");
            }
        }

        match outcome {
            Ok(outputs) => {
                if let Some((from, to)) = breaker.record_success() {
                    ctx.observer().breaker_transition(&node_id, from, to);
                }
                if attempt > 0 {
                    tracing::info!(
                        node = %node_id,
                        attempts = attempt + 1,
                        "node succeeded after restart"
                    );
                }
                return Ok(Box::pin(futures::stream::iter(outputs.into_iter().map(Ok))));
            }
            Err((_, e)) if e.is_cancellation() => return Err(e),
            Err((partial, e)) => {
                if let Some((from, to)) = breaker.record_failure() {
                    ctx.observer().breaker_transition(&node_id, from, to);
                    tracing::warn!(
                        node = %node_id,
                        error = %PipelineError::CircuitBreakerTripped { node: node_id.clone() },
                        "failure threshold reached"
                    );
                }
                ctx.stats().record_failure(&node_id);

                let handler = handler_override
                    .clone()
                    .unwrap_or_else(|| Arc::clone(ctx.error_handler()));
                let mut decision = handler
                    .handle_node_failure(&node_id, &e, &ctx, &cancel)
                    .await;
                if matches!(e, PipelineError::RetryExhausted { .. })
                    && def.continue_on_error
                    && decision == ErrorDecision::StopPipeline
                {
                    decision = ErrorDecision::Continue;
                }

                match decision {
                    ErrorDecision::Continue => {
                        tracing::info!(
                            node = %node_id,
                            kept = partial.len(),
                            error = %e,
                            "continuing with partial output"
                        );
                        return Ok(Box::pin(futures::stream::iter(
                            partial.into_iter().map(Ok),
                        )));
                    }
                    ErrorDecision::FailNode => return Err(attach_node(&node_id, e)),
                    ErrorDecision::RestartNode => {
                        if attempt + 1 >= opts.max_node_restart_attempts {
                            return Err(PipelineError::MaxNodeRestartAttemptsExceeded {
                                node: node_id.clone(),
                                attempts: attempt + 1,
                            });
                        }
                        let delay = policy.delay_for(attempt);
                        ctx.stats().record_retry(&node_id);
                        ctx.observer().retry_scheduled(&node_id, attempt + 1, delay);
                        tracing::warn!(
                            node = %node_id,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "node failed, restarting after delay"
                        );
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                            _ = tokio::time::sleep(delay) => {}
                        }
                        attempt += 1;
                    }
                    ErrorDecision::StopPipeline => {
                        ctx.cancellation().cancel();
                        return Err(PipelineError::pipeline_execution(format!(
                            "stopped by error handler after failure at node '{}': {}",
                            node_id, e
                        )));
                    }
                }
            }
        }
    }
}

/// One attempt: run the inner strategy and collect its output, returning
/// partial output alongside the error on failure
async fn run_attempt<TIn: PipeItem, TOut: PipeItem>(
    node: Arc<dyn Transform<TIn, TOut>>,
    input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    inner: &StrategyKind,
    mapper: Option<LineageMapper>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> std::result::Result<Vec<Traced<TOut>>, (Vec<Traced<TOut>>, PipelineError)> {
    let mut stream = dispatch_inner(node, input, def, inner, mapper, ctx, cancel)
        .await
        .map_err(|e| (Vec::new(), e))?;

    let mut outputs = Vec::new();
    while let Some(item) = stream.next().await {
        match item {
            Ok(traced) => outputs.push(traced),
            // Partial output of a failed attempt is dropped by the caller
            // unless the handler decides Continue.
            Err(e) => return Err((outputs, e)),
        }
    }
    Ok(outputs)
}

async fn dispatch_inner<TIn: PipeItem, TOut: PipeItem>(
    node: Arc<dyn Transform<TIn, TOut>>,
    input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    inner: &StrategyKind,
    mapper: Option<LineageMapper>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> Result<TracedStream<TOut>> {
    match inner {
        StrategyKind::Sequential => {
            run_sequential(node, input, def, mapper, ctx, cancel).await
        }
        StrategyKind::Parallel(options) => Ok(run_parallel(
            node,
            input,
            def,
            options.clone(),
            ctx,
            cancel,
        )),
        StrategyKind::Resilient(_) => Err(PipelineError::configuration(
            "resilient strategies cannot nest",
        )),
    }
}

/// Track the outcome of an unbounded single attempt in the breaker
fn monitor_single_attempt<TOut: PipeItem>(
    mut inner: TracedStream<TOut>,
    breaker: Arc<crate::breaker::CircuitBreaker>,
    ctx: Arc<PipelineContext>,
    node_id: String,
) -> TracedStream<TOut> {
    Box::pin(async_stream::stream! {
        let mut failed = false;
        while let Some(item) = inner.next().await {
            if let Err(e) = &item {
                if !e.is_cancellation() {
                    failed = true;
                    if let Some((from, to)) = breaker.record_failure() {
                        ctx.observer().breaker_transition(&node_id, from, to);
                    }
                }
            }
            yield item;
        }
        if !failed {
            if let Some((from, to)) = breaker.record_success() {
                ctx.observer().breaker_transition(&node_id, from, to);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::{CircuitBreakerOptions, CircuitState};
    use crate::context::RunOptions;
    use crate::graph::NodeKind;
    use crate::node::FnTransform;
    use crate::retry::{BackoffKind, RetryOptions};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn traced_input<T: PipeItem>(items: Vec<T>) -> TracedStream<T> {
        Box::pin(futures::stream::iter(
            items.into_iter().map(|v| Ok(Traced::bare(v))),
        ))
    }

    async fn drain<T: PipeItem>(mut s: TracedStream<T>) -> Result<Vec<T>> {
        let mut out = Vec::new();
        while let Some(item) = s.next().await {
            out.push(item?.value);
        }
        Ok(out)
    }

    fn fast_retry() -> RetryOptions {
        RetryOptions::new(8)
            .with_base(Duration::from_millis(1))
            .with_backoff(BackoffKind::Fixed)
    }

    /// Fails the whole stream a fixed number of times, then works.
    struct FlakyNode {
        failures_left: Arc<AtomicU32>,
    }

    #[async_trait::async_trait]
    impl Transform<i64, i64> for FlakyNode {
        async fn transform_item(
            &self,
            item: i64,
            _ctx: &PipelineContext,
            _cancel: &CancellationToken,
        ) -> Result<i64> {
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(PipelineError::transient_io("flaky", "transient outage"));
            }
            Ok(item * 2)
        }
    }

    fn flaky_factory(failures: u32) -> (Arc<dyn Transform<i64, i64>>, TransformFactory<i64, i64>) {
        let counter = Arc::new(AtomicU32::new(failures));
        let primary = Arc::new(FlakyNode {
            failures_left: Arc::clone(&counter),
        });
        let factory: TransformFactory<i64, i64> = Arc::new(move || {
            Arc::new(FlakyNode {
                failures_left: Arc::clone(&counter),
            })
        });
        (primary, factory)
    }

    #[tokio::test]
    async fn test_restart_recovers_after_transient_failures() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let (primary, factory) = flaky_factory(2);
        let def = Arc::new(
            NodeDefinition::new("flaky", NodeKind::Transform).with_retry(fast_retry()),
        );

        let out = run_resilient(
            primary,
            factory,
            traced_input(vec![5]),
            def,
            ResilientOptions::new(3),
            None,
            None,
            Arc::clone(&ctx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(drain(out).await.unwrap(), vec![10]);
        assert_eq!(ctx.stats().snapshot()["flaky"].retries, 2);
    }

    #[tokio::test]
    async fn test_restart_budget_exhausts() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let (primary, factory) = flaky_factory(u32::MAX);
        let def = Arc::new(
            NodeDefinition::new("flaky", NodeKind::Transform).with_retry(fast_retry()),
        );

        let err = match run_resilient(
            primary,
            factory,
            traced_input(vec![5]),
            def,
            ResilientOptions::new(2),
            None,
            None,
            ctx,
            CancellationToken::new(),
        )
        .await
        {
            Ok(out) => drain(out).await.unwrap_err(),
            Err(e) => e,
        };

        assert!(matches!(
            err,
            PipelineError::MaxNodeRestartAttemptsExceeded { attempts: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_open_breaker_fails_fast() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let options = CircuitBreakerOptions::consecutive(1)
            .with_open_duration(Duration::from_secs(3600));
        let breaker = ctx.breakers().breaker_for("flaky", &options).unwrap();
        breaker.record_failure();
        assert_eq!(breaker.state(), CircuitState::Open);

        let (primary, factory) = flaky_factory(0);
        let def = Arc::new(
            NodeDefinition::new("flaky", NodeKind::Transform)
                .with_retry(fast_retry())
                .with_circuit_breaker(options),
        );

        let result = run_resilient(
            primary,
            factory,
            traced_input(vec![1]),
            def,
            ResilientOptions::new(3),
            None,
            None,
            ctx,
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(matches!(
            result.err().expect("circuit breaker error"),
            PipelineError::CircuitBreakerOpen { .. }
        ));
    }

    #[tokio::test]
    async fn test_stop_pipeline_decision_cancels_run() {
        use crate::handler::FixedDecisionHandler;

        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let (primary, factory) = flaky_factory(u32::MAX);
        let def = Arc::new(
            NodeDefinition::new("flaky", NodeKind::Transform).with_retry(fast_retry()),
        );

        let result = run_resilient(
            primary,
            factory,
            traced_input(vec![1]),
            def,
            ResilientOptions::new(3),
            None,
            Some(Arc::new(FixedDecisionHandler(ErrorDecision::StopPipeline))),
            Arc::clone(&ctx),
            CancellationToken::new(),
        )
        .await;

        assert!(result.is_err());
        assert!(matches!(
            result.err().expect("stop pipeline error"),
            PipelineError::PipelineExecution(_)
        ));
        assert!(ctx.cancellation().is_cancelled());
    }

    #[tokio::test]
    async fn test_unbounded_input_disables_restart() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let node = Arc::new(FnTransform::new(|x: i64| Ok(x + 1)));
        let primary = node as Arc<dyn Transform<i64, i64>>;
        let factory: TransformFactory<i64, i64> =
            Arc::new(|| Arc::new(FnTransform::new(|x: i64| Ok(x + 1))));
        let def = Arc::new(
            NodeDefinition::new("big", NodeKind::Transform).with_retry(fast_retry()),
        );

        let out = run_resilient(
            primary,
            factory,
            traced_input((0..100).collect()),
            def,
            ResilientOptions::new(3).with_max_materialized_items(10),
            None,
            None,
            ctx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        // Everything still flows through the single streaming attempt.
        assert_eq!(drain(out).await.unwrap().len(), 100);
    }
}
