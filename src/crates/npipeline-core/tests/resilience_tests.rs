//! Integration tests for the failure machinery: restarts, circuit
//! breaking, dead-lettering, and checkpointed re-initialization.

use async_trait::async_trait;
use npipeline_core::{
    BackoffKind, CheckpointStrategy, CircuitBreakerManager, CircuitBreakerManagerOptions,
    CircuitBreakerOptions, CircuitState, CollectingSink, DataPipe, FnSource, FnTransform,
    JitterKind, NodeOptions, PipelineBuilder, PipelineContext, PipelineError, PipelineRunner,
    ResilientOptions, Result, RetryOptions, RunOptions, Source, StrategyKind, Transform,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Transform that fails its first `failures` attempts, then succeeds.
struct FlakyTransform {
    failures_left: Arc<AtomicU32>,
}

#[async_trait]
impl Transform<i64, i64> for FlakyTransform {
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
        Ok(item)
    }
}

fn exponential_10ms() -> RetryOptions {
    RetryOptions::new(8)
        .with_base(Duration::from_millis(10))
        .with_max(Duration::from_secs(1))
        .with_backoff(BackoffKind::Exponential { multiplier: 2.0 })
        .with_jitter(JitterKind::None)
}

#[tokio::test]
async fn test_resilient_transform_recovers_with_backoff() {
    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();
    let failures = Arc::new(AtomicU32::new(2));
    let for_factory = Arc::clone(&failures);

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", || FnSource::new(|| vec![1_i64]))
        .and_then(|b| {
            b.add_transform_with(
                "flaky",
                move || FlakyTransform {
                    failures_left: Arc::clone(&for_factory),
                },
                NodeOptions::new()
                    .with_strategy(StrategyKind::Resilient(ResilientOptions::new(3)))
                    .with_retry(exponential_10ms()),
            )
        })
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder.connect("src", "flaky").connect("flaky", "sink");

    let pipeline = builder.build().expect("build");
    let started = Instant::now();
    let result = PipelineRunner::run(&pipeline).await;
    let elapsed = started.elapsed();

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(collected.collected(), vec![1]);
    // Two restarts: 10ms + 20ms of backoff at minimum.
    assert!(
        elapsed >= Duration::from_millis(30),
        "expected backoff delays, finished in {:?}",
        elapsed
    );
    assert!(
        elapsed <= Duration::from_millis(500),
        "backoff should not balloon, took {:?}",
        elapsed
    );
    assert_eq!(result.stats_for("flaky").unwrap().retries, 2);
}

#[tokio::test]
async fn test_breaker_opens_after_threshold_then_half_opens() {
    let manager = Arc::new(CircuitBreakerManager::new(
        CircuitBreakerManagerOptions::default(),
    ));
    let breaker_options = CircuitBreakerOptions::consecutive(3)
        .with_open_duration(Duration::from_millis(200));

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", || FnSource::new(|| (1_i64..=10).collect()))
        .and_then(|b| {
            b.add_transform_with(
                "always-fails",
                || {
                    FnTransform::new(|_: i64| -> Result<i64> {
                        Err(PipelineError::transient_io("always-fails", "down"))
                    })
                },
                NodeOptions::new()
                    .with_strategy(StrategyKind::Resilient(ResilientOptions::new(10)))
                    .with_retry(
                        RetryOptions::new(16)
                            .with_base(Duration::from_millis(1))
                            .with_backoff(BackoffKind::Fixed),
                    )
                    .with_circuit_breaker(breaker_options.clone()),
            )
        })
        .and_then(|b| b.add_sink("sink", CollectingSink::<i64>::new))
        .expect("registration");
    builder
        .connect("src", "always-fails")
        .connect("always-fails", "sink");

    let pipeline = builder.build().expect("build");
    let options = RunOptions::default()
        .with_breaker_manager(Arc::clone(&manager))
        .without_dead_letter();
    let result = PipelineRunner::run_with(&pipeline, options).await;

    // Three attempts trip the breaker; the fourth is rejected outright.
    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, PipelineError::CircuitBreakerOpen { .. })));
    assert_eq!(manager.state_of("always-fails"), Some(CircuitState::Open));

    // After the open window, the next consultation admits a probe.
    tokio::time::sleep(Duration::from_millis(250)).await;
    let breaker = manager
        .breaker_for("always-fails", &breaker_options)
        .expect("breaker");
    let transition = breaker.try_acquire().expect("probe admitted");
    assert_eq!(
        transition,
        Some((CircuitState::Open, CircuitState::HalfOpen))
    );
    assert_eq!(breaker.state(), CircuitState::HalfOpen);
}

#[tokio::test]
async fn test_dead_letter_bound_fails_pipeline() {
    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", || FnSource::new(|| (1_i64..=5).collect()))
        .and_then(|b| {
            b.add_transform_with(
                "reject-all",
                || {
                    FnTransform::new(|_: i64| -> Result<i64> {
                        Err(PipelineError::node_execution("reject-all", "bad record"))
                    })
                },
                NodeOptions::new().with_continue_on_error(true),
            )
        })
        .and_then(|b| b.add_sink("sink", CollectingSink::<i64>::new))
        .expect("registration");
    builder
        .connect("src", "reject-all")
        .connect("reject-all", "sink");

    let pipeline = builder.build().expect("build");
    let options = RunOptions::default().with_dead_letter_capacity(2);
    let result = PipelineRunner::run_with(&pipeline, options).await;

    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, PipelineError::DeadLetterOverflow { capacity: 2 })));
}

#[tokio::test]
async fn test_continue_on_error_keeps_pipeline_alive() {
    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", || FnSource::new(|| (1_i64..=6).collect()))
        .and_then(|b| {
            b.add_transform_with(
                "drop-evens",
                || {
                    FnTransform::new(|x: i64| {
                        if x % 2 == 0 {
                            Err(PipelineError::node_execution("drop-evens", "even"))
                        } else {
                            Ok(x)
                        }
                    })
                },
                NodeOptions::new().with_continue_on_error(true),
            )
        })
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder
        .connect("src", "drop-evens")
        .connect("drop-evens", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(collected.collected(), vec![1, 3, 5]);
    assert_eq!(result.stats_for("drop-evens").unwrap().failures, 3);
}

#[tokio::test]
async fn test_stateful_source_resumes_from_checkpoint() {
    /// Source that fails its first initialization, then resumes from the
    /// offset it checkpointed before failing.
    struct CheckpointedSource {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Source<i64> for CheckpointedSource {
        async fn initialize(
            &self,
            ctx: &PipelineContext,
            _cancel: &CancellationToken,
        ) -> Result<DataPipe<i64>> {
            let registry = ctx.state_registry();
            let offset: u64 = registry.load("reader").await?.unwrap_or(0);

            if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                // Progress to offset 2, then die mid-initialization.
                registry.save("reader", &2_u64).await?;
                return Err(PipelineError::transient_io("reader", "stream reset"));
            }

            let items: Vec<i64> = (offset as i64..5).collect();
            Ok(DataPipe::from_items(items))
        }
    }

    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();
    let attempts = Arc::new(AtomicU32::new(0));
    let for_factory = Arc::clone(&attempts);

    let mut builder = PipelineBuilder::new();
    builder
        .add_source_with(
            "reader",
            move || CheckpointedSource {
                attempts: Arc::clone(&for_factory),
            },
            NodeOptions::new()
                .with_stateful(CheckpointStrategy::Offset)
                .with_strategy(StrategyKind::Resilient(ResilientOptions::new(3)))
                .with_retry(
                    RetryOptions::new(4)
                        .with_base(Duration::from_millis(1))
                        .with_backoff(BackoffKind::Fixed),
                ),
        )
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder.connect("reader", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    // Restart resumed from the checkpointed offset, not from zero.
    assert_eq!(collected.collected(), vec![2, 3, 4]);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_item_retries_and_restarts_are_independent() {
    // Per-item retries inside Parallel absorb two failures; the node
    // itself never restarts.
    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();
    let failures = Arc::new(AtomicU32::new(2));
    let for_factory = Arc::clone(&failures);

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", || FnSource::new(|| vec![7_i64]))
        .and_then(|b| {
            b.add_transform_with(
                "flaky",
                move || FlakyTransform {
                    failures_left: Arc::clone(&for_factory),
                },
                NodeOptions::new()
                    .with_strategy(StrategyKind::Resilient(
                        ResilientOptions::new(2).with_inner(StrategyKind::Parallel(
                            npipeline_core::ParallelOptions::new(2).with_item_retries(3),
                        )),
                    ))
                    .with_retry(
                        RetryOptions::new(8)
                            .with_base(Duration::from_millis(1))
                            .with_backoff(BackoffKind::Fixed),
                    ),
            )
        })
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder.connect("src", "flaky").connect("flaky", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(collected.collected(), vec![7]);
    // Item retries recovered the item inside a single node attempt.
    assert_eq!(result.stats_for("flaky").unwrap().retries, 2);
}
