//! Integration tests for complete pipeline runs
//!
//! These tests verify that graph construction, validation, merging,
//! strategies, and the runner work together in realistic scenarios.

use async_trait::async_trait;
use npipeline_core::{
    CollectingSink, DataPipe, ExecutionObserver, FnSource, FnTransform, JoinConfig, MergePolicy,
    NodeOptions, ParallelOptions, PipelineBuilder, PipelineContext, PipelineError, PipelineRunner,
    Result, RunOptions, Source, StrategyKind,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Observer recording the order nodes start executing in
#[derive(Default)]
struct OrderObserver {
    order: Mutex<Vec<String>>,
}

impl ExecutionObserver for OrderObserver {
    fn node_executing(&self, node_id: &str) {
        self.order
            .lock()
            .expect("order lock")
            .push(node_id.to_string());
    }
}

#[tokio::test]
async fn test_linear_pipeline_delivers_doubled_items() {
    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("numbers", || FnSource::new(|| vec![1_i64, 2, 3]))
        .and_then(|b| b.add_transform("double", || FnTransform::new(|x: i64| Ok(x * 2))))
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder.connect("numbers", "double").connect("double", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert!(result.errors.is_empty());
    assert_eq!(collected.collected(), vec![2, 4, 6]);
}

#[tokio::test]
async fn test_parallel_unordered_transform_is_permutation() {
    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("numbers", || FnSource::new(|| vec![1_i64, 2, 3, 4, 5]))
        .and_then(|b| {
            b.add_transform_with(
                "times-ten",
                || FnTransform::new(|x: i64| Ok(x * 10)),
                NodeOptions::new().with_strategy(StrategyKind::Parallel(
                    ParallelOptions::new(4).with_preserve_order(false),
                )),
            )
        })
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder
        .connect("numbers", "times-ten")
        .connect("times-ten", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    let mut out = collected.collected();
    assert_eq!(out.len(), 5);
    out.sort();
    assert_eq!(out, vec![10, 20, 30, 40, 50]);
}

#[tokio::test]
async fn test_keyed_join_merges_matching_keys() {
    type Row = (i64, Vec<String>);

    let sink = CollectingSink::<Row>::new();
    let collected = sink.clone();

    let join = MergePolicy::KeyedJoin(JoinConfig::new(
        |row: &Row| row.0.to_string(),
        |members: Vec<Row>| {
            let key = members.first().map(|m| m.0).unwrap_or_default();
            let fields = members.into_iter().flat_map(|m| m.1).collect();
            (key, fields)
        },
    ));

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("left", || {
            FnSource::new(|| {
                vec![
                    (1_i64, vec!["a".to_string()]),
                    (2, vec!["b".to_string()]),
                ]
            })
        })
        .and_then(|b| {
            b.add_source("right", || {
                FnSource::new(|| {
                    vec![
                        (1_i64, vec!["x".to_string()]),
                        (2, vec!["y".to_string()]),
                    ]
                })
            })
        })
        .and_then(|b| {
            b.add_transform_with(
                "join",
                || FnTransform::new(|row: Row| Ok(row)),
                NodeOptions::new().with_merge(join),
            )
        })
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder
        .connect("left", "join")
        .connect("right", "join")
        .connect("join", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    let mut out = collected.collected();
    out.sort();
    assert_eq!(
        out,
        vec![
            (1, vec!["a".to_string(), "x".to_string()]),
            (2, vec!["b".to_string(), "y".to_string()]),
        ]
    );
}

#[tokio::test]
async fn test_validation_cycle_reports_canonical_path() {
    let mut builder = PipelineBuilder::new();
    builder
        .add_source("S", || FnSource::new(|| vec![1_i64]))
        .and_then(|b| b.add_transform("T1", || FnTransform::new(|x: i64| Ok(x))))
        .and_then(|b| b.add_transform("T2", || FnTransform::new(|x: i64| Ok(x))))
        .and_then(|b| b.add_sink("sink", CollectingSink::<i64>::new))
        .expect("registration");
    builder
        .connect("S", "T1")
        .connect("T1", "T2")
        .connect("T2", "T1")
        .connect("T2", "sink");

    let err = builder.build().expect_err("cycle must fail validation");
    let message = err.to_string();
    assert!(message.contains("Cycle detected"), "message: {}", message);
    assert!(message.contains("T1 -> T2 -> T1"), "message: {}", message);
}

#[tokio::test]
async fn test_execution_order_respects_edges() {
    let observer = Arc::new(OrderObserver::default());

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", || FnSource::new(|| vec![1_i64]))
        .and_then(|b| b.add_transform("a", || FnTransform::new(|x: i64| Ok(x))))
        .and_then(|b| b.add_transform("b", || FnTransform::new(|x: i64| Ok(x))))
        .and_then(|b| b.add_sink("sink", CollectingSink::<i64>::new))
        .expect("registration");
    builder
        .connect("src", "a")
        .connect("a", "b")
        .connect("b", "sink");

    let pipeline = builder.build().expect("build");
    let options = RunOptions::default().with_observer(observer.clone());
    let result = PipelineRunner::run_with(&pipeline, options).await;
    assert!(result.success);

    let order = observer.order.lock().expect("order lock").clone();
    for (from, to) in [("src", "a"), ("a", "b"), ("b", "sink")] {
        let from_at = order.iter().position(|n| n == from).expect("from seen");
        let to_at = order.iter().position(|n| n == to).expect("to seen");
        assert!(from_at < to_at, "{} must execute before {}", from, to);
    }
}

#[tokio::test]
async fn test_fan_out_delivers_to_every_branch() {
    let evens = CollectingSink::<i64>::new();
    let all = CollectingSink::<i64>::new();
    let evens_out = evens.clone();
    let all_out = all.clone();

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("numbers", || FnSource::new(|| vec![1_i64, 2, 3, 4]))
        .and_then(|b| {
            b.add_transform_with(
                "evens-only",
                || {
                    FnTransform::new(|x: i64| {
                        if x % 2 == 0 {
                            Ok(x)
                        } else {
                            Err(PipelineError::node_execution("evens-only", "odd"))
                        }
                    })
                },
                NodeOptions::new().with_continue_on_error(true),
            )
        })
        .and_then(|b| b.add_sink("evens", move || evens.clone()))
        .and_then(|b| b.add_sink("all", move || all.clone()))
        .expect("registration");
    builder
        .connect("numbers", "evens-only")
        .connect("numbers", "all")
        .connect("evens-only", "evens");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(evens_out.collected(), vec![2, 4]);
    assert_eq!(all_out.collected(), vec![1, 2, 3, 4]);
}

#[tokio::test]
async fn test_interleave_preserves_per_input_subsequences() {
    let sink = CollectingSink::<i64>::new();
    let collected = sink.clone();

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("small", || FnSource::new(|| vec![1_i64, 2, 3]))
        .and_then(|b| b.add_source("large", || FnSource::new(|| vec![100_i64, 200, 300])))
        .and_then(|b| b.add_transform("merge", || FnTransform::new(|x: i64| Ok(x))))
        .and_then(|b| b.add_sink("sink", move || sink.clone()))
        .expect("registration");
    builder
        .connect("small", "merge")
        .connect("large", "merge")
        .connect("merge", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;
    assert!(result.success, "errors: {:?}", result.errors);

    let out = collected.collected();
    assert_eq!(out.len(), 6);
    let small: Vec<i64> = out.iter().copied().filter(|v| *v < 100).collect();
    let large: Vec<i64> = out.iter().copied().filter(|v| *v >= 100).collect();
    assert_eq!(small, vec![1, 2, 3]);
    assert_eq!(large, vec![100, 200, 300]);
}

#[tokio::test]
async fn test_cancellation_propagates_to_producers() {
    /// Endless source; only cancellation can stop it.
    struct EndlessSource;

    #[async_trait]
    impl Source<i64> for EndlessSource {
        async fn initialize(
            &self,
            _ctx: &PipelineContext,
            _cancel: &CancellationToken,
        ) -> Result<DataPipe<i64>> {
            Ok(DataPipe::from_stream(futures::stream::unfold(
                0_i64,
                |n| async move {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                    Some((Ok(n), n + 1))
                },
            )))
        }
    }

    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("endless", || EndlessSource)
        .and_then(|b| b.add_sink("sink", CollectingSink::<i64>::new))
        .expect("registration");
    builder.connect("endless", "sink");

    let pipeline = builder.build().expect("build");
    let options = RunOptions::default()
        .with_cancellation(token)
        .with_grace_period(Duration::from_secs(2));

    let started = std::time::Instant::now();
    let result = PipelineRunner::run_with(&pipeline, options).await;

    assert!(!result.success);
    assert!(result
        .errors
        .iter()
        .any(|e| matches!(e, PipelineError::Cancelled)));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "run must return promptly after cancellation"
    );
}

#[tokio::test]
async fn test_disposal_runs_once_and_is_idempotent() {
    struct CountingSource {
        disposals: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Source<i64> for CountingSource {
        async fn initialize(
            &self,
            _ctx: &PipelineContext,
            _cancel: &CancellationToken,
        ) -> Result<DataPipe<i64>> {
            Ok(DataPipe::from_items(vec![1]))
        }

        async fn dispose(&self) -> Result<()> {
            self.disposals.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    let disposals = Arc::new(AtomicUsize::new(0));
    let for_factory = Arc::clone(&disposals);

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", move || CountingSource {
            disposals: Arc::clone(&for_factory),
        })
        .and_then(|b| b.add_sink("sink", CollectingSink::<i64>::new))
        .expect("registration");
    builder.connect("src", "sink");

    let pipeline = builder.build().expect("build");
    let result = PipelineRunner::run(&pipeline).await;
    assert!(result.success);
    assert_eq!(disposals.load(Ordering::SeqCst), 1);

    // Disposing a node twice is equivalent to once for stateless counters
    // guarded by the implementation; the contract requires idempotence.
    let node = CountingSource {
        disposals: Arc::new(AtomicUsize::new(0)),
    };
    node.dispose().await.expect("dispose");
    node.dispose().await.expect("dispose");
    // The trait contract is the interesting part: the runner calls once,
    // implementations must tolerate more.
}

#[tokio::test]
async fn test_pipe_is_single_consumer() {
    let pipe = DataPipe::from_items(vec![1_i64]);
    let cancel = CancellationToken::new();

    let first = pipe.consume(&cancel);
    assert!(first.is_ok());
    let second = pipe.consume(&cancel);
    assert!(second.is_err());
    assert!(matches!(
        second.err().expect("second consume"),
        PipelineError::PipeAlreadyConsumed
    ));
}

#[tokio::test]
async fn test_no_instances_created_for_invalid_graph() {
    let instantiated = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&instantiated);

    let mut builder = PipelineBuilder::new();
    builder
        .add_source("src", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            FnSource::new(|| vec![1_i64])
        })
        .expect("registration");
    // No sink, no edges: validation fails, so the factory must never run.

    assert!(builder.build().is_err());
    assert_eq!(instantiated.load(Ordering::SeqCst), 0);
}
