//! Benchmarks for pipeline execution overhead

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use npipeline_core::{
    BackoffKind, CollectingSink, FnSource, FnTransform, PipelineBuilder, PipelineRunner,
    RetryOptions, RetryPolicy,
};
use std::time::Duration;

fn bench_linear_pipeline(c: &mut Criterion) {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime");

    c.bench_function("linear_pipeline_1k_items", |b| {
        b.iter(|| {
            rt.block_on(async {
                let mut builder = PipelineBuilder::new();
                builder
                    .add_source("src", || FnSource::new(|| (0_i64..1000).collect()))
                    .and_then(|bldr| {
                        bldr.add_transform("double", || FnTransform::new(|x: i64| Ok(x * 2)))
                    })
                    .and_then(|bldr| bldr.add_sink("sink", CollectingSink::<i64>::new))
                    .expect("registration");
                builder.connect("src", "double").connect("double", "sink");

                let pipeline = builder.build().expect("build");
                let result = PipelineRunner::run(&pipeline).await;
                assert!(result.success);
                black_box(result)
            })
        });
    });
}

fn bench_retry_delay_computation(c: &mut Criterion) {
    let policy = RetryPolicy::new(
        RetryOptions::new(u32::MAX)
            .with_base(Duration::from_millis(10))
            .with_max(Duration::from_secs(60))
            .with_backoff(BackoffKind::Exponential { multiplier: 2.0 }),
    );

    c.bench_function("exponential_delay_64_attempts", |b| {
        b.iter(|| {
            for attempt in 0..64 {
                black_box(policy.delay_for(black_box(attempt)));
            }
        });
    });
}

criterion_group!(benches, bench_linear_pipeline, bench_retry_delay_computation);
criterion_main!(benches);
