//! Pipeline runner - orchestration of a single run
//!
//! [`PipelineRunner::run`] drives one execution of a built pipeline:
//!
//! 1. Freeze run options into a [`PipelineContext`]; instantiate every
//!    node through its factory and declare stateful nodes with the state
//!    registry.
//! 2. Topologically sort the graph (insertion order breaks ties).
//! 3. Walk the order: bind each node's inbound pipes (edge insertion
//!    order), execute its plan, and park one output pipe per outbound
//!    edge. Sinks are spawned as tasks and drive consumption; transforms
//!    only compose lazy streams, so the walk itself is fast.
//! 4. Await the sinks. The first fatal failure cancels the run; remaining
//!    sinks get the configured grace period (default 30 s) to observe the
//!    signal, after which they are reported as laggards and aborted.
//! 5. Dispose instances in reverse-topological order (disposal errors are
//!    logged, never rethrown), run breaker cleanup, and assemble the
//!    [`ExecutionResult`].
//!
//! The runner is single-threaded at the graph level; concurrency lives in
//! sink tasks and inside Parallel strategies. The result is always a
//! value, never an `Err`: failures are reported through
//! `ExecutionResult::errors` with the primary cause first and secondary
//! cancellations after it.

use crate::builder::Pipeline;
use crate::context::{PipelineContext, RunOptions};
use crate::error::PipelineError;
use crate::graph::NodeKind;
use crate::observer::ExecutionObserver;
use crate::plan::{AnyPipe, ErasedNode};
use crate::result::ExecutionResult;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;

/// Executes built pipelines; stateless, so one runner serves any number
/// of pipelines and runs
///
/// # Example
///
/// ```rust,ignore
/// let pipeline = builder.build()?;
/// let result = PipelineRunner::run(&pipeline).await;
/// assert!(result.success);
/// ```
pub struct PipelineRunner;

type SinkResult = crate::error::Result<Vec<AnyPipe>>;

impl PipelineRunner {
    /// Run with default [`RunOptions`]
    pub async fn run(pipeline: &Pipeline) -> ExecutionResult {
        Self::run_with(pipeline, RunOptions::default()).await
    }

    /// Run with explicit options
    pub async fn run_with(pipeline: &Pipeline, options: RunOptions) -> ExecutionResult {
        let started = Instant::now();
        let ctx = Arc::new(PipelineContext::new(options));
        let run_id = ctx.run_id();
        let graph = pipeline.graph();

        ctx.observer().pipeline_starting(run_id);
        tracing::info!(
            %run_id,
            nodes = graph.len(),
            edges = graph.edges().len(),
            "pipeline run starting"
        );

        let mut errors: Vec<PipelineError> = Vec::new();

        let order = match graph.topological_order() {
            Ok(order) => order,
            Err(e) => {
                return Self::finish(ctx, started, vec![e]).await;
            }
        };

        // Instantiate every node; no instance exists before this point.
        let mut instances: HashMap<String, Arc<dyn ErasedNode>> = HashMap::new();
        for node in graph.nodes() {
            ctx.stats().register(&node.id);
            if let Some(strategy) = node.stateful {
                ctx.state_registry().declare(&node.id, strategy).await;
            }
            if let Some(factory) = pipeline.factories.get(&node.id) {
                instances.insert(node.id.clone(), Arc::from(factory(Arc::clone(node))));
            }
        }

        // Walk the topological order, parking one pipe per edge.
        let mut edge_pipes: HashMap<(String, String), AnyPipe> = HashMap::new();
        let mut sink_tasks: Vec<(String, JoinHandle<SinkResult>)> = Vec::new();

        for id in &order {
            if !errors.is_empty() {
                break;
            }
            let Some(def) = graph.node(id) else { continue };
            let Some(instance) = instances.get(id) else {
                errors.push(PipelineError::configuration(format!(
                    "no execution plan registered for node '{}'",
                    id
                )));
                break;
            };

            let inbound = graph.inbound(id);
            let mut inputs = Vec::with_capacity(inbound.len());
            let mut missing_input = false;
            for edge in &inbound {
                match edge_pipes.remove(&edge_key(&edge.from, &edge.to)) {
                    Some(pipe) => inputs.push(pipe),
                    None => {
                        missing_input = true;
                        break;
                    }
                }
            }
            if missing_input {
                // An upstream node failed to produce this edge; its error
                // is already recorded.
                tracing::debug!(node = %id, "skipping node with missing inputs");
                continue;
            }

            if def.kind == NodeKind::Sink {
                let instance = Arc::clone(instance);
                let task_ctx = Arc::clone(&ctx);
                let task_cancel = ctx.cancellation().clone();
                let handle = tokio::spawn(async move {
                    instance.execute(inputs, 0, task_ctx, task_cancel).await
                });
                sink_tasks.push((id.clone(), handle));
                continue;
            }

            let fan_out = graph.out_degree(id);
            match instance
                .execute(inputs, fan_out, Arc::clone(&ctx), ctx.cancellation().clone())
                .await
            {
                Ok(outputs) => {
                    for (edge, pipe) in graph.outbound(id).iter().zip(outputs) {
                        edge_pipes.insert(edge_key(&edge.from, &edge.to), pipe);
                    }
                }
                Err(e) => {
                    tracing::error!(node = %id, error = %e, "node plan failed");
                    ctx.observer().node_failed(id, &e);
                    ctx.cancellation().cancel();
                    errors.push(e);
                }
            }
        }

        // Drive the sinks; the first fatal failure cancels the rest.
        for (id, mut handle) in sink_tasks {
            let joined = if errors.is_empty() {
                (&mut handle).await
            } else {
                match tokio::time::timeout(ctx.grace_period(), &mut handle).await {
                    Ok(joined) => joined,
                    Err(_) => {
                        handle.abort();
                        tracing::warn!(
                            node = %id,
                            grace_ms = ctx.grace_period().as_millis() as u64,
                            "sink did not observe cancellation within the grace period"
                        );
                        errors.push(PipelineError::pipeline_execution(format!(
                            "sink '{}' did not complete within the grace period",
                            id
                        )));
                        continue;
                    }
                }
            };

            match joined {
                Ok(Ok(_)) => {
                    ctx.observer().node_finished(&id, started.elapsed());
                }
                Ok(Err(e)) => {
                    tracing::error!(node = %id, error = %e, "sink failed");
                    ctx.observer().node_failed(&id, &e);
                    if errors.is_empty() {
                        ctx.cancellation().cancel();
                    }
                    errors.push(e);
                }
                Err(join_error) => {
                    let e = PipelineError::node_execution(
                        &id,
                        format!("sink task panicked: {}", join_error),
                    );
                    ctx.observer().node_failed(&id, &e);
                    if errors.is_empty() {
                        ctx.cancellation().cancel();
                    }
                    errors.push(e);
                }
            }
        }

        // Reverse-topological disposal; errors are captured, never fatal.
        for id in order.iter().rev() {
            if let Some(instance) = instances.get(id) {
                if let Err(e) = instance.dispose().await {
                    tracing::warn!(node = %id, error = %e, "node dispose failed");
                }
            }
        }
        ctx.breakers().cleanup();

        Self::finish(ctx, started, errors).await
    }

    async fn finish(
        ctx: Arc<PipelineContext>,
        started: Instant,
        mut errors: Vec<PipelineError>,
    ) -> ExecutionResult {
        for (id, _) in ctx.stats().snapshot() {
            ctx.stats().node_finished(&id);
        }

        // Primary cause first, secondary cancellations after it.
        errors.sort_by_key(|e| e.is_cancellation());

        let duration = started.elapsed();
        let success = errors.is_empty();
        if success {
            ctx.observer().pipeline_finished(ctx.run_id(), duration);
            tracing::info!(
                run_id = %ctx.run_id(),
                duration_ms = duration.as_millis() as u64,
                "pipeline run finished"
            );
        } else if let Some(primary) = errors.first() {
            ctx.observer().pipeline_failed(ctx.run_id(), primary);
            tracing::error!(
                run_id = %ctx.run_id(),
                error = %primary,
                secondary = errors.len() - 1,
                "pipeline run failed"
            );
        }

        ExecutionResult {
            success,
            errors,
            duration,
            node_stats: ctx.stats().snapshot(),
        }
    }
}

fn edge_key(from: &str, to: &str) -> (String, String) {
    (from.to_lowercase(), to.to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::PipelineBuilder;
    use crate::node::{CollectingSink, FnSource, FnTransform};

    #[tokio::test]
    async fn test_linear_run_collects_stats() {
        let sink = CollectingSink::<i64>::new();
        let collected = sink.clone();

        let mut builder = PipelineBuilder::new();
        builder
            .add_source("src", || FnSource::new(|| vec![1_i64, 2, 3]))
            .and_then(|b| b.add_transform("double", || FnTransform::new(|x: i64| Ok(x * 2))))
            .and_then(|b| b.add_sink("out", move || sink.clone()))
            .expect("registration");
        builder.connect("src", "double").connect("double", "out");

        let pipeline = builder.build().unwrap();
        let result = PipelineRunner::run(&pipeline).await;

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(collected.collected(), vec![2, 4, 6]);
        assert_eq!(result.stats_for("src").unwrap().items_out, 3);
        assert_eq!(result.stats_for("double").unwrap().items_in, 3);
        assert_eq!(result.stats_for("double").unwrap().items_out, 3);
        assert_eq!(result.stats_for("out").unwrap().items_in, 3);
    }

    #[tokio::test]
    async fn test_failure_produces_primary_error_first() {
        let mut builder = PipelineBuilder::new();
        builder
            .add_source("src", || FnSource::new(|| vec![1_i64]))
            .and_then(|b| {
                b.add_transform("boom", || {
                    FnTransform::new(|_: i64| -> crate::error::Result<i64> {
                        Err(PipelineError::node_execution("boom", "always fails"))
                    })
                })
            })
            .and_then(|b| b.add_sink("out", CollectingSink::<i64>::new))
            .expect("registration");
        builder.connect("src", "boom").connect("boom", "out");

        let pipeline = builder.build().unwrap();
        let options = RunOptions::default().without_dead_letter();
        let result = PipelineRunner::run_with(&pipeline, options).await;

        assert!(!result.success);
        let primary = result.primary_error().expect("primary error");
        assert!(!primary.is_cancellation());
        assert_eq!(primary.node_id(), Some("boom"));
    }
}
