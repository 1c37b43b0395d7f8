//! Sequential strategy - pull-based, one item at a time
//!
//! The default strategy. Per-item transforms are driven in lock-step:
//! pull one input, call `transform_item`, emit one output. Backpressure is
//! inherent - nothing runs until the downstream consumer pulls.
//!
//! Stream-based transforms (`is_stream_based() == true`) are driven
//! through `transform_stream` instead; their input packets are tapped as
//! the node consumes items and re-attached to the output by the lineage
//! mapping strategy selected for the node.
//!
//! Item failures under `continue_on_error` are dead-lettered and the
//! stream moves on; otherwise the first failure ends the stream.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::graph::NodeDefinition;
use crate::lineage::{adapt_stream_output, advance_packet, LineageMapper, PacketTap, Traced, TracedStream};
use crate::node::Transform;
use crate::observer::ExecutionObserver;
use crate::pipe::{BoxItemStream, DataPipe, PipeItem};
use crate::strategy::attach_node;
use futures::StreamExt;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Drive a transform sequentially over its merged input
pub(crate) async fn run_sequential<TIn: PipeItem, TOut: PipeItem>(
    node: Arc<dyn Transform<TIn, TOut>>,
    input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    mapper: Option<LineageMapper>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> Result<TracedStream<TOut>> {
    if node.is_stream_based() {
        stream_path(node, input, def, mapper, ctx, cancel).await
    } else {
        Ok(per_item_stream(node, input, def, ctx, cancel))
    }
}

/// Lock-step per-item path: one input in, one output out
fn per_item_stream<TIn: PipeItem, TOut: PipeItem>(
    node: Arc<dyn Transform<TIn, TOut>>,
    mut input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> TracedStream<TOut> {
    Box::pin(async_stream::stream! {
        let node_id = def.id.clone();
        while let Some(next) = input.next().await {
            match next {
                Ok(Traced { value, packet }) => {
                    ctx.stats().record_in(&node_id);
                    let dead_letter_copy = if def.continue_on_error {
                        Some(value.clone())
                    } else {
                        None
                    };

                    match node.transform_item(value, &ctx, &cancel).await {
                        Ok(out) => {
                            let packet = advance_packet(packet, &node_id, ctx.lineage_options());
                            ctx.stats().record_out(&node_id);
                            ctx.observer().item_produced(&node_id);
                            yield Ok(Traced { value: out, packet });
                        }
                        Err(e @ PipelineError::Cancelled) => {
                            yield Err(e);
                            break;
                        }
                        Err(e) => {
                            ctx.stats().record_failure(&node_id);
                            if let (Some(item), Some(dead_letter)) =
                                (dead_letter_copy, ctx.dead_letter())
                            {
                                if let Err(fatal) = dead_letter.push(&node_id, item, &e).await {
                                    yield Err(fatal);
                                    break;
                                }
                                ctx.observer().item_dropped(&node_id, "dead-lettered");
                                continue;
                            }
                            yield Err(attach_node(&node_id, e));
                            break;
                        }
                    }
                }
                Err(e) => {
                    yield Err(e);
                    break;
                }
            }
        }
    })
}

/// Whole-stream path: tap input packets, run `transform_stream`, re-attach
/// lineage per the node's mapping strategy
async fn stream_path<TIn: PipeItem, TOut: PipeItem>(
    node: Arc<dyn Transform<TIn, TOut>>,
    input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    mapper: Option<LineageMapper>,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> Result<TracedStream<TOut>> {
    let node_id = def.id.clone();
    let tap: PacketTap = Arc::new(Mutex::new(VecDeque::new()));

    let tap_in = Arc::clone(&tap);
    let stats_ctx = Arc::clone(&ctx);
    let stats_id = node_id.clone();
    let plain: BoxItemStream<TIn> = Box::pin(input.map(move |item| {
        item.map(|traced| {
            stats_ctx.stats().record_in(&stats_id);
            tap_in
                .lock()
                .expect("lineage tap poisoned")
                .push_back(traced.packet);
            traced.value
        })
    }));

    let out_pipe = node
        .transform_stream(DataPipe::from_stream(plain), Arc::clone(&ctx), cancel.clone())
        .await
        .map_err(|e| attach_node(&node_id, e))?;
    let outputs = out_pipe.consume(&cancel)?;

    let adapted = adapt_stream_output(
        node_id.clone(),
        outputs,
        tap,
        def.cardinality,
        mapper,
        ctx.lineage_options().clone(),
    );

    let produced_ctx = ctx;
    Ok(Box::pin(adapted.map(move |item| {
        if item.is_ok() {
            produced_ctx.stats().record_out(&node_id);
            produced_ctx.observer().item_produced(&node_id);
        }
        item
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;
    use crate::graph::{NodeDefinition, NodeKind};
    use crate::node::FnTransform;
    use async_trait::async_trait;
    use futures::stream;

    fn definition(continue_on_error: bool) -> Arc<NodeDefinition> {
        Arc::new(NodeDefinition::new("double", NodeKind::Transform).with_continue_on_error(continue_on_error))
    }

    fn traced_input<T: PipeItem>(items: Vec<T>) -> TracedStream<T> {
        Box::pin(stream::iter(
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

    #[tokio::test]
    async fn test_per_item_transform_maps_in_order() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let node = Arc::new(FnTransform::new(|x: i64| Ok(x * 2)));

        let out = run_sequential(
            node as Arc<dyn Transform<i64, i64>>,
            traced_input(vec![1, 2, 3]),
            definition(false),
            None,
            Arc::clone(&ctx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(drain(out).await.unwrap(), vec![2, 4, 6]);
        let stats = ctx.stats().snapshot();
        assert_eq!(stats["double"].items_in, 3);
        assert_eq!(stats["double"].items_out, 3);
    }

    #[tokio::test]
    async fn test_failure_without_continue_stops_stream() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let node = Arc::new(FnTransform::new(|x: i64| {
            if x == 2 {
                Err(PipelineError::node_execution("double", "bad item"))
            } else {
                Ok(x)
            }
        }));

        let out = run_sequential(
            node as Arc<dyn Transform<i64, i64>>,
            traced_input(vec![1, 2, 3]),
            definition(false),
            None,
            ctx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let err = drain(out).await.unwrap_err();
        assert!(matches!(err, PipelineError::NodeExecution { .. }));
    }

    #[tokio::test]
    async fn test_failure_with_continue_dead_letters_item() {
        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let node = Arc::new(FnTransform::new(|x: i64| {
            if x == 2 {
                Err(PipelineError::node_execution("double", "bad item"))
            } else {
                Ok(x * 10)
            }
        }));

        let out = run_sequential(
            node as Arc<dyn Transform<i64, i64>>,
            traced_input(vec![1, 2, 3]),
            definition(true),
            None,
            Arc::clone(&ctx),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(drain(out).await.unwrap(), vec![10, 30]);
        let dead_letter = ctx.dead_letter().unwrap();
        assert_eq!(dead_letter.count_for("double"), 1);
        assert_eq!(dead_letter.take_entries()[0].item_as::<i64>(), Some(&2));
    }

    #[tokio::test]
    async fn test_stream_based_transform_runs_whole_stream() {
        struct RunningSum;

        #[async_trait]
        impl Transform<i64, i64> for RunningSum {
            fn is_stream_based(&self) -> bool {
                true
            }

            async fn transform_stream(
                self: Arc<Self>,
                input: DataPipe<i64>,
                _ctx: Arc<PipelineContext>,
                cancel: CancellationToken,
            ) -> Result<DataPipe<i64>> {
                let mut stream = input.consume(&cancel)?;
                Ok(DataPipe::from_stream(async_stream::stream! {
                    let mut sum = 0;
                    while let Some(item) = stream.next().await {
                        match item {
                            Ok(v) => {
                                sum += v;
                                yield Ok(sum);
                            }
                            Err(e) => {
                                yield Err(e);
                                break;
                            }
                        }
                    }
                }))
            }
        }

        let ctx = Arc::new(PipelineContext::new(RunOptions::default()));
        let out = run_sequential(
            Arc::new(RunningSum) as Arc<dyn Transform<i64, i64>>,
            traced_input(vec![1, 2, 3]),
            definition(false),
            None,
            ctx,
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(drain(out).await.unwrap(), vec![1, 3, 6]);
    }
}
