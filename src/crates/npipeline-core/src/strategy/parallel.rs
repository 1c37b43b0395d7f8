//! Parallel strategy - worker pool over bounded channels
//!
//! Fan-out/fan-in around a per-item transform:
//!
//! ```text
//!              ┌> worker 1 ┐
//!  dispatcher ─┼> worker 2 ┼─> collector ─> output stream
//!  (seq tags)  └> worker N ┘   (reorder when preserve_order)
//! ```
//!
//! - The dispatcher tags items with a sequence number and feeds a bounded
//!   channel (`input_bound`); workers share the receiver.
//! - Each worker calls `transform_item`, retrying up to `item_retries`
//!   times with delays from the node's retry policy.
//! - The collector emits results from a bounded channel (`output_bound`).
//!   With `preserve_order = false` outputs appear in completion order;
//!   with `true` a reordering buffer emits them in input order, so one
//!   slow item stalls the items behind it.
//!
//! A worker failure past its retry budget either dead-letters the item and
//! continues (`continue_on_error`) or cancels the sibling workers and
//! fails the stream. Item retries never escalate into node restarts; the
//! Resilient wrapper keeps its own budget.

use crate::context::PipelineContext;
use crate::error::PipelineError;
use crate::graph::NodeDefinition;
use crate::lineage::{advance_packet, Traced, TracedStream};
use crate::node::Transform;
use crate::observer::ExecutionObserver;
use crate::pipe::PipeItem;
use crate::retry::RetryPolicy;
use crate::strategy::attach_node;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Tuning for the worker pool
#[derive(Debug, Clone, PartialEq)]
pub struct ParallelOptions {
    /// Worker count; defaults to `min(8, available_parallelism)`
    pub degree_of_parallelism: usize,
    /// Dispatcher-to-worker channel bound; defaults to the worker count
    pub input_bound: usize,
    /// Worker-to-collector channel bound; defaults to the worker count
    pub output_bound: usize,
    /// Emit in input order (buffers up to `output_bound` items)
    pub preserve_order: bool,
    /// Per-item retry budget before the failure policy applies
    pub item_retries: u32,
}

impl ParallelOptions {
    pub fn new(degree_of_parallelism: usize) -> Self {
        Self {
            degree_of_parallelism,
            input_bound: degree_of_parallelism,
            output_bound: degree_of_parallelism,
            preserve_order: false,
            item_retries: 0,
        }
    }

    pub fn with_input_bound(mut self, bound: usize) -> Self {
        self.input_bound = bound;
        self
    }

    pub fn with_output_bound(mut self, bound: usize) -> Self {
        self.output_bound = bound;
        self
    }

    pub fn with_preserve_order(mut self, preserve: bool) -> Self {
        self.preserve_order = preserve;
        self
    }

    pub fn with_item_retries(mut self, retries: u32) -> Self {
        self.item_retries = retries;
        self
    }

    /// Check the bounds are usable
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.degree_of_parallelism == 0 {
            return Err(PipelineError::configuration(
                "parallel degree of parallelism must be at least 1",
            ));
        }
        if self.input_bound == 0 || self.output_bound == 0 {
            return Err(PipelineError::configuration(
                "parallel channel bounds must be at least 1",
            ));
        }
        Ok(())
    }
}

impl Default for ParallelOptions {
    fn default() -> Self {
        let dop = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(8);
        Self::new(dop)
    }
}

enum Envelope<TIn, TOut> {
    /// Item transformed successfully
    Done(u64, Traced<TOut>),
    /// Item failed past its retry budget
    Failed(u64, Traced<TIn>, PipelineError),
    /// The input stream itself failed
    Upstream(PipelineError),
}

/// Drive a transform through the worker pool
pub(crate) fn run_parallel<TIn: PipeItem, TOut: PipeItem>(
    node: Arc<dyn Transform<TIn, TOut>>,
    mut input: TracedStream<TIn>,
    def: Arc<NodeDefinition>,
    opts: ParallelOptions,
    ctx: Arc<PipelineContext>,
    cancel: CancellationToken,
) -> TracedStream<TOut> {
    let node_id = def.id.clone();
    let retry = Arc::new(RetryPolicy::new(
        def.retry
            .clone()
            .unwrap_or_else(|| ctx.retry_defaults().clone()),
    ));

    // Dropping the output stream cancels the pool through this guard.
    let pool_cancel = cancel.child_token();
    let guard = pool_cancel.clone().drop_guard();

    let (in_tx, in_rx) = mpsc::channel::<(u64, Traced<TIn>)>(opts.input_bound);
    let in_rx = Arc::new(tokio::sync::Mutex::new(in_rx));
    let (out_tx, mut out_rx) = mpsc::channel::<Envelope<TIn, TOut>>(opts.output_bound);

    // Dispatcher: tag and feed.
    {
        let ctx = Arc::clone(&ctx);
        let node_id = node_id.clone();
        let out_tx = out_tx.clone();
        let pool_cancel = pool_cancel.clone();
        tokio::spawn(async move {
            let mut seq = 0u64;
            loop {
                let next = tokio::select! {
                    biased;
                    _ = pool_cancel.cancelled() => break,
                    next = input.next() => next,
                };
                match next {
                    Some(Ok(traced)) => {
                        ctx.stats().record_in(&node_id);
                        if in_tx.send((seq, traced)).await.is_err() {
                            break;
                        }
                        seq += 1;
                    }
                    Some(Err(e)) => {
                        let _ = out_tx.send(Envelope::Upstream(e)).await;
                        break;
                    }
                    None => break,
                }
            }
        });
    }

    // Workers: transform with per-item retries.
    for _ in 0..opts.degree_of_parallelism {
        let node = Arc::clone(&node);
        let ctx = Arc::clone(&ctx);
        let node_id = node_id.clone();
        let in_rx = Arc::clone(&in_rx);
        let out_tx = out_tx.clone();
        let retry = Arc::clone(&retry);
        let pool_cancel = pool_cancel.clone();
        let item_retries = opts.item_retries;

        tokio::spawn(async move {
            loop {
                let next = tokio::select! {
                    biased;
                    _ = pool_cancel.cancelled() => break,
                    next = async { in_rx.lock().await.recv().await } => next,
                };
                let Some((seq, traced)) = next else { break };

                let outcome = transform_with_retries(
                    node.as_ref(),
                    &traced,
                    item_retries,
                    &retry,
                    &node_id,
                    &ctx,
                    &pool_cancel,
                )
                .await;

                let envelope = match outcome {
                    Ok(out_value) => {
                        let packet = advance_packet(
                            traced.packet,
                            &node_id,
                            ctx.lineage_options(),
                        );
                        Envelope::Done(
                            seq,
                            Traced {
                                value: out_value,
                                packet,
                            },
                        )
                    }
                    Err(e @ PipelineError::Cancelled) => Envelope::Upstream(e),
                    Err(e) => Envelope::Failed(seq, traced, e),
                };
                if out_tx.send(envelope).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(out_tx);

    // Collector: the output stream itself.
    let continue_on_error = def.continue_on_error;
    let preserve_order = opts.preserve_order;
    Box::pin(async_stream::stream! {
        // Keeps the pool alive exactly as long as this stream.
        let _guard = guard;

        let mut pending: BTreeMap<u64, Option<Traced<TOut>>> = BTreeMap::new();
        let mut next_seq = 0u64;

        while let Some(envelope) = out_rx.recv().await {
            match envelope {
                Envelope::Done(seq, item) => {
                    ctx.stats().record_out(&node_id);
                    ctx.observer().item_produced(&node_id);
                    if preserve_order {
                        pending.insert(seq, Some(item));
                        while let Some(slot) = pending.remove(&next_seq) {
                            next_seq += 1;
                            if let Some(item) = slot {
                                yield Ok(item);
                            }
                        }
                    } else {
                        yield Ok(item);
                    }
                }
                Envelope::Failed(seq, traced, e) => {
                    ctx.stats().record_failure(&node_id);
                    if continue_on_error {
                        if let Some(dead_letter) = ctx.dead_letter() {
                            if let Err(fatal) =
                                dead_letter.push(&node_id, traced.value, &e).await
                            {
                                yield Err(fatal);
                                return;
                            }
                            ctx.observer().item_dropped(&node_id, "dead-lettered");
                            if preserve_order {
                                pending.insert(seq, None);
                                while let Some(slot) = pending.remove(&next_seq) {
                                    next_seq += 1;
                                    if let Some(item) = slot {
                                        yield Ok(item);
                                    }
                                }
                            }
                            continue;
                        }
                    }
                    yield Err(attach_node(&node_id, e));
                    return;
                }
                Envelope::Upstream(e) => {
                    yield Err(e);
                    return;
                }
            }
        }

        // Flush any ordered tail.
        for (_, slot) in pending {
            if let Some(item) = slot {
                yield Ok(item);
            }
        }
    })
}

async fn transform_with_retries<TIn: PipeItem, TOut: PipeItem>(
    node: &dyn Transform<TIn, TOut>,
    traced: &Traced<TIn>,
    item_retries: u32,
    retry: &RetryPolicy,
    node_id: &str,
    ctx: &Arc<PipelineContext>,
    cancel: &CancellationToken,
) -> crate::error::Result<TOut> {
    let mut attempt = 0u32;
    loop {
        match node
            .transform_item(traced.value.clone(), ctx, cancel)
            .await
        {
            Ok(out) => return Ok(out),
            Err(e @ PipelineError::Cancelled) => return Err(e),
            Err(e) if attempt < item_retries => {
                let delay = retry.delay_for(attempt);
                tracing::debug!(
                    node = %node_id,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "item failed, retrying after delay"
                );
                ctx.stats().record_retry(node_id);
                ctx.observer().retry_scheduled(node_id, attempt + 1, delay);
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => {
                if item_retries > 0 {
                    return Err(PipelineError::RetryExhausted {
                        node: node_id.to_string(),
                        attempts: attempt + 1,
                        last_error: e.to_string(),
                    });
                }
                return Err(e);
            }
        }
    }
}
