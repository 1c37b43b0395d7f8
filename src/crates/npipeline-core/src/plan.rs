//! Execution plans - type-erased per-node delegates
//!
//! The builder knows each node's concrete element types; the runner does
//! not. The bridge is [`ErasedNode`]: a typed executor captured at
//! registration time that downcasts its input pipes, binds the node's
//! merge policy and execution strategy, and hands back type-erased output
//! pipes - one per outbound edge.
//!
//! ```text
//! builder (typed)                 runner (erased)
//! ───────────────                 ───────────────
//! add_transform::<TIn, TOut>  ─>  ErasedNodeFactory ─> Box<dyn ErasedNode>
//!                                       │ execute(inputs, fan_out, ctx)
//!                                       │   downcast -> merge -> strategy
//!                                       └─> Vec<AnyPipe> (one per edge)
//! ```
//!
//! Fan-out across multiple outbound edges clones items into bounded
//! per-branch channels, so a slow branch backpressures the producer
//! instead of buffering without limit.

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::graph::NodeDefinition;
use crate::handler::ErrorHandler;
use crate::lineage::{seed_stream, strip_stream, LineageMapper, Traced, TracedStream};
use crate::merge::{merge_streams, MergePolicy};
use crate::node::{CustomMerge, Sink, Source, Transform};
use crate::observer::ExecutionObserver;
use crate::pipe::{DataPipe, PipeItem};
use crate::retry::RetryPolicy;
use crate::strategy::parallel::run_parallel;
use crate::strategy::resilient::{run_resilient, TransformFactory};
use crate::strategy::sequential::run_sequential;
use crate::strategy::{attach_node, StrategyKind};
use async_trait::async_trait;
use futures::StreamExt;
use std::any::Any;
use std::sync::Arc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

/// A type-erased pipe moving between nodes
pub(crate) type AnyPipe = Box<dyn Any + Send>;

/// Per-run executable bound to one node instance
#[async_trait]
pub(crate) trait ErasedNode: Send + Sync {
    /// Bind inputs, run the node's strategy, and return one output pipe
    /// per outbound edge. Sinks drive consumption to completion and
    /// return nothing.
    async fn execute(
        &self,
        inputs: Vec<AnyPipe>,
        fan_out: usize,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<Vec<AnyPipe>>;

    /// Dispose the underlying node instance
    async fn dispose(&self) -> Result<()>;
}

/// Creates a fresh [`ErasedNode`] per run
pub(crate) type ErasedNodeFactory =
    Box<dyn Fn(Arc<NodeDefinition>) -> Box<dyn ErasedNode> + Send + Sync>;

fn downcast_inputs<T: PipeItem>(
    node_id: &str,
    inputs: Vec<AnyPipe>,
    cancel: &CancellationToken,
) -> Result<Vec<TracedStream<T>>> {
    inputs
        .into_iter()
        .map(|any| {
            let pipe = any.downcast::<DataPipe<Traced<T>>>().map_err(|_| {
                PipelineError::configuration(format!(
                    "input pipe for node '{}' carries an unexpected element type",
                    node_id
                ))
            })?;
            pipe.consume(cancel)
        })
        .collect()
}

/// Split one output stream into `fan_out` pipes, cloning items per branch
fn fan_out_stream<T: PipeItem>(
    mut stream: TracedStream<T>,
    fan_out: usize,
    cancel: &CancellationToken,
) -> Vec<AnyPipe> {
    if fan_out == 0 {
        return Vec::new();
    }
    if fan_out == 1 {
        return vec![Box::new(DataPipe::from_stream(stream)) as AnyPipe];
    }

    const BRANCH_BOUND: usize = 16;
    let mut senders = Vec::with_capacity(fan_out);
    let mut pipes: Vec<AnyPipe> = Vec::with_capacity(fan_out);
    for _ in 0..fan_out {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Traced<T>>>(BRANCH_BOUND);
        senders.push(Some(tx));
        pipes.push(Box::new(DataPipe::from_stream(ReceiverStream::new(rx))) as AnyPipe);
    }

    let pump_cancel = cancel.clone();
    tokio::spawn(async move {
        loop {
            let next = tokio::select! {
                biased;
                _ = pump_cancel.cancelled() => break,
                next = stream.next() => next,
            };
            let Some(item) = next else { break };

            let mut all_closed = true;
            for sender in senders.iter_mut() {
                let Some(tx) = sender else { continue };
                let payload = match &item {
                    Ok(traced) => Ok(traced.clone()),
                    Err(e) => Err(e.duplicate()),
                };
                if tx.send(payload).await.is_err() {
                    // Branch consumer is gone; stop feeding it.
                    *sender = None;
                } else {
                    all_closed = false;
                }
            }
            if all_closed {
                break;
            }
        }
    });

    pipes
}

/// Wrap a traced stream with per-item production accounting
fn count_produced<T: PipeItem>(
    stream: TracedStream<T>,
    node_id: String,
    ctx: Arc<PipelineContext>,
) -> TracedStream<T> {
    Box::pin(stream.map(move |item| {
        if item.is_ok() {
            ctx.stats().record_out(&node_id);
            ctx.observer().item_produced(&node_id);
        }
        item
    }))
}

/// Source plan: initialize, seed lineage, fan out
pub(crate) struct SourceExec<T: PipeItem> {
    node: Arc<dyn Source<T>>,
    def: Arc<NodeDefinition>,
}

impl<T: PipeItem> SourceExec<T> {
    /// Build the erased factory for a source registration
    pub(crate) fn factory<S, F>(user_factory: F) -> ErasedNodeFactory
    where
        S: Source<T>,
        F: Fn() -> S + Send + Sync + 'static,
    {
        Box::new(move |def| {
            Box::new(SourceExec {
                node: Arc::new(user_factory()) as Arc<dyn Source<T>>,
                def,
            })
        })
    }

    /// Initialize, retrying per the Resilient strategy when configured
    async fn initialize(
        &self,
        ctx: &Arc<PipelineContext>,
        cancel: &CancellationToken,
    ) -> Result<DataPipe<T>> {
        let StrategyKind::Resilient(opts) = &self.def.strategy else {
            return self.node.initialize(ctx, cancel).await;
        };

        let breaker = ctx.breakers().breaker_for(
            &self.def.id,
            self.def
                .circuit_breaker
                .as_ref()
                .unwrap_or_else(|| ctx.breaker_defaults()),
        )?;
        let policy = RetryPolicy::new(
            self.def
                .retry
                .clone()
                .unwrap_or_else(|| ctx.retry_defaults().clone()),
        );

        let mut attempt = 0u32;
        loop {
            match breaker.try_acquire() {
                Ok(Some((from, to))) => {
                    ctx.observer().breaker_transition(&self.def.id, from, to)
                }
                Ok(None) => {}
                Err(open) => return Err(open),
            }

            match self.node.initialize(ctx, cancel).await {
                Ok(pipe) => {
                    if let Some((from, to)) = breaker.record_success() {
                        ctx.observer().breaker_transition(&self.def.id, from, to);
                    }
                    return Ok(pipe);
                }
                Err(e @ PipelineError::Cancelled) => return Err(e),
                Err(e) => {
                    if let Some((from, to)) = breaker.record_failure() {
                        ctx.observer().breaker_transition(&self.def.id, from, to);
                    }
                    ctx.stats().record_failure(&self.def.id);
                    if attempt + 1 >= opts.max_node_restart_attempts {
                        return Err(PipelineError::MaxNodeRestartAttemptsExceeded {
                            node: self.def.id.clone(),
                            attempts: attempt + 1,
                        });
                    }
                    let delay = policy.delay_for(attempt);
                    ctx.stats().record_retry(&self.def.id);
                    ctx.observer()
                        .retry_scheduled(&self.def.id, attempt + 1, delay);
                    tracing::warn!(
                        node = %self.def.id,
                        attempt = attempt + 1,
                        error = %e,
                        "source initialization failed, retrying"
                    );
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[async_trait]
impl<T: PipeItem> ErasedNode for SourceExec<T> {
    async fn execute(
        &self,
        _inputs: Vec<AnyPipe>,
        fan_out: usize,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<Vec<AnyPipe>> {
        let _scope = ctx.enter_node(&self.def.id);
        ctx.observer().node_executing(&self.def.id);
        ctx.stats().node_started(&self.def.id);

        let pipe = self
            .initialize(&ctx, &cancel)
            .await
            .map_err(|e| attach_node(&self.def.id, e))?;
        let stream = pipe.consume(&cancel)?;
        let seeded = seed_stream(self.def.id.clone(), stream, ctx.lineage_options());
        let counted = count_produced(seeded, self.def.id.clone(), Arc::clone(&ctx));
        Ok(fan_out_stream(counted, fan_out, &cancel))
    }

    async fn dispose(&self) -> Result<()> {
        self.node.dispose().await
    }
}

/// Transform plan: downcast, merge, strategy, fan out
pub(crate) struct TransformExec<TIn: PipeItem, TOut: PipeItem> {
    node: Arc<dyn Transform<TIn, TOut>>,
    factory: TransformFactory<TIn, TOut>,
    merge: MergePolicy<TIn>,
    mapper: Option<LineageMapper>,
    handler: Option<Arc<dyn ErrorHandler>>,
    def: Arc<NodeDefinition>,
}

impl<TIn: PipeItem, TOut: PipeItem> TransformExec<TIn, TOut> {
    /// Build the erased factory for a transform registration
    pub(crate) fn factory<N, F>(
        user_factory: F,
        merge: MergePolicy<TIn>,
        mapper: Option<LineageMapper>,
        handler: Option<Arc<dyn ErrorHandler>>,
    ) -> ErasedNodeFactory
    where
        N: Transform<TIn, TOut>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        let user_factory = Arc::new(user_factory);
        Box::new(move |def| {
            let user_factory = Arc::clone(&user_factory);
            let factory: TransformFactory<TIn, TOut> =
                Arc::new(move || Arc::new(user_factory()) as Arc<dyn Transform<TIn, TOut>>);
            Box::new(TransformExec {
                node: factory(),
                factory,
                merge: merge.clone(),
                mapper: mapper.clone(),
                handler: handler.clone(),
                def,
            })
        })
    }
}

#[async_trait]
impl<TIn: PipeItem, TOut: PipeItem> ErasedNode for TransformExec<TIn, TOut> {
    async fn execute(
        &self,
        inputs: Vec<AnyPipe>,
        fan_out: usize,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<Vec<AnyPipe>> {
        let _scope = ctx.enter_node(&self.def.id);
        ctx.observer().node_executing(&self.def.id);
        ctx.stats().node_started(&self.def.id);

        if inputs.is_empty() {
            return Err(PipelineError::configuration(format!(
                "transform '{}' has no inbound pipes",
                self.def.id
            )));
        }
        let streams = downcast_inputs::<TIn>(&self.def.id, inputs, &cancel)?;
        let merged = merge_streams(&self.def.id, &self.merge, streams, Arc::clone(&ctx))?;

        let out: TracedStream<TOut> = match &self.def.strategy {
            StrategyKind::Sequential => {
                run_sequential(
                    Arc::clone(&self.node),
                    merged,
                    Arc::clone(&self.def),
                    self.mapper.clone(),
                    Arc::clone(&ctx),
                    cancel.clone(),
                )
                .await?
            }
            StrategyKind::Parallel(options) => run_parallel(
                Arc::clone(&self.node),
                merged,
                Arc::clone(&self.def),
                options.clone(),
                Arc::clone(&ctx),
                cancel.clone(),
            ),
            StrategyKind::Resilient(options) => {
                // Defer the restart loop (and its input materialization)
                // to the first pull, after every sink has been scheduled.
                let fut = run_resilient(
                    Arc::clone(&self.node),
                    Arc::clone(&self.factory),
                    merged,
                    Arc::clone(&self.def),
                    options.clone(),
                    self.mapper.clone(),
                    self.handler.clone(),
                    Arc::clone(&ctx),
                    cancel.clone(),
                );
                Box::pin(async_stream::stream! {
                    match fut.await {
                        Ok(mut inner) => {
                            while let Some(item) = inner.next().await {
                                yield item;
                            }
                        }
                        Err(e) => yield Err(e),
                    }
                })
            }
        };

        Ok(fan_out_stream(out, fan_out, &cancel))
    }

    async fn dispose(&self) -> Result<()> {
        self.node.dispose().await
    }
}

/// Custom-merge plan: strip lineage, delegate, re-seed
pub(crate) struct MergeNodeExec<T: PipeItem> {
    node: Arc<dyn CustomMerge<T>>,
    def: Arc<NodeDefinition>,
}

impl<T: PipeItem> MergeNodeExec<T> {
    /// Build the erased factory for a custom-merge registration
    pub(crate) fn factory<N, F>(user_factory: F) -> ErasedNodeFactory
    where
        N: CustomMerge<T>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        Box::new(move |def| {
            Box::new(MergeNodeExec {
                node: Arc::new(user_factory()) as Arc<dyn CustomMerge<T>>,
                def,
            })
        })
    }
}

#[async_trait]
impl<T: PipeItem> ErasedNode for MergeNodeExec<T> {
    async fn execute(
        &self,
        inputs: Vec<AnyPipe>,
        fan_out: usize,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<Vec<AnyPipe>> {
        let _scope = ctx.enter_node(&self.def.id);
        ctx.observer().node_executing(&self.def.id);
        ctx.stats().node_started(&self.def.id);

        let streams = downcast_inputs::<T>(&self.def.id, inputs, &cancel)?;
        let record_ctx = Arc::clone(&ctx);
        let record_id = self.def.id.clone();
        // The node's contract is item-typed, so inbound packets end here
        // and fresh packets are seeded on the merged output.
        let plain_pipes: Vec<DataPipe<T>> = streams
            .into_iter()
            .map(|s| {
                let record_ctx = Arc::clone(&record_ctx);
                let record_id = record_id.clone();
                DataPipe::from_stream(strip_stream(Box::pin(s.map(move |item| {
                    if item.is_ok() {
                        record_ctx.stats().record_in(&record_id);
                    }
                    item
                }))))
            })
            .collect();

        let out_pipe = Arc::clone(&self.node)
            .merge(plain_pipes, Arc::clone(&ctx), cancel.clone())
            .await
            .map_err(|e| attach_node(&self.def.id, e))?;
        let out = out_pipe.consume(&cancel)?;
        let seeded = seed_stream(self.def.id.clone(), out, ctx.lineage_options());
        let counted = count_produced(seeded, self.def.id.clone(), Arc::clone(&ctx));
        Ok(fan_out_stream(counted, fan_out, &cancel))
    }

    async fn dispose(&self) -> Result<()> {
        self.node.dispose().await
    }
}

/// Sink plan: merge, strip lineage, drive consumption to completion
pub(crate) struct SinkExec<T: PipeItem> {
    node: Arc<dyn Sink<T>>,
    merge: MergePolicy<T>,
    def: Arc<NodeDefinition>,
}

impl<T: PipeItem> SinkExec<T> {
    /// Build the erased factory for a sink registration
    pub(crate) fn factory<N, F>(user_factory: F, merge: MergePolicy<T>) -> ErasedNodeFactory
    where
        N: Sink<T>,
        F: Fn() -> N + Send + Sync + 'static,
    {
        Box::new(move |def| {
            Box::new(SinkExec {
                node: Arc::new(user_factory()) as Arc<dyn Sink<T>>,
                merge: merge.clone(),
                def,
            })
        })
    }
}

#[async_trait]
impl<T: PipeItem> ErasedNode for SinkExec<T> {
    async fn execute(
        &self,
        inputs: Vec<AnyPipe>,
        _fan_out: usize,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<Vec<AnyPipe>> {
        let _scope = ctx.enter_node(&self.def.id);
        ctx.observer().node_executing(&self.def.id);
        ctx.stats().node_started(&self.def.id);

        let streams = downcast_inputs::<T>(&self.def.id, inputs, &cancel)?;
        let merged = merge_streams(&self.def.id, &self.merge, streams, Arc::clone(&ctx))?;

        let record_ctx = Arc::clone(&ctx);
        let record_id = self.def.id.clone();
        let counted: TracedStream<T> = Box::pin(merged.map(move |item| {
            if item.is_ok() {
                record_ctx.stats().record_in(&record_id);
            }
            item
        }));

        self.node
            .consume(DataPipe::from_stream(strip_stream(counted)), &ctx, &cancel)
            .await
            .map_err(|e| attach_node(&self.def.id, e))?;
        Ok(Vec::new())
    }

    async fn dispose(&self) -> Result<()> {
        self.node.dispose().await
    }
}
