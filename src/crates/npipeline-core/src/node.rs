//! Node contracts - the four capability interfaces of a pipeline
//!
//! Every graph vertex implements exactly one of these traits, selected by
//! its [`NodeKind`](crate::graph::NodeKind):
//!
//! | Trait | Role | Produces |
//! |-------|------|----------|
//! | [`Source`] | origin of items | one output pipe |
//! | [`Transform`] | item or stream mapping | one output pipe |
//! | [`Sink`] | terminal consumer | nothing |
//! | [`CustomMerge`] | user-defined fan-in | one output pipe |
//!
//! There is no inheritance and no base node: capability interfaces plus a
//! tagged kind on the definition replace a class hierarchy.
//!
//! # Per-Item vs. Whole-Stream Transforms
//!
//! [`Transform`] offers two entry points:
//!
//! - [`Transform::transform_item`] - the common case. The Sequential and
//!   Parallel strategies drive it one item at a time; lineage stays in
//!   lock-step automatically.
//! - [`Transform::transform_stream`] - for nodes that need cross-item
//!   state (windowing, dedup, aggregation). Override it **and**
//!   [`Transform::is_stream_based`] so the runtime routes the node through
//!   the whole-stream path.
//!
//! Implement at least one of the two; the default `transform_item` reports
//! a configuration error and the default `transform_stream` maps
//! `transform_item` over the stream.
//!
//! # Instances and Lifecycles
//!
//! Node instances are created per run by the factory registered with the
//! builder, shared as `Arc<dyn …>`, and disposed in reverse-topological
//! order at end of run. Methods take `&self`: a node that needs mutable
//! state owns it behind interior mutability (the Parallel strategy calls
//! `transform_item` from several workers at once).
//!
//! # Closure Adapters
//!
//! [`FnSource`], [`FnTransform`], and [`FnSink`] lift plain functions into
//! the traits for quick pipelines and tests; [`CollectingSink`] gathers
//! everything it consumes for assertions.
//!
//! ```rust
//! use npipeline_core::node::{FnTransform, Transform};
//!
//! // x -> 2x as a transform node
//! let doubler = FnTransform::new(|x: i64| Ok(x * 2));
//! let _: &dyn Transform<i64, i64> = &doubler;
//! ```

use crate::context::PipelineContext;
use crate::error::{PipelineError, Result};
use crate::pipe::{DataPipe, PipeItem};
use async_trait::async_trait;
use futures::StreamExt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Origin of a stream of items
///
/// `initialize` may be called repeatedly across restarts; progress should
/// be carried through the state registry
/// ([`PipelineContext::state_registry`]), e.g. checkpoint offsets.
#[async_trait]
pub trait Source<T: PipeItem>: Send + Sync + 'static {
    /// Produce the output pipe. Items must be produced lazily.
    async fn initialize(
        &self,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<DataPipe<T>>;

    /// Release resources. Must be idempotent.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Item or stream mapping between two pipes
#[async_trait]
pub trait Transform<TIn: PipeItem, TOut: PipeItem>: Send + Sync + 'static {
    /// Map a single item. The common case; invoked by the Sequential and
    /// Parallel strategies.
    async fn transform_item(
        &self,
        item: TIn,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<TOut> {
        let _ = (item, ctx, cancel);
        Err(PipelineError::configuration(
            "transform_item is not implemented; stream-based nodes must override \
             transform_stream and is_stream_based",
        ))
    }

    /// Whether this node overrides [`Transform::transform_stream`]
    ///
    /// Stream-based nodes are driven through the whole-stream path even
    /// when their declared cardinality is one-to-one.
    fn is_stream_based(&self) -> bool {
        false
    }

    /// Map the whole input stream. Override for cross-item state; the
    /// default maps [`Transform::transform_item`] over the stream,
    /// stopping at the first upstream error.
    async fn transform_stream(
        self: Arc<Self>,
        input: DataPipe<TIn>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<DataPipe<TOut>> {
        let stream = input.consume(&cancel)?;
        let node = self;
        Ok(DataPipe::from_stream(async_stream::stream! {
            let mut stream = stream;
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => yield node.transform_item(value, &ctx, &cancel).await,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }))
    }

    /// Release resources. Must be idempotent.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Terminal consumer of a pipe
///
/// Sinks produce no output pipe. A sink consuming acknowledgable messages
/// (see [`Acknowledgable`]) owns acknowledgement: ack each item after it is
/// durably handled, before requesting the next.
#[async_trait]
pub trait Sink<T: PipeItem>: Send + Sync + 'static {
    /// Drive the input pipe to completion
    async fn consume(
        &self,
        input: DataPipe<T>,
        ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Release resources. Must be idempotent.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// User-defined fan-in of several pipes into one
///
/// Used when a node selects `MergeType::Custom`; the runtime hands it the
/// inbound pipes in edge insertion order.
#[async_trait]
pub trait CustomMerge<T: PipeItem>: Send + Sync + 'static {
    /// Combine the inbound pipes into a single output pipe
    async fn merge(
        self: Arc<Self>,
        inputs: Vec<DataPipe<T>>,
        ctx: Arc<PipelineContext>,
        cancel: CancellationToken,
    ) -> Result<DataPipe<T>>;

    /// Release resources. Must be idempotent.
    async fn dispose(&self) -> Result<()> {
        Ok(())
    }
}

/// Contract for at-least-once message integrations
///
/// Items that expose acknowledgement implement this; the consuming sink
/// calls [`Acknowledgable::acknowledge`] after successful downstream
/// processing and [`Acknowledgable::nack`] on failure. The core never
/// acks on a node's behalf.
#[async_trait]
pub trait Acknowledgable: Send {
    /// Confirm the message was processed
    async fn acknowledge(&self, cancel: &CancellationToken) -> Result<()>;

    /// Reject the message with a reason
    async fn nack(&self, reason: &str, cancel: &CancellationToken) -> Result<()>;
}

/// [`Source`] over a plain function producing an in-memory batch
pub struct FnSource<T, F> {
    f: F,
    _marker: PhantomData<fn() -> T>,
}

impl<T, F> FnSource<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> Source<T> for FnSource<T, F>
where
    T: PipeItem,
    F: Fn() -> Vec<T> + Send + Sync + 'static,
{
    async fn initialize(
        &self,
        _ctx: &PipelineContext,
        _cancel: &CancellationToken,
    ) -> Result<DataPipe<T>> {
        Ok(DataPipe::from_items((self.f)()))
    }
}

/// [`Transform`] over a plain per-item function
pub struct FnTransform<TIn, TOut, F> {
    f: F,
    _marker: PhantomData<fn(TIn) -> TOut>,
}

impl<TIn, TOut, F> FnTransform<TIn, TOut, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<TIn, TOut, F> Transform<TIn, TOut> for FnTransform<TIn, TOut, F>
where
    TIn: PipeItem,
    TOut: PipeItem,
    F: Fn(TIn) -> Result<TOut> + Send + Sync + 'static,
{
    async fn transform_item(
        &self,
        item: TIn,
        _ctx: &PipelineContext,
        _cancel: &CancellationToken,
    ) -> Result<TOut> {
        (self.f)(item)
    }
}

/// [`Sink`] over a plain per-item function
pub struct FnSink<T, F> {
    f: F,
    _marker: PhantomData<fn(T)>,
}

impl<T, F> FnSink<T, F> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T, F> Sink<T> for FnSink<T, F>
where
    T: PipeItem,
    F: Fn(T) -> Result<()> + Send + Sync + 'static,
{
    async fn consume(
        &self,
        input: DataPipe<T>,
        _ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = input.consume(cancel)?;
        while let Some(item) = stream.next().await {
            (self.f)(item?)?;
        }
        Ok(())
    }
}

/// Sink that gathers everything it consumes, for tests and debugging
///
/// # Example
///
/// ```rust,ignore
/// let sink = CollectingSink::new();
/// let collected = sink.handle();
/// builder.add_sink("collect", move || sink.clone())?;
/// // ... run the pipeline ...
/// assert_eq!(*collected.lock().unwrap(), vec![2, 4, 6]);
/// ```
pub struct CollectingSink<T> {
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectingSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared handle to the collected items
    pub fn handle(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

impl<T: Clone> CollectingSink<T> {
    /// Snapshot of the items collected so far
    pub fn collected(&self) -> Vec<T> {
        self.items.lock().expect("collector lock poisoned").clone()
    }
}

impl<T> Clone for CollectingSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
        }
    }
}

impl<T> Default for CollectingSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: PipeItem> Sink<T> for CollectingSink<T> {
    async fn consume(
        &self,
        input: DataPipe<T>,
        _ctx: &PipelineContext,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut stream = input.consume(cancel)?;
        while let Some(item) = stream.next().await {
            self.items
                .lock()
                .expect("collector lock poisoned")
                .push(item?);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::RunOptions;

    fn test_ctx() -> Arc<PipelineContext> {
        Arc::new(PipelineContext::new(RunOptions::default()))
    }

    #[tokio::test]
    async fn test_fn_source_produces_items() {
        let source = FnSource::new(|| vec![1, 2, 3]);
        let ctx = test_ctx();
        let cancel = CancellationToken::new();

        let pipe = source.initialize(&ctx, &cancel).await.unwrap();
        assert_eq!(pipe.collect(&cancel).await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_fn_transform_maps_items() {
        let transform = FnTransform::new(|x: i64| Ok(x * 10));
        let ctx = test_ctx();
        let cancel = CancellationToken::new();

        let out = transform.transform_item(4, &ctx, &cancel).await.unwrap();
        assert_eq!(out, 40);
    }

    #[tokio::test]
    async fn test_default_transform_stream_maps_per_item() {
        let transform = Arc::new(FnTransform::new(|x: i64| Ok(x + 1)));
        let ctx = test_ctx();
        let cancel = CancellationToken::new();

        let input = DataPipe::from_items(vec![1, 2, 3]);
        let out = transform
            .transform_stream(input, Arc::clone(&ctx), cancel.clone())
            .await
            .unwrap();
        assert_eq!(out.collect(&cancel).await.unwrap(), vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn test_default_transform_item_is_configuration_error() {
        struct StreamOnly;

        #[async_trait]
        impl Transform<i64, i64> for StreamOnly {
            fn is_stream_based(&self) -> bool {
                true
            }

            async fn transform_stream(
                self: Arc<Self>,
                input: DataPipe<i64>,
                _ctx: Arc<PipelineContext>,
                cancel: CancellationToken,
            ) -> Result<DataPipe<i64>> {
                let items = input.collect(&cancel).await?;
                Ok(DataPipe::from_items(items))
            }
        }

        let node = StreamOnly;
        let ctx = test_ctx();
        let cancel = CancellationToken::new();
        let err = node.transform_item(1, &ctx, &cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_collecting_sink_gathers_items() {
        let sink = CollectingSink::new();
        let ctx = test_ctx();
        let cancel = CancellationToken::new();

        sink.consume(DataPipe::from_items(vec!["x", "y"]), &ctx, &cancel)
            .await
            .unwrap();
        assert_eq!(sink.collected(), vec!["x", "y"]);
    }

    #[tokio::test]
    async fn test_fn_sink_propagates_errors() {
        let sink = FnSink::new(|x: i64| {
            if x > 1 {
                Err(PipelineError::node_execution("sink", "too big"))
            } else {
                Ok(())
            }
        });
        let ctx = test_ctx();
        let cancel = CancellationToken::new();

        let err = sink
            .consume(DataPipe::from_items(vec![1, 2]), &ctx, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::NodeExecution { .. }));
    }
}
