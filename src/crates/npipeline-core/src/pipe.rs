//! Data pipes - lazy, cancellable, single-consumer item streams
//!
//! A [`DataPipe`] is the edge currency of the pipeline: every node receives
//! its input as a pipe and (except sinks) produces its output as one. Pipes
//! are **pull-based** — nothing upstream runs until a consumer asks for the
//! next item — which makes backpressure inherent and keeps memory bounded.
//!
//! # Pipe Kinds
//!
//! | Kind | Constructor | Replayable | Use case |
//! |------|-------------|------------|----------|
//! | List pipe | [`DataPipe::from_items`] | yes (bounded, in memory) | test fixtures, materialized restarts |
//! | Streaming pipe | [`DataPipe::from_stream`] | no (one-shot) | connectors, transform outputs |
//!
//! # Single-Consumer Contract
//!
//! A pipe may be consumed **at most once**. The second call to
//! [`DataPipe::consume`] returns [`PipelineError::PipeAlreadyConsumed`] —
//! always a programming error, never a recoverable condition. Fan-out
//! across multiple downstream nodes is the runner's job, not the pipe's.
//!
//! # Cancellation
//!
//! `consume` binds the returned stream to a [`CancellationToken`]. Once the
//! token fires, the stream yields a single `Err(Cancelled)` and terminates;
//! dropping the stream releases the upstream producer either way.
//!
//! # Examples
//!
//! ```rust
//! use npipeline_core::pipe::DataPipe;
//! use futures::StreamExt;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pipe = DataPipe::from_items(vec![1, 2, 3]);
//!     let cancel = CancellationToken::new();
//!
//!     let mut stream = pipe.consume(&cancel)?;
//!     let mut doubled = Vec::new();
//!     while let Some(item) = stream.next().await {
//!         doubled.push(item? * 2);
//!     }
//!     assert_eq!(doubled, vec![2, 4, 6]);
//!
//!     // Pipes are single-consumer.
//!     assert!(pipe.consume(&cancel).is_err());
//!     Ok(())
//! }
//! ```

use crate::error::{PipelineError, Result};
use futures::stream::Stream;
use futures::StreamExt;
use std::fmt::Debug;
use std::pin::Pin;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Bound on every item type flowing through a pipe
///
/// - `Clone` lets the runner duplicate items across fan-out edges and hand
///   failed items to the dead-letter sink without stealing them from the
///   stream.
/// - `Debug` gives dead-letter entries and diagnostics a readable rendering.
///
/// Blanket-implemented; never implement it manually.
pub trait PipeItem: Clone + Debug + Send + Sync + 'static {}

impl<T: Clone + Debug + Send + Sync + 'static> PipeItem for T {}

/// Boxed item stream produced by consuming a pipe
pub type BoxItemStream<T> = Pin<Box<dyn Stream<Item = Result<T>> + Send>>;

enum PipeSource<T> {
    List(Vec<T>),
    Stream(BoxItemStream<T>),
}

/// Lazy, cancellable, single-consumer sequence of `T`
///
/// See the [module docs](self) for the contract.
pub struct DataPipe<T> {
    source: Mutex<Option<PipeSource<T>>>,
    materialized: bool,
}

impl<T: PipeItem> DataPipe<T> {
    /// Materialized pipe over an in-memory sequence
    pub fn from_items(items: Vec<T>) -> Self {
        Self {
            source: Mutex::new(Some(PipeSource::List(items))),
            materialized: true,
        }
    }

    /// Streaming pipe over a producer stream
    ///
    /// The stream runs only as fast as the consumer pulls.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = Result<T>> + Send + 'static,
    {
        Self {
            source: Mutex::new(Some(PipeSource::Stream(Box::pin(stream)))),
            materialized: false,
        }
    }

    /// Whether the pipe is bounded and held in memory
    pub fn is_materialized(&self) -> bool {
        self.materialized
    }

    /// Whether the pipe is a one-shot stream
    pub fn is_streaming(&self) -> bool {
        !self.materialized
    }

    /// Whether the pipe still holds its producer (i.e. was never consumed)
    pub fn is_consumable(&self) -> bool {
        self.source.lock().expect("pipe lock poisoned").is_some()
    }

    /// Take the pipe's items as a cancellation-aware stream
    ///
    /// # Errors
    ///
    /// [`PipelineError::PipeAlreadyConsumed`] when called a second time.
    pub fn consume(&self, cancel: &CancellationToken) -> Result<BoxItemStream<T>> {
        let source = self
            .source
            .lock()
            .expect("pipe lock poisoned")
            .take()
            .ok_or(PipelineError::PipeAlreadyConsumed)?;

        let token = cancel.clone();
        match source {
            PipeSource::List(items) => Ok(Box::pin(async_stream::stream! {
                for item in items {
                    if token.is_cancelled() {
                        yield Err(PipelineError::Cancelled);
                        break;
                    }
                    yield Ok(item);
                }
            })),
            PipeSource::Stream(mut inner) => Ok(Box::pin(async_stream::stream! {
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => {
                            yield Err(PipelineError::Cancelled);
                            break;
                        }
                        next = inner.next() => match next {
                            Some(item) => yield item,
                            None => break,
                        }
                    }
                }
            })),
        }
    }

    /// Consume the pipe and collect every item, failing on the first error
    ///
    /// Convenience for tests and for strategies that materialize their
    /// input.
    pub async fn collect(&self, cancel: &CancellationToken) -> Result<Vec<T>> {
        let mut stream = self.consume(cancel)?;
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl<T> Debug for DataPipe<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPipe")
            .field("materialized", &self.materialized)
            .field(
                "consumed",
                &self.source.lock().expect("pipe lock poisoned").is_none(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_pipe_yields_items_in_order() {
        let pipe = DataPipe::from_items(vec!["a", "b", "c"]);
        assert!(pipe.is_materialized());

        let cancel = CancellationToken::new();
        let items = pipe.collect(&cancel).await.unwrap();
        assert_eq!(items, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_second_consume_fails() {
        let pipe = DataPipe::from_items(vec![1]);
        let cancel = CancellationToken::new();

        let _stream = pipe.consume(&cancel).unwrap();
        assert!(!pipe.is_consumable());

        let result = pipe.consume(&cancel);
        assert!(result.is_err());
        assert!(matches!(
            result.err().expect("second consume"),
            PipelineError::PipeAlreadyConsumed
        ));
    }

    #[tokio::test]
    async fn test_streaming_pipe_wraps_stream() {
        let pipe = DataPipe::from_stream(futures::stream::iter(vec![Ok(10), Ok(20)]));
        assert!(pipe.is_streaming());

        let cancel = CancellationToken::new();
        let items = pipe.collect(&cancel).await.unwrap();
        assert_eq!(items, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_stream_errors_propagate() {
        let pipe = DataPipe::from_stream(futures::stream::iter(vec![
            Ok(1),
            Err(PipelineError::node_execution("src", "boom")),
        ]));

        let cancel = CancellationToken::new();
        let err = pipe.collect(&cancel).await.unwrap_err();
        assert!(matches!(err, PipelineError::NodeExecution { .. }));
    }

    #[tokio::test]
    async fn test_cancellation_stops_list_pipe() {
        let pipe = DataPipe::from_items((0..100).collect::<Vec<_>>());
        let cancel = CancellationToken::new();

        let mut stream = pipe.consume(&cancel).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);

        cancel.cancel();
        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(PipelineError::Cancelled)));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_cancellation_stops_streaming_pipe() {
        // A producer that would run forever without cancellation.
        let pipe = DataPipe::from_stream(futures::stream::unfold(0u64, |n| async move {
            Some((Ok(n), n + 1))
        }));

        let cancel = CancellationToken::new();
        let mut stream = pipe.consume(&cancel).unwrap();
        assert_eq!(stream.next().await.unwrap().unwrap(), 0);

        cancel.cancel();
        let next = stream.next().await.unwrap();
        assert!(matches!(next, Err(PipelineError::Cancelled)));
        assert!(stream.next().await.is_none());
    }
}
