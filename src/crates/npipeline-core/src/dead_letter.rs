//! Dead-letter sink - bounded receptacle for unprocessable items
//!
//! When a node fails on an item and its definition allows continuing
//! (`continue_on_error`), the item is parked here together with the node id
//! and the error, and the stream moves on. The sink is shared across the
//! run and **bounded** (default capacity 1000): overflow raises
//! [`PipelineError::DeadLetterOverflow`] and stops the pipeline rather than
//! exhausting memory.
//!
//! Entries keep the item both as a `Box<dyn Any>` (for typed recovery) and
//! as its `Debug` rendering (for logs and external handlers).
//!
//! A [`DeadLetterHandler`] can mirror entries to an external system (queue,
//! table, log index). Handlers must not block the runner for long; handler
//! failures surface as [`PipelineError::DeadLetterFailure`].

use crate::error::{PipelineError, Result};
use crate::pipe::PipeItem;
use async_trait::async_trait;
use std::any::Any;
use std::sync::{Arc, Mutex};

/// One parked item
pub struct DeadLetterEntry {
    /// Node that failed on the item
    pub node_id: String,
    /// `Debug` rendering of the item at the time of failure
    pub rendered: String,
    /// Display rendering of the error
    pub error: String,
    /// The item itself, downcastable to its concrete type
    pub item: Box<dyn Any + Send>,
}

impl DeadLetterEntry {
    /// The parked item as its concrete type, if `T` matches
    pub fn item_as<T: 'static>(&self) -> Option<&T> {
        self.item.downcast_ref::<T>()
    }
}

impl std::fmt::Debug for DeadLetterEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterEntry")
            .field("node_id", &self.node_id)
            .field("rendered", &self.rendered)
            .field("error", &self.error)
            .finish()
    }
}

/// Plugin mirroring dead-lettered items to an external system
#[async_trait]
pub trait DeadLetterHandler: Send + Sync {
    /// Handle one parked item. Must not block the runner; failures
    /// propagate as [`PipelineError::DeadLetterFailure`].
    async fn handle(&self, node_id: &str, rendered_item: &str, error: &str) -> Result<()>;
}

/// Bounded, shared sink of items that could not be processed
pub struct DeadLetterSink {
    capacity: usize,
    entries: Mutex<Vec<DeadLetterEntry>>,
    handler: Option<Arc<dyn DeadLetterHandler>>,
}

impl DeadLetterSink {
    /// Default capacity when none is configured
    pub const DEFAULT_CAPACITY: usize = 1000;

    /// Sink with the given capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(Vec::new()),
            handler: None,
        }
    }

    /// Attach an external handler
    pub fn with_handler(mut self, handler: Arc<dyn DeadLetterHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Park an item that failed at a node
    ///
    /// # Errors
    ///
    /// - [`PipelineError::DeadLetterOverflow`] when the sink is full; this
    ///   is fatal to the run.
    /// - [`PipelineError::DeadLetterFailure`] when the external handler
    ///   fails.
    pub async fn push<T: PipeItem>(
        &self,
        node_id: &str,
        item: T,
        error: &PipelineError,
    ) -> Result<()> {
        let rendered = format!("{:?}", item);
        {
            let mut entries = self.entries.lock().expect("dead-letter lock poisoned");
            if entries.len() >= self.capacity {
                return Err(PipelineError::DeadLetterOverflow {
                    capacity: self.capacity,
                });
            }
            entries.push(DeadLetterEntry {
                node_id: node_id.to_string(),
                rendered: rendered.clone(),
                error: error.to_string(),
                item: Box::new(item),
            });
        }

        tracing::warn!(
            node = %node_id,
            error = %error,
            "item dead-lettered"
        );

        if let Some(handler) = &self.handler {
            handler
                .handle(node_id, &rendered, &error.to_string())
                .await
                .map_err(|e| PipelineError::DeadLetterFailure {
                    node: node_id.to_string(),
                    error: e.to_string(),
                })?;
        }
        Ok(())
    }

    /// Number of parked items
    pub fn len(&self) -> usize {
        self.entries.lock().expect("dead-letter lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of parked items for one node
    pub fn count_for(&self, node_id: &str) -> usize {
        self.entries
            .lock()
            .expect("dead-letter lock poisoned")
            .iter()
            .filter(|e| e.node_id == node_id)
            .count()
    }

    /// Drain all parked items out of the sink
    pub fn take_entries(&self) -> Vec<DeadLetterEntry> {
        std::mem::take(&mut *self.entries.lock().expect("dead-letter lock poisoned"))
    }
}

impl Default for DeadLetterSink {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl std::fmt::Debug for DeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterSink")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_push_records_entry() {
        let sink = DeadLetterSink::new(10);
        let err = PipelineError::node_execution("t", "bad record");

        sink.push("t", 42_i64, &err).await.unwrap();
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.count_for("t"), 1);
        assert_eq!(sink.count_for("other"), 0);

        let entries = sink.take_entries();
        assert_eq!(entries[0].rendered, "42");
        assert_eq!(entries[0].item_as::<i64>(), Some(&42));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_overflow_is_fatal() {
        let sink = DeadLetterSink::new(2);
        let err = PipelineError::node_execution("t", "bad");

        sink.push("t", 1, &err).await.unwrap();
        sink.push("t", 2, &err).await.unwrap();
        let overflow = sink.push("t", 3, &err).await.unwrap_err();
        assert!(matches!(
            overflow,
            PipelineError::DeadLetterOverflow { capacity: 2 }
        ));
        // The sink never exceeds its capacity.
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test]
    async fn test_handler_failure_propagates() {
        struct FailingHandler;

        #[async_trait]
        impl DeadLetterHandler for FailingHandler {
            async fn handle(&self, _node_id: &str, _item: &str, _error: &str) -> Result<()> {
                Err(PipelineError::node_execution("handler", "downstream queue full"))
            }
        }

        let sink = DeadLetterSink::new(10).with_handler(Arc::new(FailingHandler));
        let err = PipelineError::node_execution("t", "bad");

        let failure = sink.push("t", 1, &err).await.unwrap_err();
        assert!(matches!(failure, PipelineError::DeadLetterFailure { .. }));
    }
}
