//! State registry - per-node snapshot handoffs
//!
//! The registry is the single surface the pipeline core uses for node
//! state. Nodes declare themselves stateful, save typed state before a
//! restart boundary, and load it back after re-initialization:
//!
//! ```text
//! ┌────────────┐  save("reader", offsets)   ┌───────────────┐
//! │ Source     │ ─────────────────────────> │ StateRegistry │
//! │ (node)     │ <───────────────────────── │  serializer   │
//! └────────────┘  load("reader")            │  + StateStore │
//!                                           └───────────────┘
//! ```
//!
//! Serialization goes through a [`SerializerProtocol`]; persistence goes
//! through a [`StateStore`]. Both default to in-process implementations
//! ([`JsonSerializer`], [`InMemoryStateStore`]) so tests and simple runs
//! need no external system.

use crate::checkpoint::{Checkpoint, CheckpointStrategy};
use crate::error::{CheckpointError, Result};
use crate::memory::InMemoryStateStore;
use crate::serializer::{JsonSerializer, SerializerProtocol};
use crate::traits::StateStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// In-memory mapping of `node_id -> opaque snapshot` with pluggable
/// persistence
///
/// # Example
///
/// ```rust
/// use npipeline_checkpoint::{StateRegistry, CheckpointStrategy};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize, PartialEq, Debug)]
/// struct ReaderState {
///     offset: u64,
/// }
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let registry = StateRegistry::in_memory();
///     registry.declare("reader", CheckpointStrategy::Offset).await;
///
///     registry.save("reader", &ReaderState { offset: 128 }).await?;
///
///     let restored: Option<ReaderState> = registry.load("reader").await?;
///     assert_eq!(restored, Some(ReaderState { offset: 128 }));
///     Ok(())
/// }
/// ```
pub struct StateRegistry<S: SerializerProtocol = JsonSerializer> {
    store: Arc<dyn StateStore>,
    serializer: S,
    declared: RwLock<HashMap<String, CheckpointStrategy>>,
}

impl StateRegistry<JsonSerializer> {
    /// Registry backed by [`InMemoryStateStore`] and JSON snapshots
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryStateStore::new()))
    }

    /// Registry over a custom store with the default JSON serializer
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self {
            store,
            serializer: JsonSerializer::new(),
            declared: RwLock::new(HashMap::new()),
        }
    }
}

impl<S: SerializerProtocol> StateRegistry<S> {
    /// Registry over a custom store and serializer
    pub fn with_serializer(store: Arc<dyn StateStore>, serializer: S) -> Self {
        Self {
            store,
            serializer,
            declared: RwLock::new(HashMap::new()),
        }
    }

    /// Declare a node stateful. Only declared nodes may save snapshots.
    pub async fn declare(&self, node_id: impl Into<String>, strategy: CheckpointStrategy) {
        self.declared.write().await.insert(node_id.into(), strategy);
    }

    /// The strategy a node declared, if any
    pub async fn strategy_of(&self, node_id: &str) -> Option<CheckpointStrategy> {
        self.declared.read().await.get(node_id).copied()
    }

    /// Whether a node declared itself stateful
    pub async fn is_declared(&self, node_id: &str) -> bool {
        self.declared.read().await.contains_key(node_id)
    }

    /// Serialize and persist typed node state
    pub async fn save<T: Serialize>(&self, node_id: &str, state: &T) -> Result<()> {
        let strategy = self
            .strategy_of(node_id)
            .await
            .ok_or_else(|| CheckpointError::NotRegistered(node_id.to_string()))?;

        let token = self.serializer.dumps(state)?;
        let checkpoint = Checkpoint::new(node_id, token, strategy);
        self.store.put(node_id, self.serializer.dumps(&checkpoint)?).await
    }

    /// Load and deserialize typed node state, `None` when nothing is stored
    pub async fn load<T: DeserializeOwned>(&self, node_id: &str) -> Result<Option<T>> {
        match self.store.get(node_id).await? {
            Some(bytes) => {
                let checkpoint: Checkpoint = self.serializer.loads(&bytes)?;
                let state = self.serializer.loads(&checkpoint.token).map_err(|_| {
                    CheckpointError::invalid_snapshot(node_id, "token does not match requested type")
                })?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// Raw snapshot hook: the stored bytes for a node, untouched
    pub async fn snapshot(&self, node_id: &str) -> Result<Option<Vec<u8>>> {
        self.store.get(node_id).await
    }

    /// Raw restore hook: overwrite the stored bytes for a node
    pub async fn restore(&self, node_id: &str, snapshot: Vec<u8>) -> Result<()> {
        self.store.put(node_id, snapshot).await
    }

    /// Drop the snapshot for a node
    pub async fn clear(&self, node_id: &str) -> Result<()> {
        self.store.delete(node_id).await
    }

    /// Node ids with stored snapshots
    pub async fn node_ids(&self) -> Result<Vec<String>> {
        self.store.node_ids().await
    }
}
