//! In-memory state store
//!
//! Reference [`StateStore`] implementation backed by a `HashMap` behind an
//! async `RwLock`. Snapshots survive node restarts within a process but not
//! process restarts; use a durable backend for that.

use crate::error::Result;
use crate::traits::StateStore;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// In-memory snapshot storage
///
/// # Example
///
/// ```rust
/// use npipeline_checkpoint::{InMemoryStateStore, StateStore};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = InMemoryStateStore::new();
///     store.put("reader", vec![1, 2, 3]).await?;
///
///     let snapshot = store.get("reader").await?;
///     assert_eq!(snapshot, Some(vec![1, 2, 3]));
///     Ok(())
/// }
/// ```
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    snapshots: RwLock<HashMap<String, Vec<u8>>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Number of nodes with stored snapshots
    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn put(&self, node_id: &str, snapshot: Vec<u8>) -> Result<()> {
        self.snapshots
            .write()
            .await
            .insert(node_id.to_string(), snapshot);
        Ok(())
    }

    async fn get(&self, node_id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.snapshots.read().await.get(node_id).cloned())
    }

    async fn delete(&self, node_id: &str) -> Result<()> {
        self.snapshots.write().await.remove(node_id);
        Ok(())
    }

    async fn node_ids(&self) -> Result<Vec<String>> {
        Ok(self.snapshots.read().await.keys().cloned().collect())
    }

    async fn clear(&self) -> Result<()> {
        self.snapshots.write().await.clear();
        Ok(())
    }
}
