//! Persistence trait for state snapshots
//!
//! The registry keeps snapshots in memory for the duration of a run and
//! delegates durability to a [`StateStore`]. The in-memory reference
//! implementation lives in [`crate::memory`]; production backends
//! (PostgreSQL, Redis, object storage) implement this trait out of tree.

use crate::error::Result;
use async_trait::async_trait;

/// Backend that persists opaque per-node snapshots
///
/// Keys are node ids; values are whatever bytes the serializer produced.
/// Implementations must be safe to call from any worker thread.
///
/// # Example
///
/// ```rust,ignore
/// use npipeline_checkpoint::{StateStore, Result};
/// use async_trait::async_trait;
///
/// struct RedisStateStore {
///     client: redis::Client,
/// }
///
/// #[async_trait]
/// impl StateStore for RedisStateStore {
///     async fn put(&self, node_id: &str, snapshot: Vec<u8>) -> Result<()> {
///         // SET npipeline:state:{node_id} snapshot
///         Ok(())
///     }
///
///     async fn get(&self, node_id: &str) -> Result<Option<Vec<u8>>> {
///         // GET npipeline:state:{node_id}
///         Ok(None)
///     }
///
///     async fn delete(&self, node_id: &str) -> Result<()> {
///         Ok(())
///     }
///
///     async fn node_ids(&self) -> Result<Vec<String>> {
///         Ok(vec![])
///     }
/// }
/// ```
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Persist a snapshot, replacing any previous snapshot for the node
    async fn put(&self, node_id: &str, snapshot: Vec<u8>) -> Result<()>;

    /// Fetch the latest snapshot for a node, if any
    async fn get(&self, node_id: &str) -> Result<Option<Vec<u8>>>;

    /// Remove the snapshot for a node
    async fn delete(&self, node_id: &str) -> Result<()>;

    /// List all node ids with stored snapshots
    async fn node_ids(&self) -> Result<Vec<String>>;

    /// Remove every stored snapshot. Default: delete one by one.
    async fn clear(&self) -> Result<()> {
        for node_id in self.node_ids().await? {
            self.delete(&node_id).await?;
        }
        Ok(())
    }
}
