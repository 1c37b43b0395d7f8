//! Checkpoint types
//!
//! A checkpoint is an opaque token recording a source's progress so a
//! restarted node can resume instead of replaying from the beginning. The
//! pipeline core never interprets the token; the strategy tells connectors
//! how the token should be produced and applied.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// How a connector tracks its progress
///
/// This is pass-through configuration: the core persists whatever token the
/// connector hands it, and the strategy only documents intent.
///
/// # Strategy selection
///
/// | Strategy | Typical source | Token contents |
/// |----------|----------------|----------------|
/// | `Offset` | Kafka, log files | partition/offset pairs |
/// | `KeyBased` | keyed table scans | last processed key |
/// | `Cursor` | paginated APIs | opaque server cursor |
/// | `Cdc` | change-data-capture feeds | LSN / binlog position |
/// | `InMemory` | tests, replayable sources | anything |
/// | `None` | stateless sources | nothing is persisted |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    /// The node keeps no progress state
    None,
    /// Numeric offsets into an ordered log
    Offset,
    /// Last processed key of a keyed scan
    KeyBased,
    /// Opaque cursor issued by the upstream system
    Cursor,
    /// Change-data-capture position
    Cdc,
    /// Ephemeral, process-local progress
    InMemory,
}

impl Default for CheckpointStrategy {
    fn default() -> Self {
        Self::None
    }
}

/// One persisted progress record for a node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Unique id of this checkpoint
    pub id: Uuid,

    /// Node the checkpoint belongs to
    pub node_id: String,

    /// Opaque progress token produced by the connector
    pub token: Vec<u8>,

    /// Strategy the connector declared
    pub strategy: CheckpointStrategy,

    /// When the checkpoint was recorded
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a checkpoint for a node with a fresh id and timestamp
    pub fn new(
        node_id: impl Into<String>,
        token: Vec<u8>,
        strategy: CheckpointStrategy,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_id: node_id.into(),
            token,
            strategy,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_new() {
        let checkpoint = Checkpoint::new("reader", vec![0, 1], CheckpointStrategy::Offset);
        assert_eq!(checkpoint.node_id, "reader");
        assert_eq!(checkpoint.token, vec![0, 1]);
        assert_eq!(checkpoint.strategy, CheckpointStrategy::Offset);
    }

    #[test]
    fn test_strategy_serde_names() {
        let json = serde_json::to_string(&CheckpointStrategy::KeyBased).unwrap();
        assert_eq!(json, "\"key_based\"");

        let parsed: CheckpointStrategy = serde_json::from_str("\"cdc\"").unwrap();
        assert_eq!(parsed, CheckpointStrategy::Cdc);
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let checkpoint = Checkpoint::new("reader", b"cursor-xyz".to_vec(), CheckpointStrategy::Cursor);
        let json = serde_json::to_string(&checkpoint).unwrap();
        let restored: Checkpoint = serde_json::from_str(&json).unwrap();

        assert_eq!(restored.id, checkpoint.id);
        assert_eq!(restored.token, checkpoint.token);
    }
}
