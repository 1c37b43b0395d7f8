//! Error types for state registry and checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur while snapshotting or restoring node state
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// No snapshot is stored for the requested node
    #[error("No state snapshot for node '{0}'")]
    NotFound(String),

    /// JSON serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("Binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// The backing store failed
    #[error("State store error: {0}")]
    Storage(String),

    /// A snapshot was present but could not be interpreted
    #[error("Invalid snapshot for node '{node}': {reason}")]
    InvalidSnapshot {
        /// Node the snapshot belongs to
        node: String,
        /// Why the snapshot was rejected
        reason: String,
    },

    /// The node never declared itself stateful
    #[error("Node '{0}' is not registered as stateful")]
    NotRegistered(String),

    /// I/O error from a persistence backend
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CheckpointError {
    /// Create a storage error from any displayable backend failure
    pub fn storage(error: impl std::fmt::Display) -> Self {
        Self::Storage(error.to_string())
    }

    /// Create an invalid-snapshot error with node context
    pub fn invalid_snapshot(node: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidSnapshot {
            node: node.into(),
            reason: reason.into(),
        }
    }
}
