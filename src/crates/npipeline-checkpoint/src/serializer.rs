//! Serialization protocol for state snapshots
//!
//! The registry stores opaque byte tokens; the serializer decides how typed
//! node state becomes bytes. Two implementations are provided:
//!
//! - [`JsonSerializer`] (default) - human-readable, debuggable snapshots
//! - [`BincodeSerializer`] - compact binary snapshots for hot paths
//!
//! Custom strategies (MessagePack, encrypted-at-rest, versioned envelopes)
//! implement [`SerializerProtocol`].

use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Protocol for serializing and deserializing node state
///
/// Implementations must be deterministic enough that a snapshot written by
/// one run can be restored by the next.
pub trait SerializerProtocol: Send + Sync {
    /// Serialize a value to bytes
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>>;

    /// Deserialize a value from bytes
    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T>;
}

/// JSON-based serializer (default)
#[derive(Debug, Clone, Default)]
pub struct JsonSerializer;

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for JsonSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Binary serializer using bincode
#[derive(Debug, Clone, Default)]
pub struct BincodeSerializer;

impl BincodeSerializer {
    pub fn new() -> Self {
        Self
    }
}

impl SerializerProtocol for BincodeSerializer {
    fn dumps<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        Ok(bincode::serialize(value)?)
    }

    fn loads<T: for<'de> Deserialize<'de>>(&self, data: &[u8]) -> Result<T> {
        Ok(bincode::deserialize(data)?)
    }
}
