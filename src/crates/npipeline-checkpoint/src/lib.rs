//! # npipeline-checkpoint - State Persistence for Pipeline Nodes
//!
//! **Trait-based state registry and checkpoint abstractions** for NPipeline.
//! Stateful sources record opaque progress tokens here so a restarted node
//! resumes where it left off instead of replaying its input.
//!
//! ## Overview
//!
//! The pipeline core treats node state as a black box:
//!
//! - **Declare** - a node announces it is stateful and which
//!   [`CheckpointStrategy`] its connector follows
//! - **Save / Load** - typed state round-trips through a
//!   [`SerializerProtocol`] into opaque bytes
//! - **Snapshot / Restore** - raw byte hooks hand the same bytes to an
//!   external persistence collaborator
//!
//! ## Components
//!
//! - [`StateRegistry`] - in-memory `node_id -> snapshot` mapping with
//!   pluggable persistence
//! - [`StateStore`] - async persistence trait; [`InMemoryStateStore`] is
//!   the reference implementation
//! - [`SerializerProtocol`] - [`JsonSerializer`] (default) and
//!   [`BincodeSerializer`]
//! - [`Checkpoint`] / [`CheckpointStrategy`] - the persisted record and
//!   the connector-facing strategy enum
//!
//! ## Quick Start
//!
//! ```rust
//! use npipeline_checkpoint::{StateRegistry, CheckpointStrategy};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = StateRegistry::in_memory();
//!     registry.declare("kafka-reader", CheckpointStrategy::Offset).await;
//!
//!     registry.save("kafka-reader", &1024_u64).await?;
//!     let offset: Option<u64> = registry.load("kafka-reader").await?;
//!     assert_eq!(offset, Some(1024));
//!     Ok(())
//! }
//! ```

pub mod checkpoint;
pub mod error;
pub mod memory;
pub mod registry;
pub mod serializer;
pub mod traits;

pub use checkpoint::{Checkpoint, CheckpointStrategy};
pub use error::{CheckpointError, Result};
pub use memory::InMemoryStateStore;
pub use registry::StateRegistry;
pub use serializer::{BincodeSerializer, JsonSerializer, SerializerProtocol};
pub use traits::StateStore;
