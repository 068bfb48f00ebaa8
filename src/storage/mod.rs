//! Storage layer for the replicated log and state machine snapshots
//!
//! - `InMemoryLogStore`: append-only log with truncation and compaction
//! - `InMemorySnapshotStore`: snapshots keyed by the index they cover

pub mod memory;
pub mod traits;

pub use memory::{InMemoryLogStore, InMemorySnapshotStore};
pub use traits::{LogStore, SnapshotStore, StorageError};
