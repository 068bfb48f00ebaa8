//! Storage abstractions for the replicated log and snapshots
//!
//! Both stores are in-memory by contract; durability is out of scope. Each
//! implementation synchronizes itself, independent of the node lock.

use thiserror::Error;

use crate::core::snapshot::Snapshot;
use crate::core::types::{LogEntry, LogIndex, Term};

/// Errors that can occur during storage operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// Index below 1 or beyond the last entry
    #[error("index {index} out of range (last index {last_index})")]
    OutOfRange { index: LogIndex, last_index: LogIndex },

    /// Entry was discarded by compaction
    #[error("index {index} compacted (first retained index {first_index})")]
    Compacted { index: LogIndex, first_index: LogIndex },

    /// Appended entry does not continue the tail
    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: LogIndex, got: LogIndex },

    /// A snapshot covering this index was already saved
    #[error("snapshot at index {0} already exists")]
    SnapshotExists(LogIndex),

    #[error("no snapshot at index {0}")]
    SnapshotNotFound(LogIndex),
}

/// Append-only, index-addressable log of entries
pub trait LogStore: Send + Sync {
    /// Append entries after the current tail
    /// Each entry must carry index `last_index() + 1` at the time it lands
    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError>;

    /// Get a single entry
    fn get(&self, index: LogIndex) -> Result<LogEntry, StorageError>;

    /// Entries in `[from, to]`, clamped to what the log retains
    fn get_range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry>;

    /// Index of the last entry (or of the compaction point, or 0)
    fn last_index(&self) -> LogIndex;

    /// Term of the last entry (or of the compaction point, or 0)
    fn last_term(&self) -> Term;

    /// First index still held in the log
    fn first_index(&self) -> LogIndex;

    /// Term at `index` if it is retained or is exactly the compaction point
    fn term_at(&self, index: LogIndex) -> Option<Term>;

    /// Discard every entry with index >= from
    /// Used when a follower's suffix conflicts with the leader's log
    fn delete_range(&self, from: LogIndex) -> Result<(), StorageError>;

    /// Discard every entry with index <= upto
    /// Callers must not pass an index above the commit index
    fn compact(&self, upto: LogIndex) -> Result<(), StorageError>;

    /// Drop the whole log and continue after (index, term)
    /// Used when an installed snapshot supersedes everything held locally
    fn reset(&self, index: LogIndex, term: Term);
}

/// Point-in-time snapshots keyed by the last index they cover
pub trait SnapshotStore: Send + Sync {
    /// Save a snapshot; snapshots are immutable once saved
    fn save(&self, snapshot: Snapshot) -> Result<(), StorageError>;

    /// Most recent snapshot (highest last_included_index), if any
    fn load(&self) -> Option<Snapshot>;

    /// All snapshots in ascending index order
    fn list(&self) -> Vec<Snapshot>;

    /// Delete the snapshot covering exactly `last_included_index`
    fn delete(&self, last_included_index: LogIndex) -> Result<(), StorageError>;
}
