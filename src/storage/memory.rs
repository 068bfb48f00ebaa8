//! In-memory log and snapshot stores
//!
//! Fast, no side effects, no persistence across restarts.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::core::snapshot::Snapshot;
use crate::core::types::{LogEntry, LogIndex, Term};
use super::{LogStore, SnapshotStore, StorageError};

#[derive(Debug, Default)]
struct LogInner {
    /// entries[0] holds index base_index + 1
    entries: Vec<LogEntry>,
    /// Last index discarded by compaction (0 if none)
    base_index: LogIndex,
    /// Term of the entry at base_index
    base_term: Term,
}

impl LogInner {
    fn last_index(&self) -> LogIndex {
        self.base_index + self.entries.len() as u64
    }

    fn position(&self, index: LogIndex) -> usize {
        (index - self.base_index - 1) as usize
    }
}

/// In-memory log store
///
/// Keeps the retained suffix of the log in a `Vec` behind its own lock.
/// After compaction the discarded prefix is summarized by the
/// (base_index, base_term) pair so `last_index`/`last_term` stay meaningful.
#[derive(Debug, Default)]
pub struct InMemoryLogStore {
    inner: RwLock<LogInner>,
}

impl InMemoryLogStore {
    /// Create a new empty in-memory log
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of entries currently retained
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }
}

impl LogStore for InMemoryLogStore {
    fn append(&self, entries: &[LogEntry]) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        // Validate the whole batch before touching the log
        let mut expected = inner.last_index() + 1;
        for entry in entries {
            if entry.index != expected {
                return Err(StorageError::NonContiguous {
                    expected,
                    got: entry.index,
                });
            }
            expected += 1;
        }
        inner.entries.extend(entries.iter().cloned());
        Ok(())
    }

    fn get(&self, index: LogIndex) -> Result<LogEntry, StorageError> {
        let inner = self.inner.read();
        let last_index = inner.last_index();
        if index < 1 || index > last_index {
            return Err(StorageError::OutOfRange { index, last_index });
        }
        if index <= inner.base_index {
            return Err(StorageError::Compacted {
                index,
                first_index: inner.base_index + 1,
            });
        }
        Ok(inner.entries[inner.position(index)].clone())
    }

    fn get_range(&self, from: LogIndex, to: LogIndex) -> Vec<LogEntry> {
        let inner = self.inner.read();
        let from = from.max(inner.base_index + 1);
        let to = to.min(inner.last_index());
        if from > to {
            return Vec::new();
        }
        inner.entries[inner.position(from)..=inner.position(to)].to_vec()
    }

    fn last_index(&self) -> LogIndex {
        self.inner.read().last_index()
    }

    fn last_term(&self) -> Term {
        let inner = self.inner.read();
        inner.entries.last().map(|e| e.term).unwrap_or(inner.base_term)
    }

    fn first_index(&self) -> LogIndex {
        self.inner.read().base_index + 1
    }

    fn term_at(&self, index: LogIndex) -> Option<Term> {
        let inner = self.inner.read();
        if index == inner.base_index {
            return Some(inner.base_term);
        }
        if index < inner.base_index || index > inner.last_index() {
            return None;
        }
        Some(inner.entries[inner.position(index)].term)
    }

    fn delete_range(&self, from: LogIndex) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if from <= inner.base_index {
            return Err(StorageError::Compacted {
                index: from,
                first_index: inner.base_index + 1,
            });
        }
        if from <= inner.last_index() {
            let pos = inner.position(from);
            inner.entries.truncate(pos);
        }
        Ok(())
    }

    fn compact(&self, upto: LogIndex) -> Result<(), StorageError> {
        let mut inner = self.inner.write();
        if upto <= inner.base_index {
            return Ok(());
        }
        let last_index = inner.last_index();
        if upto > last_index {
            return Err(StorageError::OutOfRange {
                index: upto,
                last_index,
            });
        }
        let pos = inner.position(upto);
        inner.base_term = inner.entries[pos].term;
        inner.entries.drain(..=pos);
        inner.base_index = upto;
        Ok(())
    }

    fn reset(&self, index: LogIndex, term: Term) {
        let mut inner = self.inner.write();
        inner.entries.clear();
        inner.base_index = index;
        inner.base_term = term;
    }
}

/// In-memory snapshot store keyed by last included index
#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    snapshots: RwLock<BTreeMap<LogIndex, Snapshot>>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(&self, snapshot: Snapshot) -> Result<(), StorageError> {
        let mut snapshots = self.snapshots.write();
        if snapshots.contains_key(&snapshot.last_included_index) {
            return Err(StorageError::SnapshotExists(snapshot.last_included_index));
        }
        snapshots.insert(snapshot.last_included_index, snapshot);
        Ok(())
    }

    fn load(&self) -> Option<Snapshot> {
        self.snapshots.read().values().next_back().cloned()
    }

    fn list(&self) -> Vec<Snapshot> {
        self.snapshots.read().values().cloned().collect()
    }

    fn delete(&self, last_included_index: LogIndex) -> Result<(), StorageError> {
        self.snapshots
            .write()
            .remove(&last_included_index)
            .map(|_| ())
            .ok_or(StorageError::SnapshotNotFound(last_included_index))
    }
}
