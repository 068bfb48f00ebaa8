//! Key-value store state machine
//!
//! Commands are JSON objects:
//! - `{"key": "x", "value": "1"}` sets `x`
//! - `{"key": "x", "value": null}` deletes `x`
//! - an optional `"request_id"` makes the command idempotent: a retried
//!   proposal carrying an id that was already applied changes nothing, as
//!   long as the id is among the most recent `dedup_window` ids seen
//!
//! For reads, use `get()` directly (bypasses the log).

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::types::LogEntry;
use super::{ApplyResult, StateMachine, StateMachineError};

/// A command understood by the key-value store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCommand {
    pub key: String,
    /// `None` deletes the key
    pub value: Option<String>,
    /// Client-supplied id used to drop duplicate retries
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl KvCommand {
    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        KvCommand {
            key: key.into(),
            value: Some(value.into()),
            request_id: None,
        }
    }

    pub fn delete(key: impl Into<String>) -> Self {
        KvCommand {
            key: key.into(),
            value: None,
            request_id: None,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// JSON encoding handed to `propose`
    pub fn encode(&self) -> Vec<u8> {
        // A struct of strings always serializes
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Request ids remembered for deduplication by default
pub const DEFAULT_DEDUP_WINDOW: usize = 10_000;

fn default_dedup_window() -> usize {
    DEFAULT_DEDUP_WINDOW
}

/// Simple in-memory key-value store
///
/// Dedup state is bounded: only the last `dedup_window` request ids are kept
/// (and carried in snapshots). A retry older than that is applied again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValueStore {
    data: BTreeMap<String, String>,
    /// Request ids already applied, for lookup
    applied_requests: BTreeSet<String>,
    /// Same ids in apply order, oldest first
    request_order: VecDeque<String>,
    #[serde(default = "default_dedup_window")]
    dedup_window: usize,
}

impl Default for KeyValueStore {
    fn default() -> Self {
        Self::with_dedup_window(DEFAULT_DEDUP_WINDOW)
    }
}

impl KeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that remembers at most `window` request ids (at least one)
    /// Every replica must use the same window.
    pub fn with_dedup_window(window: usize) -> Self {
        KeyValueStore {
            data: BTreeMap::new(),
            applied_requests: BTreeSet::new(),
            request_order: VecDeque::new(),
            dedup_window: window.max(1),
        }
    }

    /// Number of request ids currently remembered
    pub fn tracked_requests(&self) -> usize {
        self.request_order.len()
    }

    /// Get a value directly (for read-only queries, bypasses the log)
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    /// Get all key-value pairs
    pub fn all(&self) -> BTreeMap<String, String> {
        self.data.clone()
    }

    fn execute(&mut self, command: KvCommand) -> Vec<u8> {
        if let Some(request_id) = &command.request_id {
            if !self.applied_requests.insert(request_id.clone()) {
                return b"DUPLICATE".to_vec();
            }
            self.request_order.push_back(request_id.clone());
            while self.request_order.len() > self.dedup_window {
                if let Some(oldest) = self.request_order.pop_front() {
                    self.applied_requests.remove(&oldest);
                }
            }
        }
        match command.value {
            Some(value) => {
                self.data.insert(command.key, value);
                Vec::new()
            }
            None => match self.data.remove(&command.key) {
                Some(_) => Vec::new(),
                None => b"NOT_FOUND".to_vec(),
            },
        }
    }
}

impl StateMachine for KeyValueStore {
    fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        // No-op entries carry nothing for the store
        let Some(bytes) = entry.command_bytes() else {
            return Ok(Vec::new());
        };
        let command: KvCommand = serde_json::from_slice(bytes).map_err(|e| {
            StateMachineError::InvalidCommand(format!("entry {}: {}", entry.index, e))
        })?;
        Ok(self.execute(command))
    }

    fn create_snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        serde_json::to_vec(self)
            .map_err(|e| StateMachineError::Snapshot(format!("kv serialization failed: {}", e)))
    }

    fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError> {
        let restored: KeyValueStore = serde_json::from_slice(data)
            .map_err(|e| StateMachineError::Restore(format!("kv deserialization failed: {}", e)))?;
        *self = restored;
        Ok(())
    }
}

/// Shared key-value store that can be used for both replication and direct reads
pub type SharedKvStore = Arc<Mutex<KeyValueStore>>;

/// State machine handle over a shared store
#[derive(Debug, Clone, Default)]
pub struct KvStateMachine {
    store: SharedKvStore,
}

impl KvStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for reading the store while the core owns the state machine
    pub fn store(&self) -> SharedKvStore {
        self.store.clone()
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.store.lock().get(key)
    }
}

impl StateMachine for KvStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        self.store.lock().apply(entry)
    }

    fn create_snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        // Clone under the lock, serialize without holding it
        let snapshot = self.store.lock().clone();
        snapshot.create_snapshot()
    }

    fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError> {
        self.store.lock().restore_snapshot(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, command: &KvCommand) -> LogEntry {
        LogEntry::command(index, 1, command.encode())
    }

    #[test]
    fn test_set_and_get() {
        let mut kv = KeyValueStore::new();
        let result = kv.apply(&entry(1, &KvCommand::set("foo", "bar")));
        assert!(result.is_ok());
        assert_eq!(kv.get("foo"), Some("bar".to_string()));
    }

    #[test]
    fn test_get_not_found() {
        let kv = KeyValueStore::new();
        assert_eq!(kv.get("nonexistent"), None);
    }

    #[test]
    fn test_plain_json_command() {
        let mut kv = KeyValueStore::new();
        let e = LogEntry::command(1, 1, br#"{"key":"x","value":"1"}"#.to_vec());
        kv.apply(&e).unwrap();
        assert_eq!(kv.get("x"), Some("1".to_string()));
    }

    #[test]
    fn test_delete() {
        let mut kv = KeyValueStore::new();
        kv.apply(&entry(1, &KvCommand::set("x", "1"))).unwrap();
        assert_eq!(kv.apply(&entry(2, &KvCommand::delete("x"))).unwrap(), Vec::<u8>::new());
        assert_eq!(kv.get("x"), None);
        assert_eq!(kv.apply(&entry(3, &KvCommand::delete("x"))).unwrap(), b"NOT_FOUND".to_vec());
    }

    #[test]
    fn test_invalid_command() {
        let mut kv = KeyValueStore::new();
        let e = LogEntry::command(4, 1, b"SET x 1".to_vec());
        assert!(matches!(kv.apply(&e), Err(StateMachineError::InvalidCommand(_))));
    }

    #[test]
    fn test_noop_is_ignored() {
        let mut kv = KeyValueStore::new();
        assert!(kv.apply(&LogEntry::noop(1, 1)).is_ok());
        assert!(kv.all().is_empty());
    }

    #[test]
    fn test_duplicate_request_applied_once() {
        let mut kv = KeyValueStore::new();
        kv.apply(&entry(1, &KvCommand::set("x", "1").with_request_id("req-1"))).unwrap();
        kv.apply(&entry(2, &KvCommand::set("x", "2"))).unwrap();
        let retried = kv.apply(&entry(3, &KvCommand::set("x", "1").with_request_id("req-1"))).unwrap();
        assert_eq!(retried, b"DUPLICATE".to_vec());
        assert_eq!(kv.get("x"), Some("2".to_string()));
    }

    #[test]
    fn test_dedup_window_is_bounded() {
        let mut kv = KeyValueStore::with_dedup_window(2);
        for (i, id) in ["r1", "r2", "r3"].iter().enumerate() {
            kv.apply(&entry(i as u64 + 1, &KvCommand::set("x", *id).with_request_id(*id))).unwrap();
        }
        assert_eq!(kv.tracked_requests(), 2);

        // r3 is still remembered, r1 fell out of the window
        let retried = kv.apply(&entry(4, &KvCommand::set("x", "r3").with_request_id("r3"))).unwrap();
        assert_eq!(retried, b"DUPLICATE".to_vec());
        let replayed = kv.apply(&entry(5, &KvCommand::set("x", "r1").with_request_id("r1"))).unwrap();
        assert!(replayed.is_empty());
        assert_eq!(kv.get("x"), Some("r1".to_string()));
        assert_eq!(kv.tracked_requests(), 2);
    }

    #[test]
    fn test_snapshot_and_restore() {
        let mut kv = KeyValueStore::new();
        kv.apply(&entry(1, &KvCommand::set("a", "1").with_request_id("r1"))).unwrap();
        kv.apply(&entry(2, &KvCommand::set("b", "2"))).unwrap();
        let snapshot = kv.create_snapshot().unwrap();

        let mut restored = KeyValueStore::new();
        restored.apply(&entry(1, &KvCommand::set("stale", "x"))).unwrap();
        restored.restore_snapshot(&snapshot).unwrap();

        assert_eq!(restored, kv);
        assert_eq!(restored.get("stale"), None);
        // Dedup state survives the snapshot
        let retried = restored.apply(&entry(3, &KvCommand::set("a", "9").with_request_id("r1"))).unwrap();
        assert_eq!(retried, b"DUPLICATE".to_vec());
    }

    #[test]
    fn test_restore_garbage_fails() {
        let mut kv = KeyValueStore::new();
        assert!(matches!(kv.restore_snapshot(b"not json"), Err(StateMachineError::Restore(_))));
    }

    #[test]
    fn test_shared_state_machine_reads() {
        let mut sm = KvStateMachine::new();
        let store = sm.store();
        sm.apply(&entry(1, &KvCommand::set("x", "1"))).unwrap();
        assert_eq!(store.lock().get("x"), Some("1".to_string()));
        assert_eq!(sm.get("x"), Some("1".to_string()));
    }
}
