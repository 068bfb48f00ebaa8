//! State machine abstraction
//!
//! The state machine is the application logic the consensus core coordinates.
//! When log entries are committed, they are applied to the state machine.

use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

use crate::core::types::{LogEntry, LogIndex};

/// Errors reported by a state machine
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StateMachineError {
    /// The command could not be interpreted; still counts as applied
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("snapshot failed: {0}")]
    Snapshot(String),

    #[error("restore failed: {0}")]
    Restore(String),
}

/// Output of applying one entry: opaque result bytes for the proposer
pub type ApplyResult = Result<Vec<u8>, StateMachineError>;

/// Replicated state machine
///
/// Implementations must be deterministic: applying the same entries
/// in the same order must produce the same state on all nodes.
/// The core calls `apply` exactly once per committed entry, in ascending
/// index order with no gaps, including no-op entries.
pub trait StateMachine: Send {
    /// Apply a committed entry
    fn apply(&mut self, entry: &LogEntry) -> ApplyResult;

    /// Serialize the full current state
    fn create_snapshot(&self) -> Result<Vec<u8>, StateMachineError>;

    /// Replace the current state wholesale
    fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError>;
}

/// Shared record of applied entry indices and commands for testing
pub type AppliedEntries = Arc<Mutex<Vec<(LogIndex, Option<Vec<u8>>)>>>;

/// Test state machine that records every applied entry to a shared vec
#[derive(Default)]
pub struct RecordingStateMachine {
    applied: AppliedEntries,
}

impl RecordingStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with a shared vec to inspect applied entries from outside
    pub fn new_shared(applied: AppliedEntries) -> Self {
        RecordingStateMachine { applied }
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        self.applied
            .lock()
            .push((entry.index, entry.command_bytes().map(<[u8]>::to_vec)));
        Ok(Vec::new())
    }

    fn create_snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        let applied = self.applied.lock().clone();
        serde_json::to_vec(&applied)
            .map_err(|e| StateMachineError::Snapshot(format!("recording snapshot failed: {}", e)))
    }

    fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError> {
        let applied: Vec<(LogIndex, Option<Vec<u8>>)> = serde_json::from_slice(data)
            .map_err(|e| StateMachineError::Restore(format!("recording restore failed: {}", e)))?;
        *self.applied.lock() = applied;
        Ok(())
    }
}
