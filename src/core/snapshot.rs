//! Snapshot types for log compaction
//!
//! Snapshots allow discarding old log entries by capturing
//! the state machine state at a specific log index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::types::{LogIndex, Term};

/// A snapshot of the state machine at a specific point in the log
///
/// Represents the cumulative effect of every entry up to and including
/// `last_included_index`. Immutable once saved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Last log index included in this snapshot
    pub last_included_index: LogIndex,
    /// Term of the last included log entry
    pub last_included_term: Term,
    /// Serialized state machine data
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(last_included_index: LogIndex, last_included_term: Term, data: Vec<u8>) -> Self {
        Snapshot {
            last_included_index,
            last_included_term,
            data,
            timestamp: Utc::now(),
        }
    }
}
