//! Core data types shared by the log, the protocol and the state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Logical clock partitioning the cluster history into epochs
pub type Term = u64;
/// Position in the replicated log (first entry is 1, 0 means "none")
pub type LogIndex = u64;
/// Cluster-unique node identifier
pub type NodeId = u64;

/// Role a node currently plays in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    /// Passive: accepts entries from the leader, votes in elections
    Follower,
    /// Soliciting votes to become leader for its term
    Candidate,
    /// Accepts proposals and replicates the log
    Leader,
}

/// What a log entry carries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Appended by a freshly elected leader so entries from earlier terms
    /// can be committed through an entry of its own term
    Noop,
    /// Opaque client command handed to the state machine
    Command(Vec<u8>),
}

/// A single replicated log entry
///
/// Entries are never mutated once appended. A follower whose log diverges from
/// the leader's drops its conflicting suffix and receives fresh copies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Position in the log (1-indexed, contiguous)
    pub index: LogIndex,
    /// Term of the leader that created the entry
    pub term: Term,
    pub payload: Payload,
    /// When the leader accepted the proposal
    pub timestamp: DateTime<Utc>,
}

impl LogEntry {
    /// Build a command entry stamped with the current time
    pub fn command(index: LogIndex, term: Term, command: impl Into<Vec<u8>>) -> Self {
        LogEntry {
            index,
            term,
            payload: Payload::Command(command.into()),
            timestamp: Utc::now(),
        }
    }

    /// Build a no-op entry stamped with the current time
    pub fn noop(index: LogIndex, term: Term) -> Self {
        LogEntry {
            index,
            term,
            payload: Payload::Noop,
            timestamp: Utc::now(),
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self.payload, Payload::Noop)
    }

    /// Command bytes, `None` for no-op entries
    pub fn command_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            Payload::Command(bytes) => Some(bytes),
            Payload::Noop => None,
        }
    }
}

/// Point-in-time view of a node's protocol state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: NodeId,
    pub role: NodeRole,
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
    /// Leader this node currently recognizes, if any
    pub leader_id: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}
