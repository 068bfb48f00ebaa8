//! Request/response messages exchanged between peers
//!
//! The messages derive serde so a wire transport can carry them; the
//! in-process transport hands them over directly.

use serde::{Deserialize, Serialize};

use super::types::{LogEntry, LogIndex, NodeId, Term};

/// RequestVote RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Candidate's term
    pub term: Term,
    /// Candidate requesting vote
    pub candidate_id: NodeId,
    /// Index of candidate's last log entry
    pub last_log_index: LogIndex,
    /// Term of candidate's last log entry
    pub last_log_term: Term,
}

/// RequestVote RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteResult {
    /// Receiver's current term, for the candidate to update itself
    pub term: Term,
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    /// Leader's term
    pub term: Term,
    pub leader_id: NodeId,
    /// Index of log entry immediately preceding new ones
    pub prev_log_index: LogIndex,
    /// Term of prev_log_index entry
    pub prev_log_term: Term,
    /// Log entries to store (empty for heartbeat)
    pub entries: Vec<LogEntry>,
    /// Leader's commit_index
    pub leader_commit: LogIndex,
}

impl AppendEntriesArgs {
    /// Highest index this request asserts the follower now shares with the leader
    pub fn last_index(&self) -> LogIndex {
        self.prev_log_index + self.entries.len() as u64
    }
}

/// AppendEntries RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesResult {
    /// Receiver's current term, for the leader to update itself
    pub term: Term,
    pub success: bool,
    /// On a log mismatch: first index the leader should retry from
    pub conflict_index: Option<LogIndex>,
    /// On a term mismatch at prev_log_index: the receiver's term there
    pub conflict_term: Option<Term>,
}

impl AppendEntriesResult {
    pub(crate) fn accepted(term: Term) -> Self {
        AppendEntriesResult {
            term,
            success: true,
            conflict_index: None,
            conflict_term: None,
        }
    }

    pub(crate) fn rejected(term: Term) -> Self {
        AppendEntriesResult {
            term,
            success: false,
            conflict_index: None,
            conflict_term: None,
        }
    }

    pub(crate) fn conflict(term: Term, conflict_index: LogIndex, conflict_term: Option<Term>) -> Self {
        AppendEntriesResult {
            term,
            success: false,
            conflict_index: Some(conflict_index),
            conflict_term,
        }
    }
}

/// InstallSnapshot RPC arguments
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotArgs {
    /// Leader's term
    pub term: Term,
    pub leader_id: NodeId,
    /// Last log index covered by the snapshot
    pub last_included_index: LogIndex,
    /// Term of last included entry
    pub last_included_term: Term,
    /// Serialized state machine
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC results
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallSnapshotResult {
    /// Receiver's current term
    pub term: Term,
    /// False when the term was stale or the state machine refused the data
    pub success: bool,
}
