//! Error types for consensus operations

use thiserror::Error;

use crate::core::types::{LogIndex, NodeId, Term};
use crate::membership::MembershipError;
use crate::state_machine::StateMachineError;
use crate::storage::StorageError;
use crate::transport::TransportError;

/// Result type for consensus operations
pub type ConsensusResult<T> = std::result::Result<T, ConsensusError>;

/// Errors surfaced by the consensus core
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    /// Proposal sent to a node that is not the leader
    #[error("not the leader, known leader is {leader_hint:?}")]
    NotLeader {
        /// Leader this node currently recognizes, if any
        leader_hint: Option<NodeId>,
    },

    /// Request carried a term older than the receiver's
    #[error("stale term, receiver is at term {current}")]
    StaleTerm { current: Term },

    /// AppendEntries consistency check failed
    #[error("log conflict at index {conflict_index} (term {conflict_term:?})")]
    LogConflict {
        conflict_index: LogIndex,
        conflict_term: Option<Term>,
    },

    /// Proposal could not be acknowledged by a quorum of voters in its round
    #[error("entry {index} reached {acks} of {quorum} required acknowledgments")]
    QuorumUnavailable {
        index: LogIndex,
        acks: usize,
        quorum: usize,
    },

    /// Proposals must carry a non-empty command
    #[error("command is empty")]
    EmptyCommand,

    #[error("state machine error: {0}")]
    StateMachine(#[from] StateMachineError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("membership error: {0}")]
    Membership(#[from] MembershipError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// Node has been stopped
    #[error("node is stopped")]
    Stopped,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ConsensusError {
    /// True for conditions a caller may resolve by retrying, possibly elsewhere
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ConsensusError::NotLeader { .. }
                | ConsensusError::QuorumUnavailable { .. }
                | ConsensusError::Transport(_)
        )
    }
}
