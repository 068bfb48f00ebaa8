//! Consensus core: leader election and log replication
//!
//! A single node's protocol logic over in-memory log and snapshot stores,
//! talking to peers through an abstract `PeerTransport` and applying
//! committed entries to a pluggable `StateMachine`.

pub mod core;
pub mod error;
pub mod membership;
pub mod state_machine;
pub mod storage;
pub mod transport;

/// Testing utilities for integration tests.
pub mod testing;

pub use crate::core::{
    Committed, ConsensusConfig, ConsensusCore, ConsensusHandle, ConsensusNode, ConsensusServer,
    LogEntry, LogIndex, NodeId, NodeInfo, NodeRole, Term,
};
pub use error::{ConsensusError, ConsensusResult};
pub use membership::{Member, MemberRole, MemberStatus, MembershipError, MembershipTable};
