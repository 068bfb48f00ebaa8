//! Consensus protocol
//!
//! - `consensus_core`: synchronous protocol state and RPC handlers
//! - `node`: async fan-out over a `PeerTransport`, inbound `RpcEndpoint`
//! - `server`: timer loop and client handle

pub mod config;
pub mod consensus_core;
pub mod node;
pub mod rpc;
pub mod server;
pub mod snapshot;
pub mod types;

pub use config::ConsensusConfig;
pub use consensus_core::{AppliedOutputs, ConsensusCore, PeerRequest};
pub use node::{Committed, ConsensusNode, RpcEndpoint, SharedCore};
pub use rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
pub use server::{ConsensusHandle, ConsensusServer};
pub use snapshot::Snapshot;
pub use types::{LogEntry, LogIndex, NodeId, NodeInfo, NodeRole, Payload, Term};
