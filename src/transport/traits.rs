//! Transport abstraction for peer RPC communication

use async_trait::async_trait;
use thiserror::Error;

use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::core::types::NodeId;

/// Transport abstraction for peer RPC communication
///
/// The consensus core only ever talks to peers through this trait, so it can
/// run over an in-process fake as well as a real network.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Send a RequestVote RPC to a peer node
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError>;

    /// Send an AppendEntries RPC to a peer node
    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError>;

    /// Send an InstallSnapshot RPC to a peer node
    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError>;
}

/// Errors that can occur during transport operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// Target is partitioned away, stopped or refused the call
    #[error("node {0} unreachable")]
    Unreachable(NodeId),
    /// Request timed out
    #[error("request to node {0} timed out")]
    Timeout(NodeId),
    /// Target node not registered
    #[error("node {0} not found")]
    NodeNotFound(NodeId),
}
