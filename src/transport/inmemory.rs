//! In-memory transport implementation for testing
//!
//! Nodes register their `RpcEndpoint` in a shared `InMemoryNetwork`; each
//! node's `InMemoryTransport` looks peers up by id, so there are no direct
//! references between nodes. Links can be cut per pair, per node or by
//! partition groups.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::core::node::RpcEndpoint;
use crate::core::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use crate::core::types::NodeId;
use super::{PeerTransport, TransportError};

#[derive(Default)]
struct NetworkInner {
    endpoints: HashMap<NodeId, RpcEndpoint>,
    /// Cut links, stored in both directions
    blocked: HashSet<(NodeId, NodeId)>,
    /// Nodes cut off from everyone
    isolated: HashSet<NodeId>,
}

impl NetworkInner {
    fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        !self.isolated.contains(&from) && !self.isolated.contains(&to) && !self.blocked.contains(&(from, to))
    }
}

/// Registry of node endpoints plus the current link state
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<RwLock<NetworkInner>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transport used by node `from` to reach its peers
    pub fn transport(&self, from: NodeId) -> InMemoryTransport {
        InMemoryTransport {
            network: self.clone(),
            from,
        }
    }

    /// Register (or replace) the endpoint peers reach for `endpoint.id()`
    pub fn register(&self, endpoint: RpcEndpoint) {
        self.inner.write().endpoints.insert(endpoint.id(), endpoint);
    }

    pub fn unregister(&self, id: NodeId) {
        self.inner.write().endpoints.remove(&id);
    }

    /// Cut the link between `a` and `b` in both directions
    pub fn disconnect(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.write();
        inner.blocked.insert((a, b));
        inner.blocked.insert((b, a));
    }

    pub fn reconnect(&self, a: NodeId, b: NodeId) {
        let mut inner = self.inner.write();
        inner.blocked.remove(&(a, b));
        inner.blocked.remove(&(b, a));
    }

    /// Cut `id` off from every other node
    pub fn isolate(&self, id: NodeId) {
        self.inner.write().isolated.insert(id);
    }

    /// Split the network: nodes in different groups cannot talk
    pub fn partition(&self, groups: &[&[NodeId]]) {
        let mut inner = self.inner.write();
        for (i, group) in groups.iter().enumerate() {
            for other in groups.iter().skip(i + 1) {
                for &a in group.iter() {
                    for &b in other.iter() {
                        inner.blocked.insert((a, b));
                        inner.blocked.insert((b, a));
                    }
                }
            }
        }
        debug!(groups = groups.len(), "network partitioned");
    }

    /// Restore every link
    pub fn heal(&self) {
        let mut inner = self.inner.write();
        inner.blocked.clear();
        inner.isolated.clear();
    }

    pub fn can_reach(&self, from: NodeId, to: NodeId) -> bool {
        self.inner.read().can_reach(from, to)
    }

    /// Endpoint for `to` if the link from `from` is up
    fn route(&self, from: NodeId, to: NodeId) -> Result<RpcEndpoint, TransportError> {
        let inner = self.inner.read();
        if !inner.can_reach(from, to) {
            return Err(TransportError::Unreachable(to));
        }
        inner.endpoints.get(&to).cloned().ok_or(TransportError::NodeNotFound(to))
    }

    /// Drop the reply if the link went down while the request was handled
    fn deliver<R>(&self, from: NodeId, to: NodeId, reply: R) -> Result<R, TransportError> {
        if self.can_reach(to, from) {
            Ok(reply)
        } else {
            Err(TransportError::Unreachable(to))
        }
    }
}

/// One node's view of the in-memory network
#[derive(Clone)]
pub struct InMemoryTransport {
    network: InMemoryNetwork,
    from: NodeId,
}

#[async_trait]
impl PeerTransport for InMemoryTransport {
    async fn request_vote(
        &self,
        target: NodeId,
        args: RequestVoteArgs,
    ) -> Result<RequestVoteResult, TransportError> {
        let endpoint = self.network.route(self.from, target)?;
        let reply = endpoint.request_vote(args).await?;
        self.network.deliver(self.from, target, reply)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        args: AppendEntriesArgs,
    ) -> Result<AppendEntriesResult, TransportError> {
        let endpoint = self.network.route(self.from, target)?;
        let reply = endpoint.append_entries(args).await?;
        self.network.deliver(self.from, target, reply)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        args: InstallSnapshotArgs,
    ) -> Result<InstallSnapshotResult, TransportError> {
        let endpoint = self.network.route(self.from, target)?;
        let reply = endpoint.install_snapshot(args).await?;
        self.network.deliver(self.from, target, reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::ConsensusConfig;
    use crate::core::consensus_core::ConsensusCore;
    use crate::core::node::SharedCore;
    use crate::state_machine::RecordingStateMachine;
    use tokio::sync::Mutex;
    use tokio_util::sync::CancellationToken;

    fn register_node(network: &InMemoryNetwork, id: NodeId, peers: &[NodeId]) -> (SharedCore, CancellationToken) {
        let core = ConsensusCore::in_memory(ConsensusConfig::new(id), peers, Box::new(RecordingStateMachine::new()))
            .unwrap();
        let core: SharedCore = Arc::new(Mutex::new(core));
        let shutdown = CancellationToken::new();
        network.register(RpcEndpoint::new(id, core.clone(), shutdown.clone()));
        (core, shutdown)
    }

    fn vote_args(term: u64) -> RequestVoteArgs {
        RequestVoteArgs {
            term,
            candidate_id: 1,
            last_log_index: 0,
            last_log_term: 0,
        }
    }

    #[tokio::test]
    async fn test_request_vote() {
        let network = InMemoryNetwork::new();
        let (core2, _shutdown) = register_node(&network, 2, &[1, 3]);

        let transport1 = network.transport(1);
        let result = transport1.request_vote(2, vote_args(1)).await.unwrap();

        assert!(result.vote_granted);
        assert_eq!(core2.lock().await.current_term(), 1);
    }

    #[tokio::test]
    async fn test_append_entries() {
        let network = InMemoryNetwork::new();
        let (core2, _shutdown) = register_node(&network, 2, &[1, 3]);

        let args = AppendEntriesArgs {
            term: 1,
            leader_id: 1,
            prev_log_index: 0,
            prev_log_term: 0,
            entries: vec![],
            leader_commit: 0,
        };
        let result = network.transport(1).append_entries(2, args).await.unwrap();

        assert!(result.success);
        assert_eq!(core2.lock().await.current_leader(), Some(1));
    }

    #[tokio::test]
    async fn test_unknown_node() {
        let network = InMemoryNetwork::new();
        let result = network.transport(1).request_vote(9, vote_args(1)).await;
        assert_eq!(result, Err(TransportError::NodeNotFound(9)));
    }

    #[tokio::test]
    async fn test_disconnect_and_reconnect() {
        let network = InMemoryNetwork::new();
        let (_core2, _shutdown) = register_node(&network, 2, &[1]);

        network.disconnect(1, 2);
        assert!(!network.can_reach(2, 1));
        let result = network.transport(1).request_vote(2, vote_args(1)).await;
        assert_eq!(result, Err(TransportError::Unreachable(2)));

        network.reconnect(1, 2);
        assert!(network.transport(1).request_vote(2, vote_args(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_partition_groups() {
        let network = InMemoryNetwork::new();
        network.partition(&[&[1, 2], &[3], &[4, 5]]);

        assert!(network.can_reach(1, 2));
        assert!(network.can_reach(4, 5));
        assert!(!network.can_reach(1, 3));
        assert!(!network.can_reach(5, 2));

        network.heal();
        assert!(network.can_reach(1, 3));
    }

    #[tokio::test]
    async fn test_isolated_node_reaches_nobody() {
        let network = InMemoryNetwork::new();
        let (_core2, _shutdown) = register_node(&network, 2, &[1]);
        network.isolate(1);

        assert!(!network.can_reach(1, 2));
        assert!(!network.can_reach(2, 1));
        assert!(network.transport(1).request_vote(2, vote_args(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_stopped_node_unreachable() {
        let network = InMemoryNetwork::new();
        let (_core2, shutdown) = register_node(&network, 2, &[1]);
        shutdown.cancel();

        let result = network.transport(1).request_vote(2, vote_args(1)).await;
        assert_eq!(result, Err(TransportError::Unreachable(2)));
    }
}
