//! Testing utilities for cluster integration tests
//!
//! `TestCluster` spins up N in-process nodes on one `InMemoryNetwork`, each
//! running its own `ConsensusServer` with a key-value state machine.

use tokio::time::{sleep, Duration, Instant};

use crate::core::config::ConsensusConfig;
use crate::core::consensus_core::ConsensusCore;
use crate::core::node::Committed;
use crate::core::server::{ConsensusHandle, ConsensusServer};
use crate::core::types::{LogEntry, NodeId, NodeInfo, NodeRole, Term};
use crate::error::{ConsensusError, ConsensusResult};
use crate::state_machine::{
    AppliedEntries, ApplyResult, KvStateMachine, StateMachine, StateMachineError,
};
use crate::transport::InMemoryNetwork;

/// Key-value state machine that also records every entry it applies
struct ObservedStateMachine {
    kv: KvStateMachine,
    applied: AppliedEntries,
}

impl StateMachine for ObservedStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> ApplyResult {
        self.applied
            .lock()
            .push((entry.index, entry.command_bytes().map(<[u8]>::to_vec)));
        self.kv.apply(entry)
    }

    fn create_snapshot(&self) -> Result<Vec<u8>, StateMachineError> {
        self.kv.create_snapshot()
    }

    fn restore_snapshot(&mut self, data: &[u8]) -> Result<(), StateMachineError> {
        self.kv.restore_snapshot(data)
    }
}

/// A single node in the test cluster
pub struct TestNode {
    pub id: NodeId,
    pub handle: ConsensusHandle,
    /// Read access to the node's key-value store
    pub kv: KvStateMachine,
    /// Every entry applied on this node, in apply order
    pub applied: AppliedEntries,
}

/// A test cluster of consensus nodes
pub struct TestCluster {
    pub nodes: Vec<TestNode>,
    network: InMemoryNetwork,
}

impl TestCluster {
    /// Config with short timeouts used by default in tests
    pub fn test_config() -> ConsensusConfig {
        ConsensusConfig::default()
            .with_heartbeat_interval(Duration::from_millis(50))
            .with_election_timeout(Duration::from_millis(150), Duration::from_millis(300))
    }

    /// Create and start a cluster of `count` nodes with ids 1..=count
    pub async fn new(count: usize) -> ConsensusResult<Self> {
        Self::with_config(count, Self::test_config()).await
    }

    /// Create and start a cluster; `node_id` of `config` is set per node
    pub async fn with_config(count: usize, config: ConsensusConfig) -> ConsensusResult<Self> {
        let network = InMemoryNetwork::new();
        let ids: Vec<NodeId> = (1..=count as u64).collect();
        let mut nodes = Vec::new();

        for &id in &ids {
            let peers: Vec<NodeId> = ids.iter().copied().filter(|&p| p != id).collect();
            let kv = KvStateMachine::new();
            let applied = AppliedEntries::default();
            let state_machine = ObservedStateMachine {
                kv: kv.clone(),
                applied: applied.clone(),
            };
            let node_config = ConsensusConfig {
                node_id: id,
                ..config.clone()
            };
            let core = ConsensusCore::in_memory(node_config, &peers, Box::new(state_machine))?;

            let server = ConsensusServer::new(core, network.transport(id));
            network.register(server.endpoint().await);
            let handle = server.start();
            nodes.push(TestNode { id, handle, kv, applied });
        }

        Ok(TestCluster { nodes, network })
    }

    pub fn network(&self) -> &InMemoryNetwork {
        &self.network
    }

    /// Node by id (ids start at 1)
    pub fn node(&self, id: NodeId) -> &TestNode {
        &self.nodes[(id - 1) as usize]
    }

    pub fn ids(&self) -> Vec<NodeId> {
        self.nodes.iter().map(|n| n.id).collect()
    }

    pub async fn info(&self, id: NodeId) -> NodeInfo {
        self.node(id).handle.info().await
    }

    /// Info of every node, stopped ones included
    pub async fn infos(&self) -> Vec<NodeInfo> {
        let mut infos = Vec::new();
        for node in &self.nodes {
            infos.push(node.handle.info().await);
        }
        infos
    }

    /// Running nodes that currently believe they lead, with their terms
    pub async fn leaders(&self) -> Vec<(NodeId, Term)> {
        let mut leaders = Vec::new();
        for node in &self.nodes {
            if node.handle.is_stopped() {
                continue;
            }
            let info = node.handle.info().await;
            if info.role == NodeRole::Leader {
                leaders.push((node.id, info.current_term));
            }
        }
        leaders
    }

    /// Wait until exactly one running node among `candidates` leads
    pub async fn wait_for_leader_among(&self, candidates: &[NodeId], timeout: Duration) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let leaders: Vec<NodeId> = self
                .leaders()
                .await
                .into_iter()
                .map(|(id, _)| id)
                .filter(|id| candidates.contains(id))
                .collect();
            if leaders.len() == 1 {
                return Some(leaders[0]);
            }
            sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Wait until a running node leads a term newer than `term`
    /// A leader cut off in an older term may still believe it leads meanwhile.
    pub async fn wait_for_leader_after(&self, term: Term, timeout: Duration) -> Option<NodeId> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let newest = self.leaders().await.into_iter().filter(|&(_, t)| t > term).max_by_key(|&(_, t)| t);
            if let Some((id, _)) = newest {
                return Some(id);
            }
            sleep(Duration::from_millis(10)).await;
        }
        None
    }

    /// Wait until exactly one running node leads
    pub async fn wait_for_leader(&self, timeout: Duration) -> Option<NodeId> {
        self.wait_for_leader_among(&self.ids(), timeout).await
    }

    /// Propose on node `id`
    pub async fn propose(&self, id: NodeId, command: Vec<u8>) -> ConsensusResult<Committed> {
        self.node(id).handle.propose(command).await
    }

    /// Propose on whichever running node currently leads
    pub async fn propose_to_leader(&self, command: Vec<u8>) -> ConsensusResult<Committed> {
        let leader = self
            .leaders()
            .await
            .into_iter()
            .max_by_key(|&(_, term)| term)
            .map(|(id, _)| id)
            .ok_or(ConsensusError::NotLeader { leader_hint: None })?;
        self.propose(leader, command).await
    }

    /// Wait until every running node has applied at least `index`
    pub async fn wait_for_applied(&self, index: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let mut done = true;
            for node in &self.nodes {
                if !node.handle.is_stopped() && node.handle.info().await.last_applied < index {
                    done = false;
                    break;
                }
            }
            if done {
                return true;
            }
            sleep(Duration::from_millis(10)).await;
        }
        false
    }

    /// Stop a node; peers see it as unreachable
    pub fn stop_node(&self, id: NodeId) {
        self.node(id).handle.stop();
    }

    /// Split the cluster into groups that cannot talk to each other
    pub fn partition(&self, groups: &[&[NodeId]]) {
        self.network.partition(groups);
    }

    pub fn heal(&self) {
        self.network.heal();
    }

    /// Stop every node
    pub async fn shutdown(self) {
        for node in &self.nodes {
            node.handle.stop();
        }
        // Let the server loops observe the cancellation
        sleep(Duration::from_millis(10)).await;
    }
}
