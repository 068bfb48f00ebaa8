//! ConsensusNode - async fan-out of the protocol over a PeerTransport
//!
//! The node owns the shared core and a transport. Every outbound call is made
//! with the core lock released; results are fed back into the core one at a
//! time as they arrive.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::consensus_core::{AppliedOutputs, ConsensusCore, PeerRequest};
use super::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use super::types::{LogIndex, NodeId, NodeInfo, NodeRole, Term};
use crate::error::{ConsensusError, ConsensusResult};
use crate::transport::{PeerTransport, TransportError};

/// Shared reference to ConsensusCore
pub type SharedCore = Arc<Mutex<ConsensusCore>>;

/// A proposal that reached quorum and was applied on the leader
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed {
    pub index: LogIndex,
    pub term: Term,
    /// State machine output for the entry
    pub output: Vec<u8>,
}

/// High-level node that runs consensus rounds against its peers
pub struct ConsensusNode<T: PeerTransport> {
    core: SharedCore,
    transport: T,
    rpc_timeout: Duration,
}

impl<T: PeerTransport> ConsensusNode<T> {
    /// Create a new ConsensusNode
    pub fn new(core: ConsensusCore, transport: T) -> Self {
        let rpc_timeout = core.config().rpc_timeout;
        Self {
            core: Arc::new(Mutex::new(core)),
            transport,
            rpc_timeout,
        }
    }

    /// Get a shared reference to the core (for incoming RPC handling)
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Inbound RPC endpoint for this node that refuses calls once `shutdown` fires
    pub async fn endpoint(&self, shutdown: CancellationToken) -> RpcEndpoint {
        let id = self.core.lock().await.id();
        RpcEndpoint::new(id, self.core.clone(), shutdown)
    }

    pub async fn info(&self) -> NodeInfo {
        self.core.lock().await.info()
    }

    pub async fn role(&self) -> NodeRole {
        self.core.lock().await.role()
    }

    /// Bound a transport call by the configured RPC timeout
    async fn call<R>(
        &self,
        peer_id: NodeId,
        rpc: impl Future<Output = Result<R, TransportError>>,
    ) -> Result<R, TransportError> {
        match tokio::time::timeout(self.rpc_timeout, rpc).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::Timeout(peer_id)),
        }
    }

    /// Run one election round: become candidate, solicit votes
    /// Returns true if this node is leader afterwards
    pub async fn run_election(&self) -> bool {
        let term = {
            let mut core = self.core.lock().await;
            if core.start_election() {
                return true;
            }
            if core.role() != NodeRole::Candidate {
                return false;
            }
            core.current_term()
        };

        if self.request_votes().await {
            return true;
        }
        self.core.lock().await.election_lost(term);
        false
    }

    /// Request votes from all peers (sends requests concurrently)
    /// Returns true as soon as this node became leader
    pub async fn request_votes(&self) -> bool {
        let (args, peers) = {
            let core = self.core.lock().await;
            if core.role() != NodeRole::Candidate {
                return false;
            }
            (core.request_vote_args(), core.peers())
        };

        // Send all vote requests concurrently, process as they arrive
        let mut votes: FuturesUnordered<_> = peers
            .iter()
            .map(|&peer_id| {
                let args = args.clone();
                async move { (peer_id, self.call(peer_id, self.transport.request_vote(peer_id, args)).await) }
            })
            .collect();

        while let Some((peer_id, result)) = votes.next().await {
            match result {
                Ok(result) => {
                    let mut core = self.core.lock().await;
                    if core.handle_request_vote_result(peer_id, &result) {
                        // Became leader, don't wait for remaining
                        return true;
                    }
                    if core.role() != NodeRole::Candidate {
                        return false;
                    }
                }
                Err(e) => debug!(peer = peer_id, error = %e, "vote request failed"),
            }
        }

        false
    }

    /// Propose a command: append locally, replicate, return once committed
    pub async fn propose(&self, command: Vec<u8>) -> ConsensusResult<Committed> {
        let (entry, applied) = self.core.lock().await.propose(command)?;
        let mut output = output_for(entry.index, applied);

        if output.is_none() {
            let peers = self.core.lock().await.peers();
            let mut rounds: FuturesUnordered<_> =
                peers.iter().map(|&peer_id| self.sync_peer(peer_id, entry.index)).collect();

            // Return as soon as the entry commits; stragglers catch up on heartbeats
            while let Some(applied) = rounds.next().await {
                output = output_for(entry.index, applied);
                if output.is_some() {
                    break;
                }
            }
        }

        match output {
            Some(result) => Ok(Committed {
                index: entry.index,
                term: entry.term,
                output: result?,
            }),
            None => {
                let core = self.core.lock().await;
                if core.commit_index() >= entry.index && core.log().term_at(entry.index) == Some(entry.term) {
                    // Applied by a concurrent round; its output went to that caller
                    return Ok(Committed {
                        index: entry.index,
                        term: entry.term,
                        output: Vec::new(),
                    });
                }
                if core.role() != NodeRole::Leader || core.current_term() != entry.term {
                    // Deposed mid-round; the entry may still commit under the new leader
                    info!(node = core.id(), index = entry.index, term = core.current_term(), "lost leadership during proposal");
                    return Err(ConsensusError::NotLeader {
                        leader_hint: core.current_leader(),
                    });
                }
                let acks = core.acks_for(entry.index);
                let quorum = core.membership().quorum();
                info!(node = core.id(), index = entry.index, acks, quorum, "proposal did not reach quorum");
                Err(ConsensusError::QuorumUnavailable {
                    index: entry.index,
                    acks,
                    quorum,
                })
            }
        }
    }

    /// Send heartbeat to all peers
    /// Heartbeats are AppendEntries that also carry any entries a follower is
    /// missing; a follower behind the compaction point gets InstallSnapshot.
    /// Waits for every peer (bounded by the RPC timeout).
    /// Returns whether this node is still leader afterwards.
    pub async fn send_heartbeat(&self) -> bool {
        let (peers, target) = {
            let core = self.core.lock().await;
            // Only leaders send heartbeats
            if core.role() != NodeRole::Leader {
                return false;
            }
            (core.peers(), core.last_log_index())
        };

        let mut rounds: FuturesUnordered<_> =
            peers.iter().map(|&peer_id| self.sync_peer(peer_id, target)).collect();
        while rounds.next().await.is_some() {}

        self.core.lock().await.role() == NodeRole::Leader
    }

    /// Push entries to one peer until it holds `target` or stops making progress
    /// Always sends at least one request, so it doubles as a heartbeat.
    async fn sync_peer(&self, peer_id: NodeId, target: LogIndex) -> AppliedOutputs {
        let mut applied = Vec::new();
        loop {
            let (request, before) = {
                let core = self.core.lock().await;
                match core.replication_request(peer_id) {
                    Some(request) => (request, core.peer_progress(peer_id)),
                    None => break,
                }
            };

            match request {
                PeerRequest::AppendEntries(args) => {
                    let sent_last_index = args.last_index();
                    match self.call(peer_id, self.transport.append_entries(peer_id, args)).await {
                        Ok(result) => {
                            let mut core = self.core.lock().await;
                            applied.extend(core.handle_append_entries_result(peer_id, sent_last_index, &result));
                        }
                        Err(e) => {
                            debug!(peer = peer_id, error = %e, "append entries failed");
                            break;
                        }
                    }
                }
                PeerRequest::InstallSnapshot(args) => {
                    let last_included_index = args.last_included_index;
                    debug!(peer = peer_id, index = last_included_index, "sending snapshot");
                    match self.call(peer_id, self.transport.install_snapshot(peer_id, args)).await {
                        Ok(result) => {
                            let mut core = self.core.lock().await;
                            applied.extend(core.handle_install_snapshot_result(peer_id, last_included_index, &result));
                        }
                        Err(e) => {
                            debug!(peer = peer_id, error = %e, "install snapshot failed");
                            break;
                        }
                    }
                }
            }

            let core = self.core.lock().await;
            let after = core.peer_progress(peer_id);
            if core.role() != NodeRole::Leader || after.0 >= target || after == before {
                break;
            }
        }
        applied
    }
}

/// Output for `index` among freshly applied entries
fn output_for(
    index: LogIndex,
    applied: AppliedOutputs,
) -> Option<Result<Vec<u8>, crate::state_machine::StateMachineError>> {
    applied.into_iter().find(|(i, _)| *i == index).map(|(_, result)| result)
}

/// Inbound side of a node: what a transport delivers peer RPCs to
///
/// Once the node is stopped every call is refused, and the check happens
/// before the core (and therefore the election timer) is touched.
#[derive(Clone)]
pub struct RpcEndpoint {
    id: NodeId,
    core: SharedCore,
    shutdown: CancellationToken,
}

impl RpcEndpoint {
    pub fn new(id: NodeId, core: SharedCore, shutdown: CancellationToken) -> Self {
        Self { id, core, shutdown }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Lock the core unless the node has been stopped
    async fn lock(&self) -> Result<tokio::sync::MutexGuard<'_, ConsensusCore>, TransportError> {
        if self.is_stopped() {
            return Err(TransportError::Unreachable(self.id));
        }
        let core = self.core.lock().await;
        // Stop may have landed while waiting for the lock
        if self.is_stopped() {
            return Err(TransportError::Unreachable(self.id));
        }
        Ok(core)
    }

    pub async fn request_vote(&self, args: RequestVoteArgs) -> Result<RequestVoteResult, TransportError> {
        Ok(self.lock().await?.handle_request_vote(&args))
    }

    pub async fn append_entries(&self, args: AppendEntriesArgs) -> Result<AppendEntriesResult, TransportError> {
        Ok(self.lock().await?.handle_append_entries(&args))
    }

    pub async fn install_snapshot(&self, args: InstallSnapshotArgs) -> Result<InstallSnapshotResult, TransportError> {
        Ok(self.lock().await?.handle_install_snapshot(&args))
    }
}
