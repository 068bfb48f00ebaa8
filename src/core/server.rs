//! ConsensusServer - the long-running loop that drives a node
//!
//! Owns the heartbeat ticker and the election deadline, serializes client
//! proposals, and exits when the node is stopped.

use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, sleep_until, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::consensus_core::ConsensusCore;
use super::node::{Committed, ConsensusNode, RpcEndpoint, SharedCore};
use super::types::{NodeId, NodeInfo, NodeRole};
use crate::error::{ConsensusError, ConsensusResult};
use crate::transport::PeerTransport;

/// Command sent to the server from clients
enum Command {
    /// Propose a client command for replication
    Propose {
        command: Vec<u8>,
        reply: oneshot::Sender<ConsensusResult<Committed>>,
    },
}

/// Handle for interacting with a running ConsensusServer
#[derive(Clone)]
pub struct ConsensusHandle {
    id: NodeId,
    command_tx: mpsc::Sender<Command>,
    core: SharedCore,
    shutdown: CancellationToken,
}

impl ConsensusHandle {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Propose a command to the cluster
    /// Returns the state machine output once the entry is committed
    pub async fn propose(&self, command: Vec<u8>) -> ConsensusResult<Committed> {
        if self.shutdown.is_cancelled() {
            return Err(ConsensusError::Stopped);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.command_tx
            .send(Command::Propose {
                command,
                reply: reply_tx,
            })
            .await
            .map_err(|_| ConsensusError::Stopped)?;

        reply_rx.await.map_err(|_| ConsensusError::Stopped)?
    }

    /// Current protocol state of the node
    pub async fn info(&self) -> NodeInfo {
        self.core.lock().await.info()
    }

    pub async fn is_leader(&self) -> bool {
        self.core.lock().await.role() == NodeRole::Leader
    }

    /// Shared core, for inspection and membership changes
    pub fn shared_core(&self) -> SharedCore {
        self.core.clone()
    }

    /// Stop the node: the loop exits and inbound RPCs are refused
    pub fn stop(&self) {
        if !self.shutdown.is_cancelled() {
            info!(node = self.id, "stopping node");
        }
        self.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

/// Server that runs timers and client commands for one ConsensusNode
pub struct ConsensusServer<T: PeerTransport> {
    id: NodeId,
    node: ConsensusNode<T>,
    command_rx: mpsc::Receiver<Command>,
    command_tx: mpsc::Sender<Command>,
    shutdown: CancellationToken,
    heartbeat_interval: Duration,
}

impl<T: PeerTransport + 'static> ConsensusServer<T> {
    /// Create a new server; timings come from the core's config
    pub fn new(core: ConsensusCore, transport: T) -> Self {
        let (command_tx, command_rx) = mpsc::channel(32);
        let id = core.id();
        let heartbeat_interval = core.config().heartbeat_interval;
        Self {
            id,
            node: ConsensusNode::new(core, transport),
            command_rx,
            command_tx,
            shutdown: CancellationToken::new(),
            heartbeat_interval,
        }
    }

    /// Inbound RPC endpoint to register with the transport
    pub async fn endpoint(&self) -> RpcEndpoint {
        self.node.endpoint(self.shutdown.clone()).await
    }

    pub fn handle(&self) -> ConsensusHandle {
        ConsensusHandle {
            id: self.id,
            command_tx: self.command_tx.clone(),
            core: self.node.shared_core(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Spawn the server loop and return a handle for interaction
    pub fn start(self) -> ConsensusHandle {
        let handle = self.handle();
        tokio::spawn(self.run());
        handle
    }

    /// Main server loop
    pub async fn run(mut self) {
        let mut heartbeat = interval(self.heartbeat_interval);
        // Delay so accumulated missed ticks cannot starve the election timer
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let core = self.node.shared_core();
        info!(node = self.id, "server started");

        loop {
            let election_deadline = core.lock().await.election_deadline();

            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    break;
                }
                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        Command::Propose { command, reply } => {
                            let result = self.node.propose(command).await;
                            let _ = reply.send(result);
                        }
                    }
                }
                _ = heartbeat.tick() => {
                    if self.node.role().await == NodeRole::Leader {
                        // A leader never times itself out
                        core.lock().await.reset_election_timer();
                        self.node.send_heartbeat().await;
                    }
                }
                _ = sleep_until(election_deadline) => {
                    let timed_out = {
                        let mut core = core.lock().await;
                        if core.role() == NodeRole::Leader {
                            core.reset_election_timer();
                            false
                        } else {
                            // A heartbeat may have pushed the deadline out meanwhile
                            Instant::now() >= core.election_deadline()
                        }
                    };
                    if timed_out && !self.shutdown.is_cancelled() {
                        debug!(node = self.id, "election timeout");
                        if self.node.run_election().await {
                            // Establish leadership right away
                            self.node.send_heartbeat().await;
                        }
                    }
                }
            }
        }

        info!(node = self.id, "server stopped");
    }
}
