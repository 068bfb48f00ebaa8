//! In-process cluster demo
//!
//! Starts N nodes on an in-memory network, waits for a leader, proposes one
//! key-value command and prints every node's state.
//!
//! Usage: consensus-demo [--nodes 3] [--key hello] [--value raft]

use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use consensus_core::state_machine::KvCommand;
use consensus_core::testing::TestCluster;
use consensus_core::ConsensusConfig;

#[derive(Parser, Debug)]
#[command(name = "consensus-demo", about = "Run an in-process consensus cluster")]
struct Args {
    /// Number of nodes in the cluster
    #[arg(long, default_value_t = 3)]
    nodes: usize,

    #[arg(long, default_value_t = 150)]
    election_min_ms: u64,

    #[arg(long, default_value_t = 300)]
    election_max_ms: u64,

    #[arg(long, default_value_t = 50)]
    heartbeat_ms: u64,

    /// Key to set once a leader is elected
    #[arg(long, default_value = "hello")]
    key: String,

    #[arg(long, default_value = "raft")]
    value: String,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = ConsensusConfig::default()
        .with_heartbeat_interval(Duration::from_millis(args.heartbeat_ms))
        .with_election_timeout(
            Duration::from_millis(args.election_min_ms),
            Duration::from_millis(args.election_max_ms),
        );

    let cluster = match TestCluster::with_config(args.nodes, config).await {
        Ok(cluster) => cluster,
        Err(e) => {
            error!(error = %e, "failed to start cluster");
            std::process::exit(1);
        }
    };

    let Some(leader) = cluster.wait_for_leader(Duration::from_secs(5)).await else {
        error!("no leader elected");
        cluster.shutdown().await;
        std::process::exit(1);
    };
    info!(leader, "leader elected");

    let command = KvCommand::set(args.key.clone(), args.value.clone());
    match cluster.propose(leader, command.encode()).await {
        Ok(committed) => {
            info!(index = committed.index, term = committed.term, "command committed");
            cluster.wait_for_applied(committed.index, Duration::from_secs(2)).await;
        }
        Err(e) => error!(error = %e, "proposal failed"),
    }

    for node in &cluster.nodes {
        let info = node.handle.info().await;
        println!(
            "node {}: role={:?} term={} leader={:?} commit={} applied={} last_log={}/{}",
            info.id,
            info.role,
            info.current_term,
            info.leader_id,
            info.commit_index,
            info.last_applied,
            info.last_log_index,
            info.last_log_term,
        );
        println!("  {} = {:?}", args.key, node.kv.get(&args.key));
    }

    cluster.shutdown().await;
}
