//! End-to-end cluster tests over the in-memory network
//!
//! All tests run on paused tokio time, so timeouts elapse instantly while
//! the relative ordering of timers is preserved.

use std::collections::HashMap;
use std::time::Duration;

use consensus_core::core::types::Payload;
use consensus_core::state_machine::KvCommand;
use consensus_core::storage::{InMemoryLogStore, LogStore, StorageError};
use consensus_core::testing::TestCluster;
use consensus_core::{ConsensusError, LogEntry, LogIndex, NodeId, NodeRole, Term};

const LEADER_TIMEOUT: Duration = Duration::from_secs(3);

/// (index, term, payload) of every retained entry on node `id`
async fn log_of(cluster: &TestCluster, id: NodeId) -> Vec<(LogIndex, Term, Payload)> {
    let core = cluster.node(id).handle.shared_core();
    let core = core.lock().await;
    core.log()
        .get_range(1, core.last_log_index())
        .into_iter()
        .map(|e| (e.index, e.term, e.payload))
        .collect()
}

async fn wait_for_converged_logs(cluster: &TestCluster, ids: &[NodeId], timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        let first = log_of(cluster, ids[0]).await;
        let mut same = true;
        for &id in &ids[1..] {
            if log_of(cluster, id).await != first {
                same = false;
                break;
            }
        }
        if same {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

// === Scenario 1: single node ===

#[tokio::test(start_paused = true)]
async fn test_single_node_self_elects_and_commits() {
    let cluster = TestCluster::new(1).await.unwrap();
    {
        let core = cluster.node(1).handle.shared_core();
        assert_eq!(core.lock().await.membership().quorum(), 1);
    }

    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await;
    assert_eq!(leader, Some(1));

    let committed = cluster
        .propose(1, KvCommand::set("x", "1").encode())
        .await
        .unwrap();
    assert_eq!(cluster.info(1).await.commit_index, committed.index);
    assert_eq!(cluster.node(1).kv.get("x"), Some("1".to_string()));

    cluster.shutdown().await;
}

// === Scenario 2: three nodes elect one leader ===

#[tokio::test(start_paused = true)]
async fn test_three_nodes_one_leader_two_followers() {
    let cluster = TestCluster::new(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    // Let a heartbeat round reach everyone
    tokio::time::sleep(Duration::from_millis(100)).await;

    let infos = cluster.infos().await;
    let leaders: Vec<_> = infos.iter().filter(|i| i.role == NodeRole::Leader).collect();
    let followers: Vec<_> = infos.iter().filter(|i| i.role == NodeRole::Follower).collect();
    assert_eq!(leaders.len(), 1);
    assert_eq!(followers.len(), 2);
    for info in &infos {
        assert_eq!(info.leader_id, Some(leader));
        assert_eq!(info.current_term, leaders[0].current_term);
    }

    cluster.shutdown().await;
}

// === Scenario 3: a command reaches every state machine ===

#[tokio::test(start_paused = true)]
async fn test_proposal_applied_on_all_nodes() {
    let cluster = TestCluster::new(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    let committed = cluster
        .propose(leader, br#"{"key":"x","value":"1"}"#.to_vec())
        .await
        .unwrap();
    assert!(cluster.wait_for_applied(committed.index, Duration::from_secs(1)).await);

    for node in &cluster.nodes {
        assert_eq!(node.kv.get("x"), Some("1".to_string()), "node {}", node.id);
    }

    cluster.shutdown().await;
}

// === Scenario 4: leader failover ===

#[tokio::test(start_paused = true)]
async fn test_new_leader_after_leader_stops() {
    let cluster = TestCluster::new(3).await.unwrap();
    let old_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    // Followers have heard from the leader at least once
    tokio::time::sleep(Duration::from_millis(100)).await;
    let old_term = cluster.info(old_leader).await.current_term;

    cluster.stop_node(old_leader);

    let config = TestCluster::test_config();
    let window = config.election_timeout_max + config.heartbeat_interval;
    let remaining: Vec<NodeId> = cluster.ids().into_iter().filter(|&id| id != old_leader).collect();
    let new_leader = cluster.wait_for_leader_among(&remaining, window).await.unwrap();

    assert_ne!(new_leader, old_leader);
    assert!(cluster.info(new_leader).await.current_term > old_term);

    // The survivors still form a quorum of the three voters
    let committed = cluster.propose(new_leader, KvCommand::set("after", "failover").encode()).await;
    assert!(committed.is_ok());

    cluster.shutdown().await;
}

// === Scenario 5: log store indexing ===

#[test]
fn test_log_store_last_index_and_out_of_range() {
    let log = InMemoryLogStore::new();
    for i in 1..=5 {
        log.append(&[LogEntry::command(i, 1, format!("cmd {}", i))]).unwrap();
    }
    assert_eq!(log.last_index(), 5);
    assert!(matches!(log.get(0), Err(StorageError::OutOfRange { index: 0, .. })));
}

// === Election safety ===

/// Sample leaders while forcing repeated elections; no term may have two
async fn assert_election_safety(size: usize) {
    let cluster = TestCluster::new(size).await.unwrap();
    let mut leader_by_term: HashMap<Term, NodeId> = HashMap::new();
    let ids = cluster.ids();

    for round in 0..6 {
        // Drive an election by cutting off whoever leads now
        if let Some(leader) = cluster.wait_for_leader(LEADER_TIMEOUT).await {
            if round % 2 == 0 {
                cluster.network().isolate(leader);
            } else {
                // Leader plus as many followers as still leaves the rest a majority
                let followers: Vec<NodeId> = ids.iter().copied().filter(|&id| id != leader).collect();
                let split = (size - 1) / 2 - 1;
                let mut minority = vec![leader];
                minority.extend_from_slice(&followers[..split]);
                cluster.partition(&[&minority, &followers[split..]]);
            }
        }

        for _ in 0..60 {
            for (id, term) in cluster.leaders().await {
                let existing = *leader_by_term.entry(term).or_insert(id);
                assert_eq!(existing, id, "two leaders in term {}", term);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        cluster.heal();
    }

    assert!(!leader_by_term.is_empty());
    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_election_safety_three_nodes() {
    assert_election_safety(3).await;
}

#[tokio::test(start_paused = true)]
async fn test_election_safety_five_nodes() {
    assert_election_safety(5).await;
}

// === Quorum under partitions ===

#[tokio::test(start_paused = true)]
async fn test_majority_side_progresses() {
    let cluster = TestCluster::new(3).await.unwrap();
    let old_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    let majority: Vec<NodeId> = cluster.ids().into_iter().filter(|&id| id != old_leader).collect();
    cluster.partition(&[&[old_leader], &majority]);

    // The isolated leader cannot commit
    let err = cluster.propose(old_leader, KvCommand::set("lost", "1").encode()).await.unwrap_err();
    assert!(matches!(err, ConsensusError::QuorumUnavailable { acks: 1, quorum: 2, .. }));

    let new_leader = cluster.wait_for_leader_among(&majority, LEADER_TIMEOUT).await.unwrap();
    let committed = cluster
        .propose(new_leader, KvCommand::set("kept", "1").encode())
        .await
        .unwrap();
    assert!(committed.term > cluster.info(old_leader).await.current_term);

    cluster.heal();
    assert!(cluster.wait_for_applied(committed.index, Duration::from_secs(1)).await);
    for node in &cluster.nodes {
        assert_eq!(node.kv.get("kept"), Some("1".to_string()));
        assert_eq!(node.kv.get("lost"), None);
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_full_partition_stalls_then_recovers() {
    let cluster = TestCluster::new(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    let committed = cluster.propose(leader, KvCommand::set("a", "1").encode()).await.unwrap();
    assert!(cluster.wait_for_applied(committed.index, Duration::from_secs(1)).await);

    let term_before = cluster.info(leader).await.current_term;
    cluster.partition(&[&[1], &[2], &[3]]);

    let err = cluster.propose(leader, KvCommand::set("b", "1").encode()).await.unwrap_err();
    assert!(matches!(err, ConsensusError::QuorumUnavailable { .. }));

    // Nobody commits anything while split, however long we wait
    let commits_before: Vec<_> = cluster.infos().await.iter().map(|i| i.commit_index).collect();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let commits_after: Vec<_> = cluster.infos().await.iter().map(|i| i.commit_index).collect();
    assert_eq!(commits_before, commits_after);
    for id in cluster.ids() {
        if id != leader {
            assert_ne!(cluster.info(id).await.role, NodeRole::Leader);
        }
    }

    cluster.heal();
    // Split nodes kept timing out, so recovery happens in a newer term
    let mut leader = cluster.wait_for_leader_after(term_before, LEADER_TIMEOUT).await.unwrap();
    let mut attempts = 0;
    let committed = loop {
        match cluster.propose(leader, KvCommand::set("c", "1").encode()).await {
            Ok(committed) => break committed,
            // Terms may still be settling right after the heal
            Err(e) if e.is_retryable() && attempts < 5 => {
                attempts += 1;
                tokio::time::sleep(Duration::from_millis(300)).await;
                leader = cluster.wait_for_leader_after(term_before, LEADER_TIMEOUT).await.unwrap();
            }
            Err(e) => panic!("proposal after heal failed: {}", e),
        }
    };
    assert!(cluster.wait_for_applied(committed.index, Duration::from_secs(1)).await);
    for node in &cluster.nodes {
        assert_eq!(node.kv.get("a"), Some("1".to_string()));
        assert_eq!(node.kv.get("c"), Some("1".to_string()));
    }

    cluster.shutdown().await;
}

// === Log matching and apply order ===

#[tokio::test(start_paused = true)]
async fn test_logs_converge_after_leader_change() {
    let cluster = TestCluster::new(3).await.unwrap();
    let old_leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    for i in 0..3 {
        cluster
            .propose(old_leader, KvCommand::set(format!("k{}", i), "old").encode())
            .await
            .unwrap();
    }

    // Old leader keeps appending entries nobody else sees
    let others: Vec<NodeId> = cluster.ids().into_iter().filter(|&id| id != old_leader).collect();
    cluster.partition(&[&[old_leader], &others]);
    for i in 0..2 {
        let result = cluster
            .propose(old_leader, KvCommand::set(format!("stale{}", i), "x").encode())
            .await;
        assert!(result.is_err());
    }

    let new_leader = cluster.wait_for_leader_among(&others, LEADER_TIMEOUT).await.unwrap();
    let mut last = 0;
    for i in 0..2 {
        last = cluster
            .propose(new_leader, KvCommand::set(format!("n{}", i), "new").encode())
            .await
            .unwrap()
            .index;
    }

    cluster.heal();
    assert!(cluster.wait_for_applied(last, Duration::from_secs(2)).await);
    assert!(wait_for_converged_logs(&cluster, &cluster.ids(), Duration::from_secs(2)).await);

    // Same (index, term) implies identical prefixes
    let logs = [
        log_of(&cluster, 1).await,
        log_of(&cluster, 2).await,
        log_of(&cluster, 3).await,
    ];
    for a in &logs {
        for b in &logs {
            for (x, y) in a.iter().zip(b.iter()) {
                if x.0 == y.0 && x.1 == y.1 {
                    let upto = x.0 as usize;
                    assert_eq!(a[..upto], b[..upto]);
                }
            }
        }
    }

    for node in &cluster.nodes {
        assert_eq!(node.kv.get("stale0"), None);
        assert_eq!(node.kv.get("n1"), Some("new".to_string()));
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_apply_order_matches_committed_prefix() {
    let cluster = TestCluster::new(5).await.unwrap();
    let mut last = 0;
    for i in 0..10 {
        if i == 5 {
            // Force a leader change mid-stream
            let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
            cluster.stop_node(leader);
        }
        let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
        last = cluster
            .propose(leader, KvCommand::set("counter", i.to_string()).encode())
            .await
            .unwrap()
            .index;
    }
    assert!(cluster.wait_for_applied(last, Duration::from_secs(2)).await);

    for node in &cluster.nodes {
        if node.handle.is_stopped() {
            continue;
        }
        let applied = node.applied.lock().clone();
        let info = node.handle.info().await;
        let indices: Vec<LogIndex> = applied.iter().map(|(i, _)| *i).collect();
        let expected: Vec<LogIndex> = (1..=info.last_applied).collect();
        assert_eq!(indices, expected, "node {} applied out of order", node.id);

        // Each applied command is exactly the committed log entry
        let core = node.handle.shared_core();
        let core = core.lock().await;
        for (index, command) in applied {
            let entry = core.log().get(index).unwrap();
            assert_eq!(entry.command_bytes().map(<[u8]>::to_vec), command);
        }
        assert_eq!(node.kv.get("counter"), Some("9".to_string()));
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_terms_and_commit_never_decrease() {
    let cluster = TestCluster::new(3).await.unwrap();
    let mut previous: HashMap<NodeId, (Term, LogIndex, LogIndex)> = HashMap::new();

    for step in 0..40 {
        if step % 10 == 5 {
            if let Some(leader) = cluster.wait_for_leader(LEADER_TIMEOUT).await {
                cluster.network().isolate(leader);
            }
        }
        if step % 10 == 9 {
            cluster.heal();
        }
        let _ = cluster.propose_to_leader(format!("{{\"key\":\"s\",\"value\":\"{}\"}}", step).into_bytes()).await;

        for info in cluster.infos().await {
            let now = (info.current_term, info.commit_index, info.last_applied);
            if let Some(before) = previous.insert(info.id, now) {
                assert!(now.0 >= before.0 && now.1 >= before.1 && now.2 >= before.2, "node {} went backwards", info.id);
            }
            assert!(info.last_applied <= info.commit_index);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_request_id_applied_once() {
    let cluster = TestCluster::new(3).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();

    let command = KvCommand::set("retry", "1").with_request_id("client-7:1");
    let first = cluster.propose(leader, command.encode()).await.unwrap();
    cluster.propose(leader, KvCommand::set("retry", "2").encode()).await.unwrap();
    let retried = cluster.propose(leader, command.encode()).await.unwrap();

    assert!(first.output.is_empty());
    assert_eq!(retried.output, b"DUPLICATE".to_vec());
    assert!(cluster.wait_for_applied(retried.index, Duration::from_secs(1)).await);
    for node in &cluster.nodes {
        assert_eq!(node.kv.get("retry"), Some("2".to_string()));
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_lagging_follower_catches_up_from_snapshot() {
    let config = TestCluster::test_config().with_snapshot_threshold(5);
    let cluster = TestCluster::with_config(3, config).await.unwrap();
    let leader = cluster.wait_for_leader(LEADER_TIMEOUT).await.unwrap();
    let lagging = cluster.ids().into_iter().find(|&id| id != leader).unwrap();

    cluster.network().isolate(lagging);
    let mut last = 0;
    for i in 0..12 {
        last = cluster
            .propose(leader, KvCommand::set(format!("k{}", i), i.to_string()).encode())
            .await
            .unwrap()
            .index;
    }
    {
        let core = cluster.node(leader).handle.shared_core();
        assert!(core.lock().await.snapshot_last_index() > 0);
    }

    cluster.heal();
    assert!(cluster.wait_for_applied(last, Duration::from_secs(2)).await);
    assert_eq!(cluster.node(lagging).kv.get("k11"), Some("11".to_string()));
    assert_eq!(cluster.node(lagging).kv.get("k0"), Some("0".to_string()));

    cluster.shutdown().await;
}
