//! Consensus protocol core
//!
//! Leader election and log replication in the style of
//! "In Search of an Understandable Consensus Algorithm" (Ongaro, Ousterhout).
//! Everything here is synchronous and transport-agnostic: the async node
//! layer calls into it while holding the node lock and performs the network
//! fan-out itself.

use std::collections::{HashMap, HashSet};

use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::ConsensusError;
use crate::membership::{Member, MemberStatus, MembershipTable};
use crate::state_machine::{ApplyResult, StateMachine};
use crate::storage::{InMemoryLogStore, InMemorySnapshotStore, LogStore, SnapshotStore, StorageError};
use super::config::ConsensusConfig;
use super::rpc::{
    AppendEntriesArgs, AppendEntriesResult, InstallSnapshotArgs, InstallSnapshotResult,
    RequestVoteArgs, RequestVoteResult,
};
use super::snapshot::Snapshot;
use super::types::{LogEntry, LogIndex, NodeId, NodeInfo, NodeRole, Term};

/// Results of applying newly committed entries, in index order
pub type AppliedOutputs = Vec<(LogIndex, ApplyResult)>;

/// Request a leader sends to bring one peer up to date
#[derive(Debug, Clone)]
pub enum PeerRequest {
    AppendEntries(AppendEntriesArgs),
    InstallSnapshot(InstallSnapshotArgs),
}

/// Core consensus state (sync, transport-agnostic)
pub struct ConsensusCore {
    config: ConsensusConfig,
    log: Box<dyn LogStore>,
    snapshots: Box<dyn SnapshotStore>,
    state_machine: Box<dyn StateMachine>,
    membership: MembershipTable,

    /// Unique identifier for this node
    pub(crate) id: NodeId,
    /// Current role of this node
    pub(crate) role: NodeRole,
    /// Latest term this node has seen (increases monotonically)
    pub(crate) current_term: Term,
    /// Candidate that received this node's vote in current term
    pub(crate) voted_for: Option<NodeId>,
    /// Current known leader (updated when receiving valid AppendEntries)
    pub(crate) current_leader: Option<NodeId>,
    /// Index of highest log entry known to be committed (increases monotonically)
    pub(crate) commit_index: LogIndex,
    /// Index of highest log entry applied to state machine (increases monotonically)
    pub(crate) last_applied: LogIndex,

    // Volatile state on leaders (reinitialized after election)
    /// For each peer, index of next log entry to send to that peer
    pub(crate) next_index: HashMap<NodeId, LogIndex>,
    /// For each peer, index of highest log entry known to be replicated on it
    pub(crate) match_index: HashMap<NodeId, LogIndex>,

    /// Voters that granted their vote in the current election, self included
    votes_received: HashSet<NodeId>,
    /// When the election timer fires; re-randomized on every reset
    pub(crate) election_deadline: Instant,
}

impl ConsensusCore {
    /// Create a core over the given stores and state machine
    ///
    /// The node adds itself to the membership table as an alive voter if it
    /// is not listed. If the snapshot store holds a snapshot the state
    /// machine is restored from it and the commit/applied markers start there.
    pub fn new(
        config: ConsensusConfig,
        mut membership: MembershipTable,
        log: Box<dyn LogStore>,
        snapshots: Box<dyn SnapshotStore>,
        mut state_machine: Box<dyn StateMachine>,
    ) -> Result<Self, ConsensusError> {
        config.validate()?;
        let id = config.node_id;
        if membership.get_member(id).is_err() {
            membership.add_member(Member::voter(id, ""));
        }

        let mut snapshot_index = 0;
        if let Some(snapshot) = snapshots.load() {
            state_machine.restore_snapshot(&snapshot.data)?;
            if log.last_index() < snapshot.last_included_index {
                log.reset(snapshot.last_included_index, snapshot.last_included_term);
            }
            snapshot_index = snapshot.last_included_index;
        }

        let election_deadline = Instant::now() + config.random_election_timeout();
        Ok(ConsensusCore {
            config,
            log,
            snapshots,
            state_machine,
            membership,
            id,
            role: NodeRole::Follower,
            current_term: 0,
            voted_for: None,
            current_leader: None,
            commit_index: snapshot_index,
            last_applied: snapshot_index,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes_received: HashSet::new(),
            election_deadline,
        })
    }

    /// Core with in-memory stores and every listed peer as an alive voter
    pub fn in_memory(
        config: ConsensusConfig,
        peers: &[NodeId],
        state_machine: Box<dyn StateMachine>,
    ) -> Result<Self, ConsensusError> {
        let membership =
            MembershipTable::with_voters(peers.iter().copied().chain(std::iter::once(config.node_id)));
        Self::new(
            config,
            membership,
            Box::new(InMemoryLogStore::new()),
            Box::new(InMemorySnapshotStore::new()),
            state_machine,
        )
    }

    // === Accessors ===

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    pub fn current_term(&self) -> Term {
        self.current_term
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.current_leader
    }

    pub fn commit_index(&self) -> LogIndex {
        self.commit_index
    }

    pub fn last_applied(&self) -> LogIndex {
        self.last_applied
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn log(&self) -> &dyn LogStore {
        self.log.as_ref()
    }

    pub fn snapshots(&self) -> &dyn SnapshotStore {
        self.snapshots.as_ref()
    }

    pub fn membership(&self) -> &MembershipTable {
        &self.membership
    }

    /// Peers this node replicates to (every member but itself)
    pub fn peers(&self) -> Vec<NodeId> {
        self.membership.peers_of(self.id)
    }

    /// Get the last log index (compaction point if the log is empty)
    pub fn last_log_index(&self) -> LogIndex {
        self.log.last_index()
    }

    /// Get the term of the last log entry (compaction point term if the log is empty)
    pub fn last_log_term(&self) -> Term {
        self.log.last_term()
    }

    /// Last index covered by the most recent snapshot (0 if none)
    pub fn snapshot_last_index(&self) -> LogIndex {
        self.log.first_index() - 1
    }

    /// Snapshot of the node's protocol state
    pub fn info(&self) -> NodeInfo {
        NodeInfo {
            id: self.id,
            role: self.role,
            current_term: self.current_term,
            voted_for: self.voted_for,
            leader_id: self.current_leader,
            commit_index: self.commit_index,
            last_applied: self.last_applied,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    // === Membership ===

    /// Add or replace a member; new peers start replication from the tail
    pub fn add_member(&mut self, member: Member) {
        let id = member.id;
        self.membership.add_member(member);
        if self.role == NodeRole::Leader && id != self.id {
            let next = self.last_log_index() + 1;
            self.next_index.entry(id).or_insert(next);
            self.match_index.entry(id).or_insert(0);
        }
    }

    pub fn remove_member(&mut self, id: NodeId) -> Result<Member, ConsensusError> {
        let member = self.membership.remove_member(id)?;
        self.next_index.remove(&id);
        self.match_index.remove(&id);
        Ok(member)
    }

    pub fn set_member_status(&mut self, id: NodeId, status: MemberStatus) -> Result<(), ConsensusError> {
        self.membership.set_status(id, status)?;
        Ok(())
    }

    // === Timer ===

    /// Push the election deadline out by a freshly randomized timeout
    pub fn reset_election_timer(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    pub fn election_deadline(&self) -> Instant {
        self.election_deadline
    }

    // === Term bookkeeping ===

    /// Adopt a higher term: clear the vote and leader, fall back to follower
    fn update_term(&mut self, new_term: Term) {
        let old_role = self.role;
        self.current_term = new_term;
        self.voted_for = None;
        self.role = NodeRole::Follower;
        self.votes_received.clear();
        // Whoever led the old term cannot lead this one
        self.current_leader = None;
        if old_role != NodeRole::Follower {
            info!(node = self.id, term = new_term, was = ?old_role, "stepped down to follower");
        }
    }

    /// Reject terms older than ours; adopt newer ones
    fn observe_term(&mut self, term: Term) -> Result<(), ConsensusError> {
        if term < self.current_term {
            return Err(ConsensusError::StaleTerm {
                current: self.current_term,
            });
        }
        if term > self.current_term {
            self.update_term(term);
        }
        Ok(())
    }

    /// Recognize `leader_id` as leader of the current term and reset the election timer
    fn follow(&mut self, leader_id: NodeId) {
        if self.role != NodeRole::Follower {
            info!(node = self.id, term = self.current_term, leader = leader_id, was = ?self.role, "stepped down to follower");
            self.role = NodeRole::Follower;
            self.votes_received.clear();
        }
        self.current_leader = Some(leader_id);
        self.reset_election_timer();
    }

    /// Check if candidate's log is at least as up-to-date as receiver's log
    pub fn is_log_up_to_date(&self, candidate_last_log_term: Term, candidate_last_log_index: LogIndex) -> bool {
        let my_last_term = self.last_log_term();
        let my_last_index = self.last_log_index();

        candidate_last_log_term > my_last_term
            || (candidate_last_log_term == my_last_term && candidate_last_log_index >= my_last_index)
    }

    // === Inbound RPC handlers ===

    /// Handle RequestVote RPC
    pub fn handle_request_vote(&mut self, vote_req: &RequestVoteArgs) -> RequestVoteResult {
        // Decline requests with stale term immediately
        if let Err(e) = self.observe_term(vote_req.term) {
            debug!(node = self.id, candidate = vote_req.candidate_id, error = %e, "vote denied");
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        // One vote per term
        if self.voted_for.is_some() && self.voted_for != Some(vote_req.candidate_id) {
            debug!(node = self.id, term = self.current_term, candidate = vote_req.candidate_id, "vote denied, already voted");
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        if !self.is_log_up_to_date(vote_req.last_log_term, vote_req.last_log_index) {
            debug!(node = self.id, term = self.current_term, candidate = vote_req.candidate_id, "vote denied, candidate log behind");
            return RequestVoteResult {
                term: self.current_term,
                vote_granted: false,
            };
        }

        self.voted_for = Some(vote_req.candidate_id);
        // Granting a vote defers our own candidacy
        self.reset_election_timer();
        debug!(node = self.id, term = self.current_term, candidate = vote_req.candidate_id, "vote granted");

        RequestVoteResult {
            term: self.current_term,
            vote_granted: true,
        }
    }

    /// Handle AppendEntries RPC (heartbeat or log replication)
    pub fn handle_append_entries(&mut self, append_req: &AppendEntriesArgs) -> AppendEntriesResult {
        if let Err(e) = self.observe_term(append_req.term) {
            debug!(node = self.id, leader = append_req.leader_id, error = %e, "rejecting append entries");
            return AppendEntriesResult::rejected(self.current_term);
        }
        self.follow(append_req.leader_id);

        match self.check_log_continuity(append_req) {
            Ok(()) => {}
            Err(ConsensusError::LogConflict {
                conflict_index,
                conflict_term,
            }) => {
                return AppendEntriesResult::conflict(self.current_term, conflict_index, conflict_term);
            }
            Err(e) => {
                warn!(node = self.id, error = %e, "malformed append entries");
                return AppendEntriesResult::rejected(self.current_term);
            }
        }

        if let Err(e) = self.merge_entries(append_req) {
            warn!(node = self.id, error = %e, "rejecting append entries");
            return AppendEntriesResult::rejected(self.current_term);
        }

        // commit_index = min(leader_commit, last index verified against this request)
        let verified = append_req.last_index();
        let new_commit = append_req.leader_commit.min(verified);
        if new_commit > self.commit_index {
            self.commit_index = new_commit;
            self.apply_committed_entries();
        }

        AppendEntriesResult::accepted(self.current_term)
    }

    /// LogConflict with hints if the log does not hold prev_log_index at prev_log_term
    fn check_log_continuity(&self, req: &AppendEntriesArgs) -> Result<(), ConsensusError> {
        let last_index = self.last_log_index();
        if req.prev_log_index > last_index {
            return Err(ConsensusError::LogConflict {
                conflict_index: last_index + 1,
                conflict_term: None,
            });
        }

        if let Some(first) = req.entries.first() {
            if first.index != req.prev_log_index + 1 {
                return Err(StorageError::NonContiguous {
                    expected: req.prev_log_index + 1,
                    got: first.index,
                }
                .into());
            }
        }

        // Entries at or below the snapshot point are committed and therefore match
        let snapshot_index = self.snapshot_last_index();
        if req.prev_log_index <= snapshot_index {
            return Ok(());
        }

        let local_term = self.log.term_at(req.prev_log_index).unwrap_or(0);
        if local_term == req.prev_log_term {
            return Ok(());
        }

        // Point the leader at the first entry of the conflicting term
        let mut conflict_index = req.prev_log_index;
        while conflict_index > snapshot_index + 1
            && self.log.term_at(conflict_index - 1) == Some(local_term)
        {
            conflict_index -= 1;
        }
        debug!(
            node = self.id,
            prev_log_index = req.prev_log_index,
            conflict_index,
            conflict_term = local_term,
            "log conflict"
        );
        Err(ConsensusError::LogConflict {
            conflict_index,
            conflict_term: Some(local_term),
        })
    }

    /// Append new entries, dropping any conflicting suffix first
    fn merge_entries(&mut self, req: &AppendEntriesArgs) -> Result<(), ConsensusError> {
        let snapshot_index = self.snapshot_last_index();
        let mut pending: &[LogEntry] = &req.entries;

        // Skip entries already covered by the snapshot or already present
        while let Some(entry) = pending.first() {
            if entry.index <= snapshot_index {
                pending = &pending[1..];
                continue;
            }
            match self.log.term_at(entry.index) {
                Some(term) if term == entry.term => pending = &pending[1..],
                Some(_) => {
                    // Committed entries are never overwritten
                    if entry.index <= self.commit_index {
                        error!(node = self.id, index = entry.index, commit_index = self.commit_index, "leader tried to overwrite a committed entry");
                        return Err(ConsensusError::LogConflict {
                            conflict_index: entry.index,
                            conflict_term: Some(entry.term),
                        });
                    }
                    debug!(node = self.id, from = entry.index, "truncating conflicting suffix");
                    self.log.delete_range(entry.index)?;
                    break;
                }
                None => break,
            }
        }

        if !pending.is_empty() {
            self.log.append(pending)?;
            debug!(
                node = self.id,
                first = pending[0].index,
                last = pending[pending.len() - 1].index,
                "replicated entries"
            );
        }
        Ok(())
    }

    /// Handle InstallSnapshot RPC
    pub fn handle_install_snapshot(&mut self, args: &InstallSnapshotArgs) -> InstallSnapshotResult {
        if let Err(e) = self.observe_term(args.term) {
            debug!(node = self.id, leader = args.leader_id, error = %e, "rejecting snapshot");
            return InstallSnapshotResult {
                term: self.current_term,
                success: false,
            };
        }
        self.follow(args.leader_id);

        // Already applied past this point; applied state never moves backwards
        if args.last_included_index <= self.last_applied {
            return InstallSnapshotResult {
                term: self.current_term,
                success: true,
            };
        }

        if let Err(e) = self.state_machine.restore_snapshot(&args.data) {
            warn!(node = self.id, error = %e, "failed to restore snapshot");
            return InstallSnapshotResult {
                term: self.current_term,
                success: false,
            };
        }

        let snapshot = Snapshot::new(args.last_included_index, args.last_included_term, args.data.clone());
        match self.snapshots.save(snapshot) {
            Ok(()) | Err(StorageError::SnapshotExists(_)) => {}
            Err(e) => warn!(node = self.id, error = %e, "failed to save installed snapshot"),
        }

        self.commit_index = self.commit_index.max(args.last_included_index);
        self.last_applied = args.last_included_index;

        // Keep the suffix if our log agrees with the snapshot point, else start over
        let compacted = self.log.term_at(args.last_included_index) == Some(args.last_included_term)
            && self.log.compact(args.last_included_index).is_ok();
        if !compacted {
            self.log.reset(args.last_included_index, args.last_included_term);
        }
        self.prune_snapshots();

        info!(
            node = self.id,
            term = self.current_term,
            index = args.last_included_index,
            leader = args.leader_id,
            "installed snapshot"
        );
        InstallSnapshotResult {
            term: self.current_term,
            success: true,
        }
    }

    // === Elections ===

    /// Start a new election (called when election timeout elapses)
    /// Returns true if this node won immediately (single voter cluster)
    pub fn start_election(&mut self) -> bool {
        if !self.membership.is_voter(self.id) {
            self.reset_election_timer();
            return false;
        }

        self.current_term += 1;
        self.role = NodeRole::Candidate;
        self.current_leader = None;
        self.voted_for = Some(self.id);
        self.votes_received.clear();
        self.votes_received.insert(self.id);
        // Bounded retry if this election goes nowhere
        self.reset_election_timer();
        info!(node = self.id, term = self.current_term, "became candidate");

        self.try_win_election()
    }

    /// Arguments for this candidate's RequestVote broadcast
    pub fn request_vote_args(&self) -> RequestVoteArgs {
        RequestVoteArgs {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        }
    }

    /// Handle a RequestVote result (called by candidate after receiving vote response)
    /// Returns true if this node became leader as a result
    pub fn handle_request_vote_result(&mut self, peer_id: NodeId, result: &RequestVoteResult) -> bool {
        if result.term > self.current_term {
            self.update_term(result.term);
            return false;
        }

        // Ignore responses for elections we are no longer running
        if self.role != NodeRole::Candidate || result.term != self.current_term {
            return false;
        }

        if result.vote_granted {
            self.votes_received.insert(peer_id);
        }
        self.try_win_election()
    }

    /// Vote round ended without a quorum: wait for the next timeout as follower
    pub fn election_lost(&mut self, term: Term) {
        if self.role == NodeRole::Candidate && self.current_term == term {
            info!(node = self.id, term, votes = self.votes_received.len(), quorum = self.membership.quorum(), "election lost");
            self.role = NodeRole::Follower;
            self.votes_received.clear();
        }
    }

    fn try_win_election(&mut self) -> bool {
        let votes = self.membership.count_quorum_members(&self.votes_received);
        if votes >= self.membership.quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    /// Become leader (called after receiving a quorum of votes)
    pub fn become_leader(&mut self) {
        self.role = NodeRole::Leader;
        self.current_leader = Some(self.id);
        self.votes_received.clear();
        info!(node = self.id, term = self.current_term, "became leader");

        // Reinitialize next_index and match_index BEFORE appending no-op
        // so the first heartbeat carries it
        let last_index = self.last_log_index();
        self.next_index.clear();
        self.match_index.clear();
        for peer_id in self.peers() {
            self.next_index.insert(peer_id, last_index + 1);
            self.match_index.insert(peer_id, 0);
        }

        // Entries from earlier terms only commit through one of our own term
        let noop = LogEntry::noop(last_index + 1, self.current_term);
        if let Err(e) = self.log.append(std::slice::from_ref(&noop)) {
            error!(node = self.id, error = %e, "failed to append no-op entry");
            return;
        }
        self.advance_commit_index();
    }

    // === Leader operations ===

    /// Append a client command to the leader's log
    /// Commits immediately when this node alone forms a quorum
    pub fn propose(&mut self, command: Vec<u8>) -> Result<(LogEntry, AppliedOutputs), ConsensusError> {
        if self.role != NodeRole::Leader {
            return Err(ConsensusError::NotLeader {
                leader_hint: self.current_leader,
            });
        }
        if command.is_empty() {
            return Err(ConsensusError::EmptyCommand);
        }

        let entry = LogEntry::command(self.last_log_index() + 1, self.current_term, command);
        self.log.append(std::slice::from_ref(&entry))?;
        debug!(node = self.id, index = entry.index, term = entry.term, "appended entry");

        let applied = self.advance_commit_index();
        Ok((entry, applied))
    }

    /// Build the request that brings `peer_id` up to date
    /// Sends a snapshot when the entries the peer needs were compacted
    pub fn replication_request(&self, peer_id: NodeId) -> Option<PeerRequest> {
        if self.role != NodeRole::Leader {
            return None;
        }

        let last_index = self.last_log_index();
        let next_idx = self
            .next_index
            .get(&peer_id)
            .copied()
            .unwrap_or(last_index + 1)
            .clamp(1, last_index + 1);

        if next_idx <= self.snapshot_last_index() {
            let snapshot = self.snapshots.load()?;
            return Some(PeerRequest::InstallSnapshot(InstallSnapshotArgs {
                term: self.current_term,
                leader_id: self.id,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                data: snapshot.data,
            }));
        }

        let prev_log_index = next_idx - 1;
        let prev_log_term = self.log.term_at(prev_log_index).unwrap_or(0);
        let batch = self.config.max_entries_per_append as u64;
        let entries = self.log.get_range(next_idx, next_idx + batch - 1);

        Some(PeerRequest::AppendEntries(AppendEntriesArgs {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        }))
    }

    /// Handle an AppendEntries result (called by leader after receiving replication response)
    /// `sent_last_index` is the highest index the request covered
    /// Returns the outputs of any entries this response committed
    pub fn handle_append_entries_result(
        &mut self,
        peer_id: NodeId,
        sent_last_index: LogIndex,
        result: &AppendEntriesResult,
    ) -> AppliedOutputs {
        if result.term > self.current_term {
            self.update_term(result.term);
            return Vec::new();
        }

        if self.role != NodeRole::Leader || result.term < self.current_term {
            return Vec::new();
        }

        let current_match = self.match_index.get(&peer_id).copied().unwrap_or(0);
        if result.success {
            let new_match = current_match.max(sent_last_index);
            self.match_index.insert(peer_id, new_match);
            self.next_index.insert(peer_id, new_match + 1);
            return self.advance_commit_index();
        }

        // Back up using the follower's conflict hints
        let current_next = self.next_index.get(&peer_id).copied().unwrap_or(1);
        let mut next = match (result.conflict_term, result.conflict_index) {
            (Some(term), Some(index)) => self.last_index_of_term(term).map(|i| i + 1).unwrap_or(index),
            (None, Some(index)) => index,
            _ => current_next.saturating_sub(1),
        };
        next = next.clamp(current_match + 1, self.last_log_index() + 1).max(1);
        debug!(node = self.id, peer = peer_id, next_index = next, "backing up next_index");
        self.next_index.insert(peer_id, next);
        Vec::new()
    }

    /// Handle an InstallSnapshot result (called by leader)
    pub fn handle_install_snapshot_result(
        &mut self,
        peer_id: NodeId,
        last_included_index: LogIndex,
        result: &InstallSnapshotResult,
    ) -> AppliedOutputs {
        if result.term > self.current_term {
            self.update_term(result.term);
            return Vec::new();
        }
        if self.role != NodeRole::Leader || !result.success {
            return Vec::new();
        }

        let new_match = self.match_index.get(&peer_id).copied().unwrap_or(0).max(last_included_index);
        self.match_index.insert(peer_id, new_match);
        self.next_index.insert(peer_id, new_match + 1);
        self.advance_commit_index()
    }

    /// (match_index, next_index) the leader tracks for `peer_id`
    pub fn peer_progress(&self, peer_id: NodeId) -> (LogIndex, LogIndex) {
        (
            self.match_index.get(&peer_id).copied().unwrap_or(0),
            self.next_index.get(&peer_id).copied().unwrap_or(0),
        )
    }

    /// Quorum members known to hold `index`, self included
    pub fn acks_for(&self, index: LogIndex) -> usize {
        let self_ack = (self.membership.is_quorum_member(self.id) && self.last_log_index() >= index) as usize;
        self_ack
            + self
                .match_index
                .iter()
                .filter(|(&peer, &matched)| matched >= index && self.membership.is_quorum_member(peer))
                .count()
    }

    /// Last index in the local log holding `term`, if any
    fn last_index_of_term(&self, term: Term) -> Option<LogIndex> {
        let first = self.log.first_index();
        let mut index = self.last_log_index();
        while index >= first {
            match self.log.term_at(index) {
                Some(t) if t == term => return Some(index),
                Some(t) if t < term => return None,
                _ => {}
            }
            index -= 1;
        }
        None
    }

    /// Advance commit_index to the highest current-term entry held by a quorum
    pub fn advance_commit_index(&mut self) -> AppliedOutputs {
        if self.role != NodeRole::Leader {
            return Vec::new();
        }

        let quorum = self.membership.quorum();
        let mut candidate = self.last_log_index();
        while candidate > self.commit_index {
            // Only entries from the current term commit by counting replicas
            if self.log.term_at(candidate) != Some(self.current_term) {
                break;
            }
            let replicated = self.acks_for(candidate);
            if replicated >= quorum {
                self.commit_index = candidate;
                info!(node = self.id, term = self.current_term, index = candidate, replicated, quorum, "committed entry");
                return self.apply_committed_entries();
            }
            candidate -= 1;
        }
        Vec::new()
    }

    // === Apply and snapshots ===

    /// Apply committed entries to the state machine, strictly in index order
    /// Returns (index, result) for each entry applied
    pub fn apply_committed_entries(&mut self) -> AppliedOutputs {
        let mut results = Vec::new();
        while self.last_applied < self.commit_index {
            let index = self.last_applied + 1;
            let entry = match self.log.get(index) {
                Ok(entry) => entry,
                Err(e) => {
                    error!(node = self.id, index, error = %e, "committed entry missing from log");
                    break;
                }
            };
            let result = self.state_machine.apply(&entry);
            if let Err(e) = &result {
                warn!(node = self.id, index, error = %e, "state machine rejected entry");
            }
            self.last_applied = index;
            results.push((index, result));
        }

        if self.config.snapshot_threshold > 0 {
            let since_snapshot = self.last_applied - self.snapshot_last_index();
            if since_snapshot >= self.config.snapshot_threshold {
                debug!(node = self.id, since_snapshot, "automatic snapshot triggered");
                if let Err(e) = self.take_snapshot() {
                    warn!(node = self.id, error = %e, "automatic snapshot failed");
                }
            }
        }

        results
    }

    /// Snapshot the state machine at last_applied and compact the log there
    /// Returns None if nothing was applied since the previous snapshot
    pub fn take_snapshot(&mut self) -> Result<Option<Snapshot>, ConsensusError> {
        if self.last_applied <= self.snapshot_last_index() {
            return Ok(None);
        }

        let term = self.log.term_at(self.last_applied).ok_or(StorageError::OutOfRange {
            index: self.last_applied,
            last_index: self.last_log_index(),
        })?;
        let data = self.state_machine.create_snapshot()?;
        let snapshot = Snapshot::new(self.last_applied, term, data);
        self.snapshots.save(snapshot.clone())?;
        self.log.compact(self.last_applied)?;
        self.prune_snapshots();

        info!(node = self.id, index = snapshot.last_included_index, term, "snapshot taken");
        Ok(Some(snapshot))
    }

    /// Keep only the configured number of most recent snapshots
    fn prune_snapshots(&mut self) {
        let snapshots = self.snapshots.list();
        let excess = snapshots.len().saturating_sub(self.config.snapshots_retained);
        for old in snapshots.iter().take(excess) {
            if let Err(e) = self.snapshots.delete(old.last_included_index) {
                warn!(node = self.id, error = %e, "failed to prune snapshot");
            }
        }
    }

    /// Read-only access to the state machine
    pub fn state_machine(&self) -> &dyn StateMachine {
        self.state_machine.as_ref()
    }
}
