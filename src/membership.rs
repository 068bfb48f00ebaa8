//! Cluster membership and quorum arithmetic

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::types::NodeId;

/// Errors from membership table lookups
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MembershipError {
    #[error("member {0} not found")]
    MemberNotFound(NodeId),
}

/// Whether a member takes part in elections and commit decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberRole {
    Voter,
    /// Receives the log but never votes or counts toward commits
    NonVoter,
    /// Catching up before promotion; receives the log only
    Learner,
}

/// Liveness as reported by the operator or an external failure detector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemberStatus {
    Alive,
    Suspect,
    Dead,
}

/// A cluster member
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: NodeId,
    pub address: String,
    pub role: MemberRole,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

impl Member {
    /// An alive voter joining now
    pub fn voter(id: NodeId, address: impl Into<String>) -> Self {
        Member {
            id,
            address: address.into(),
            role: MemberRole::Voter,
            status: MemberStatus::Alive,
            joined_at: Utc::now(),
        }
    }

    pub fn with_role(mut self, role: MemberRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_status(mut self, status: MemberStatus) -> Self {
        self.status = status;
        self
    }

    /// Only alive voters count toward quorum
    pub fn counts_for_quorum(&self) -> bool {
        self.role == MemberRole::Voter && self.status == MemberStatus::Alive
    }
}

/// Peers known to a node, including the node itself
///
/// Quorum is recomputed from the current table on every call, so it always
/// reflects the latest role and status changes.
#[derive(Debug, Clone, Default)]
pub struct MembershipTable {
    members: BTreeMap<NodeId, Member>,
}

impl MembershipTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Table of alive voters with empty addresses, for in-process clusters
    pub fn with_voters(ids: impl IntoIterator<Item = NodeId>) -> Self {
        let mut table = Self::new();
        for id in ids {
            table.add_member(Member::voter(id, ""));
        }
        table
    }

    /// Insert or replace a member
    pub fn add_member(&mut self, member: Member) {
        self.members.insert(member.id, member);
    }

    pub fn remove_member(&mut self, id: NodeId) -> Result<Member, MembershipError> {
        self.members.remove(&id).ok_or(MembershipError::MemberNotFound(id))
    }

    pub fn get_member(&self, id: NodeId) -> Result<&Member, MembershipError> {
        self.members.get(&id).ok_or(MembershipError::MemberNotFound(id))
    }

    /// All members ordered by id
    pub fn members(&self) -> Vec<Member> {
        self.members.values().cloned().collect()
    }

    pub fn set_status(&mut self, id: NodeId, status: MemberStatus) -> Result<(), MembershipError> {
        let member = self.members.get_mut(&id).ok_or(MembershipError::MemberNotFound(id))?;
        member.status = status;
        Ok(())
    }

    pub fn set_role(&mut self, id: NodeId, role: MemberRole) -> Result<(), MembershipError> {
        let member = self.members.get_mut(&id).ok_or(MembershipError::MemberNotFound(id))?;
        member.role = role;
        Ok(())
    }

    /// Ids of every member other than `self_id`, voters or not
    pub fn peers_of(&self, self_id: NodeId) -> Vec<NodeId> {
        self.members.keys().copied().filter(|&id| id != self_id).collect()
    }

    /// Ids of every member with the voter role, alive or not
    pub fn voters(&self) -> Vec<NodeId> {
        self.members
            .values()
            .filter(|m| m.role == MemberRole::Voter)
            .map(|m| m.id)
            .collect()
    }

    /// True if `id` is an alive voter
    pub fn is_quorum_member(&self, id: NodeId) -> bool {
        self.members.get(&id).is_some_and(Member::counts_for_quorum)
    }

    /// True if `id` may stand for election
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members.get(&id).is_some_and(|m| m.role == MemberRole::Voter)
    }

    /// Number of members that count toward quorum
    pub fn alive_voters(&self) -> usize {
        self.members.values().filter(|m| m.counts_for_quorum()).count()
    }

    /// floor(alive_voters / 2) + 1
    pub fn quorum(&self) -> usize {
        self.alive_voters() / 2 + 1
    }

    /// Count how many of `ids` are alive voters
    pub fn count_quorum_members<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> usize {
        ids.into_iter().filter(|id| self.is_quorum_member(**id)).count()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
