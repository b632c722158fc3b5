//! Replica identity and the static membership table.
//!
//! An identity is an immutable tuple set at startup and valid for the
//! process lifetime. Membership is fixed for the life of a deployment —
//! per the core's Non-goals, there is no dynamic reconfiguration.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::{bft_quorum, max_byzantine_bft, max_crash_raft, raft_quorum};

/// Numeric identifier of a replica, stable for the deployment's lifetime.
pub type ReplicaId = u32;

/// The role a participant plays in the system.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A client submitting requests through a proxy replica.
    Client,
    /// A consensus-participating replica.
    Replica,
}

/// An immutable replica identity: `{node_id, role, endpoint}`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReplicaIdentity {
    /// Stable numeric identifier.
    pub node_id: ReplicaId,
    /// Client or replica.
    pub role: Role,
    /// Network endpoint, `host:port`.
    pub endpoint: String,
    /// Public key used to verify this replica's signatures, hex-encoded.
    pub public_key: String,
}

impl ReplicaIdentity {
    /// Construct a new replica identity.
    pub fn new(node_id: ReplicaId, endpoint: impl Into<String>, public_key: impl Into<String>) -> Self {
        Self {
            node_id,
            role: Role::Replica,
            endpoint: endpoint.into(),
            public_key: public_key.into(),
        }
    }
}

/// The fixed set of replicas participating in consensus, plus the derived
/// fault-tolerance and quorum constants for both the BFT and Raft families.
#[derive(Clone, Debug)]
pub struct ReplicaTable {
    members: BTreeMap<ReplicaId, ReplicaIdentity>,
    self_id: ReplicaId,
}

impl ReplicaTable {
    /// Build a replica table from an explicit membership list and the
    /// local node's id. `self_id` must be present in `members`.
    pub fn new(members: Vec<ReplicaIdentity>, self_id: ReplicaId) -> crate::Result<Self> {
        let map: BTreeMap<ReplicaId, ReplicaIdentity> =
            members.into_iter().map(|m| (m.node_id, m)).collect();
        if !map.contains_key(&self_id) {
            return Err(crate::ConsensusError::ConfigError(format!(
                "self_id {self_id} not present in replica table"
            )));
        }
        Ok(Self { members: map, self_id })
    }

    /// Total number of replicas, `n`.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// Whether the table is empty (never true for a validated config).
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// This process's own node id.
    pub fn self_id(&self) -> ReplicaId {
        self.self_id
    }

    /// Look up a replica's identity.
    pub fn get(&self, id: ReplicaId) -> Option<&ReplicaIdentity> {
        self.members.get(&id)
    }

    /// All replica ids, ascending.
    pub fn ids(&self) -> impl Iterator<Item = ReplicaId> + '_ {
        self.members.keys().copied()
    }

    /// All replica identities, in ascending id order.
    pub fn identities(&self) -> impl Iterator<Item = &ReplicaIdentity> {
        self.members.values()
    }

    /// Maximum Byzantine-faulty replicas tolerated, `f = ⌊(n−1)/3⌋`.
    pub fn max_byzantine(&self) -> usize {
        max_byzantine_bft(self.len())
    }

    /// Maximum crashed replicas tolerated by Raft, `f = ⌊(n−1)/2⌋`.
    pub fn max_crash(&self) -> usize {
        max_crash_raft(self.len())
    }

    /// BFT quorum size, `2f+1`.
    pub fn bft_quorum(&self) -> usize {
        bft_quorum(self.len())
    }

    /// Raft majority quorum size, `⌊n/2⌋+1`.
    pub fn raft_quorum(&self) -> usize {
        raft_quorum(self.len())
    }

    /// The primary/leader of BFT view `v`: `(v−1) mod n + 1`.
    pub fn bft_primary(&self, view: u64) -> ReplicaId {
        let n = self.len() as u64;
        (((view.saturating_sub(1)) % n) + 1) as ReplicaId
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(n: u32) -> ReplicaTable {
        let members = (1..=n)
            .map(|i| ReplicaIdentity::new(i, format!("127.0.0.1:{}", 9000 + i), format!("pk{i}")))
            .collect();
        ReplicaTable::new(members, 1).unwrap()
    }

    #[test]
    fn rejects_self_id_not_in_membership() {
        let members = vec![ReplicaIdentity::new(1, "a", "pk1")];
        assert!(ReplicaTable::new(members, 42).is_err());
    }

    #[test]
    fn derives_quorum_and_fault_tolerance_for_four_replicas() {
        let t = table(4);
        assert_eq!(t.max_byzantine(), 1);
        assert_eq!(t.bft_quorum(), 3);
        assert_eq!(t.max_crash(), 1);
        assert_eq!(t.raft_quorum(), 3);
    }

    #[test]
    fn bft_primary_rotates_mod_n() {
        let t = table(4);
        assert_eq!(t.bft_primary(1), 1);
        assert_eq!(t.bft_primary(4), 4);
        assert_eq!(t.bft_primary(5), 1);
    }
}
