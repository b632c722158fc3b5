//! Static replica/validator table with reputation scoring.
//!
//! Membership is fixed for the deployment's lifetime — per `spec.md`
//! Non-goals, "no dynamic membership changes" — so unlike the teacher's
//! `ValidatorSet`, this table has no `add_validator`/`remove_validator`/
//! `rotate_validators`. It is built once, from [`crate::identity::ReplicaTable`],
//! and thereafter only its reputation bookkeeping mutates: per-validator
//! metrics and the Byzantine flag, both local observations rather than a
//! membership edit.

use crate::{ConsensusError, Result};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

/// Validator reputation metrics
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ValidatorMetrics {
    /// Messages successfully validated
    pub valid_messages: u64,
    /// Messages with invalid signatures
    pub invalid_signatures: u64,
    /// Byzantine behaviors detected
    pub byzantine_behaviors: u64,
    /// Uptime percentage (0-100)
    pub uptime: u8,
    /// Average response time in milliseconds
    pub avg_response_time_ms: u64,
}

impl ValidatorMetrics {
    /// Compute reputation score (0.0-1.0)
    pub fn reputation_score(&self) -> f64 {
        let total = self.valid_messages + self.invalid_signatures + self.byzantine_behaviors;
        if total == 0 {
            0.5 // Neutral score for new validators
        } else {
            let valid_ratio = self.valid_messages as f64 / total as f64;
            let uptime_factor = (self.uptime as f64) / 100.0;
            (valid_ratio * 0.7 + uptime_factor * 0.3).clamp(0.0, 1.0)
        }
    }

    /// Is validator healthy
    pub fn is_healthy(&self) -> bool {
        self.reputation_score() >= 0.7 && self.uptime >= 80 && self.byzantine_behaviors == 0
    }
}

impl Default for ValidatorMetrics {
    fn default() -> Self {
        ValidatorMetrics {
            valid_messages: 0,
            invalid_signatures: 0,
            byzantine_behaviors: 0,
            uptime: 100,
            avg_response_time_ms: 0,
        }
    }
}

/// Reputation state tracked per fixed validator slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorInfo {
    /// Node ID, as assigned in the replica table.
    pub node_id: crate::ReplicaId,
    /// Performance metrics
    pub metrics: ValidatorMetrics,
    /// Marked Byzantine by local fault detection; membership itself is
    /// unaffected, but protocol logic may discount this replica's votes.
    pub marked_byzantine: bool,
    /// Last activity timestamp
    pub last_activity_ms: u64,
}

impl ValidatorInfo {
    fn new(node_id: crate::ReplicaId) -> Self {
        ValidatorInfo {
            node_id,
            metrics: ValidatorMetrics::default(),
            marked_byzantine: false,
            last_activity_ms: 0,
        }
    }

    /// Update activity timestamp
    pub fn touch(&mut self) {
        self.last_activity_ms = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
    }
}

/// Fixed validator table: one reputation slot per member of the replica
/// table, built once at startup and never resized.
#[derive(Debug, Clone)]
pub struct ValidatorSet {
    validators: Arc<DashMap<crate::ReplicaId, ValidatorInfo>>,
}

impl ValidatorSet {
    /// Build a reputation slot for every member of `table`.
    pub fn from_replica_table(table: &crate::identity::ReplicaTable) -> Self {
        let validators = Arc::new(DashMap::new());
        for id in table.ids() {
            validators.insert(id, ValidatorInfo::new(id));
        }
        ValidatorSet { validators }
    }

    /// Get a validator's reputation state.
    pub fn get(&self, node_id: crate::ReplicaId) -> Option<ValidatorInfo> {
        self.validators.get(&node_id).map(|v| v.clone())
    }

    /// All reputation slots.
    pub fn all(&self) -> Vec<ValidatorInfo> {
        self.validators.iter().map(|e| e.value().clone()).collect()
    }

    /// Mark a validator as having exhibited Byzantine behavior. This is a
    /// local observation, not a membership change: the replica is never
    /// removed from the fixed table.
    pub fn mark_byzantine(&self, node_id: crate::ReplicaId) -> Result<()> {
        if let Some(mut validator) = self.validators.get_mut(&node_id) {
            validator.metrics.byzantine_behaviors += 1;
            validator.marked_byzantine = true;
            warn!(
                validator_id = node_id,
                byzantine_count = validator.metrics.byzantine_behaviors,
                "validator marked as Byzantine"
            );
            Ok(())
        } else {
            Err(ConsensusError::ProtocolViolation(format!(
                "validator {} not in replica table",
                node_id
            )))
        }
    }

    /// Update a validator's reputation metrics.
    pub fn update_metrics(&self, node_id: crate::ReplicaId, metrics: ValidatorMetrics) -> Result<()> {
        if let Some(mut validator) = self.validators.get_mut(&node_id) {
            validator.metrics = metrics;
            validator.touch();
            Ok(())
        } else {
            Err(ConsensusError::ProtocolViolation(format!(
                "validator {} not in replica table",
                node_id
            )))
        }
    }

    /// Node ids that have been locally marked Byzantine.
    pub fn identify_byzantine(&self) -> Vec<crate::ReplicaId> {
        self.validators
            .iter()
            .filter(|e| e.value().marked_byzantine)
            .map(|e| *e.key())
            .collect()
    }

    /// Total number of validators (fixed for the table's lifetime).
    pub fn validator_count(&self) -> usize {
        self.validators.len()
    }

    /// Health snapshot of the validator table.
    pub fn health(&self) -> ValidatorSetHealth {
        ValidatorSetHealth {
            total_validators: self.validators.len(),
            byzantine_validators: self.identify_byzantine().len(),
        }
    }
}

/// Validator set health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatorSetHealth {
    /// Total validators
    pub total_validators: usize,
    /// Byzantine validators
    pub byzantine_validators: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ReplicaIdentity, ReplicaTable};

    fn table(n: u32) -> ReplicaTable {
        let members = (1..=n)
            .map(|i| ReplicaIdentity::new(i, format!("127.0.0.1:{}", 9000 + i), format!("pk{i}")))
            .collect();
        ReplicaTable::new(members, 1).unwrap()
    }

    #[test]
    fn reputation_starts_neutral() {
        let set = ValidatorSet::from_replica_table(&table(4));
        assert_eq!(set.validator_count(), 4);
        assert_eq!(set.get(1).unwrap().metrics.reputation_score(), 0.5);
    }

    #[test]
    fn byzantine_marking_does_not_shrink_table() {
        let set = ValidatorSet::from_replica_table(&table(4));
        set.mark_byzantine(1).unwrap();
        assert_eq!(set.validator_count(), 4);
        assert_eq!(set.identify_byzantine(), vec![1]);
    }

    #[test]
    fn marking_unknown_validator_is_a_protocol_violation() {
        let set = ValidatorSet::from_replica_table(&table(4));
        assert!(set.mark_byzantine(99).is_err());
    }
}
