//! Replica configuration: a readable (TOML) text form enumerating
//! membership, the selected consensus protocol, batching/quorum/timeout
//! knobs, the signature scheme, and Raft's timer bounds.

use serde::{Deserialize, Serialize};

use crate::crypto::SignatureScheme;
use crate::identity::{ReplicaId, ReplicaIdentity, ReplicaTable, Role};
use crate::{ConsensusAlgorithm, ConsensusError, Result};

/// One entry of the `replicas` config table.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaEntry {
    /// Replica identifier.
    pub id: ReplicaId,
    /// Hostname or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
    /// Hex-encoded public key.
    pub public_key: String,
}

/// Full replica configuration, parsed from a TOML file.
///
/// Generalizes the ambient `ConsensusConfig`/`validate()` pattern to every
/// field named by the external-interfaces configuration format.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicaConfig {
    /// All replicas in the deployment.
    pub replicas: Vec<ReplicaEntry>,
    /// This process's own replica id.
    pub self_id: ReplicaId,
    /// Selected ordering-core protocol.
    ///
    /// The wire format accepts the full enumerated set from the source
    /// system (`hotstuff | tusk | raft | pbft | tendermint | pompe |
    /// slot_hs | ooohs`) for configuration compatibility, but only
    /// `hotstuff`, `tusk`, and `raft` select an implemented engine;
    /// anything else is rejected by `validate()`.
    pub consensus: String,
    /// Maximum requests per client batch.
    #[serde(default = "default_client_batch_num")]
    pub client_batch_num: u32,
    /// Maximum time to wait for a batch to fill, in milliseconds.
    #[serde(default)]
    pub client_batch_wait_ms: u64,
    /// Maximum in-flight (unacknowledged) requests before back-pressure.
    #[serde(default = "default_max_process_txn")]
    pub max_process_txn: u64,
    /// Replica-side quorum for accepting a certificate, default `2f+1`.
    pub min_data_receive_num: Option<usize>,
    /// Client-side quorum for sealing a response, default `f+1`.
    pub min_client_receive_num: Option<usize>,
    /// Per-request client timeout, in milliseconds.
    #[serde(default = "default_client_timeout_ms")]
    pub client_timeout_ms: u64,
    /// Signature scheme used by the crypto adapter.
    #[serde(default)]
    pub signature: SignatureScheme,
    /// Whether view-change / leader election is enabled.
    #[serde(default = "default_true")]
    pub view_change_enabled: bool,
    /// Raft/HotStuff minimum election timeout, in milliseconds.
    #[serde(default = "default_timeout_min_ms")]
    pub timeout_min_ms: u64,
    /// Raft/HotStuff maximum election timeout, in milliseconds.
    #[serde(default = "default_timeout_max_ms")]
    pub timeout_max_ms: u64,
    /// Leader/primary heartbeat interval, in milliseconds.
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
}

fn default_client_batch_num() -> u32 {
    100
}
fn default_max_process_txn() -> u64 {
    10_000
}
fn default_client_timeout_ms() -> u64 {
    100_000
}
fn default_true() -> bool {
    true
}
fn default_timeout_min_ms() -> u64 {
    1200
}
fn default_timeout_max_ms() -> u64 {
    2400
}
fn default_heartbeat_ms() -> u64 {
    100
}

impl ReplicaConfig {
    /// Parse a configuration from TOML source text.
    pub fn from_toml(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| ConsensusError::ConfigError(e.to_string()))
    }

    /// Validate the configuration, returning a `ConfigError` (fatal at
    /// startup, exit code 1) on any inconsistency.
    pub fn validate(&self) -> Result<()> {
        if self.replicas.len() < 3 {
            return Err(ConsensusError::ConfigError(
                "deployment must have at least 3 replicas".to_string(),
            ));
        }
        if !self.replicas.iter().any(|r| r.id == self.self_id) {
            return Err(ConsensusError::ConfigError(format!(
                "self_id {} not present in replicas",
                self.self_id
            )));
        }
        let algorithm = self.algorithm()?;
        let n = self.replicas.len();
        match algorithm {
            ConsensusAlgorithm::HotStuff | ConsensusAlgorithm::Tusk => {
                let f = crate::max_byzantine_bft(n);
                if f == 0 {
                    return Err(ConsensusError::ConfigError(
                        "BFT protocols require n ≥ 4 to tolerate f ≥ 1".to_string(),
                    ));
                }
            }
            ConsensusAlgorithm::Raft => {}
        }
        if self.timeout_min_ms >= self.timeout_max_ms {
            return Err(ConsensusError::ConfigError(
                "timeout_min_ms must be strictly less than timeout_max_ms".to_string(),
            ));
        }
        Ok(())
    }

    /// Resolve the `consensus` string to an implemented
    /// [`ConsensusAlgorithm`], or a `ConfigError` if it names a protocol
    /// this core does not implement (every protocol outside HotStuff/
    /// Tusk/Raft is a parametric variant of one of them, per scope).
    pub fn algorithm(&self) -> Result<ConsensusAlgorithm> {
        match self.consensus.as_str() {
            "hotstuff" => Ok(ConsensusAlgorithm::HotStuff),
            "tusk" => Ok(ConsensusAlgorithm::Tusk),
            "raft" => Ok(ConsensusAlgorithm::Raft),
            other => Err(ConsensusError::ConfigError(format!(
                "unimplemented consensus protocol '{other}': only hotstuff, tusk, and raft are \
                 implemented by this core (every other named protocol is a parametric variant)"
            ))),
        }
    }

    /// `min_data_receive_num`, defaulting to `2f+1` for the selected
    /// algorithm family.
    pub fn resolved_min_data_receive_num(&self) -> usize {
        self.min_data_receive_num.unwrap_or_else(|| {
            let n = self.replicas.len();
            match self.algorithm() {
                Ok(ConsensusAlgorithm::Raft) => crate::raft_quorum(n),
                _ => crate::bft_quorum(n),
            }
        })
    }

    /// `min_client_receive_num`, defaulting to `f+1`.
    pub fn resolved_min_client_receive_num(&self) -> usize {
        self.min_client_receive_num
            .unwrap_or_else(|| crate::max_byzantine_bft(self.replicas.len()) + 1)
    }

    /// Build the static [`ReplicaTable`] from this configuration.
    pub fn replica_table(&self) -> Result<ReplicaTable> {
        let identities = self
            .replicas
            .iter()
            .map(|r| ReplicaIdentity {
                node_id: r.id,
                role: Role::Replica,
                endpoint: format!("{}:{}", r.host, r.port),
                public_key: r.public_key.clone(),
            })
            .collect();
        ReplicaTable::new(identities, self.self_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_toml(consensus: &str) -> String {
        format!(
            r#"
self_id = 1
consensus = "{consensus}"

[[replicas]]
id = 1
host = "127.0.0.1"
port = 9001
public_key = "pk1"

[[replicas]]
id = 2
host = "127.0.0.1"
port = 9002
public_key = "pk2"

[[replicas]]
id = 3
host = "127.0.0.1"
port = 9003
public_key = "pk3"

[[replicas]]
id = 4
host = "127.0.0.1"
port = 9004
public_key = "pk4"
"#
        )
    }

    #[test]
    fn parses_and_validates_a_minimal_hotstuff_config() {
        let cfg = ReplicaConfig::from_toml(&sample_toml("hotstuff")).unwrap();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.algorithm().unwrap(), ConsensusAlgorithm::HotStuff);
        assert_eq!(cfg.client_batch_num, 100);
        assert_eq!(cfg.timeout_min_ms, 1200);
        assert_eq!(cfg.timeout_max_ms, 2400);
    }

    #[test]
    fn rejects_unknown_consensus_protocol() {
        let cfg = ReplicaConfig::from_toml(&sample_toml("pbft")).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_self_id_missing_from_replica_table() {
        let mut text = sample_toml("raft");
        text = text.replace("self_id = 1", "self_id = 99");
        let cfg = ReplicaConfig::from_toml(&text).unwrap();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn default_min_data_receive_num_is_two_f_plus_one_for_bft() {
        let cfg = ReplicaConfig::from_toml(&sample_toml("hotstuff")).unwrap();
        assert_eq!(cfg.resolved_min_data_receive_num(), 3);
        assert_eq!(cfg.resolved_min_client_receive_num(), 2);
    }
}
