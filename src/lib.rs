//! ResilientDB consensus core.
//!
//! A family of Byzantine Fault Tolerant ordering engines — chained-HotStuff
//! (leader-based, pipelined), Tusk (DAG-based), and Raft (crash-fault leader
//! election) — sharing one data model, one transport/crypto adapter layer,
//! one batching/response manager, one concurrency controller, and one
//! execution pipeline.
//!
//! # Architecture
//!
//! - **chained-HotStuff**: 4-phase pipelined BFT consensus with linear
//!   communication complexity.
//! - **Tusk**: DAG-based mempool and ordering, commits every two rounds.
//! - **Raft**: crash-fault leader election and log replication.
//! - **Concurrency controller**: speculative execution with redo-on-conflict.
//! - **Execution pipeline**: deterministic, in-order delivery to an external
//!   executor.

#![warn(missing_docs)]
#![warn(unused_crate_dependencies)]

pub mod batching;
pub mod byzantine;
pub mod concurrency;
pub mod config;
pub mod crypto;
pub mod execution;
pub mod hotstuff;
pub mod identity;
pub mod message;
pub mod raft;
pub mod replica;
pub mod state;
pub mod stats;
pub mod storage;
pub mod transport;
pub mod tusk;
pub mod validator;

pub use batching::{BatchingManager, ResponseTracker};
pub use concurrency::{ConcurrencyController, Op};
pub use config::ReplicaConfig;
pub use execution::Executor;
pub use hotstuff::{HotStuffEngine, ProposalNode, QuorumCertificate, ViewNumber};
pub use identity::{ReplicaId, ReplicaIdentity, ReplicaTable, Role};
pub use raft::{RaftEngine, RaftRole};
pub use replica::Replica;
pub use transport::ReplicaCommunicator;
pub use tusk::TuskEngine;

use thiserror::Error;

/// Crate version, forwarded from `Cargo.toml`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum Byzantine-faulty replicas tolerated by a BFT engine of `n`
/// replicas: `f = ⌊(n−1)/3⌋`.
pub fn max_byzantine_bft(total_nodes: usize) -> usize {
    (total_nodes.saturating_sub(1)) / 3
}

/// Maximum crashed replicas tolerated by the Raft engine of `n` replicas:
/// `f = ⌊(n−1)/2⌋`.
pub fn max_crash_raft(total_nodes: usize) -> usize {
    (total_nodes.saturating_sub(1)) / 2
}

/// BFT quorum size for `n` replicas: `2f+1`.
pub fn bft_quorum(total_nodes: usize) -> usize {
    2 * max_byzantine_bft(total_nodes) + 1
}

/// Raft majority quorum size for `n` replicas: `⌊n/2⌋+1`.
pub fn raft_quorum(total_nodes: usize) -> usize {
    total_nodes / 2 + 1
}

/// The three ordering-core protocol families this crate implements.
///
/// The source system also contains PBFT, Tendermint, Pompe, Slot-HotStuff,
/// and Out-of-Order-HotStuff variants; each is a parametric variant of one
/// of these three families and is not separately implemented here.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusAlgorithm {
    /// Chained-HotStuff: leader-based, pipelined BFT consensus.
    HotStuff,
    /// Tusk: DAG-based mempool and ordering.
    Tusk,
    /// Raft: crash-fault leader election and log replication.
    Raft,
}

/// Error kinds surfaced by the consensus core.
///
/// Named after the kinds in the error handling design, not concrete source
/// exception types. `ConfigError` is fatal at startup; everything from
/// `CryptoError` through `QuorumTimeout` is recovered locally or surfaced to
/// the client as a failure without aborting the replica.
#[derive(Debug, Error)]
pub enum ConsensusError {
    /// Bad config or missing keys. Fatal at startup.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Signature verification failure. Message dropped, counter incremented.
    #[error("cryptographic verification failed: {0}")]
    CryptoError(String),

    /// Send failure, retried up to the adapter's retry bound before
    /// surfacing to the batching manager.
    #[error("transport error: {0}")]
    TransportError(String),

    /// Out-of-range view, stale message, duplicate sender, or insufficient
    /// quorum. Message dropped, never fatal.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Executor returned non-ok. Response still carries a failure
    /// indicator; the commit itself still stands.
    #[error("executor error: {0}")]
    ExecutorError(String),

    /// Quorum not reached within the view/term timeout. Triggers
    /// view-change or re-election.
    #[error("quorum timeout: {0}")]
    QuorumTimeout(String),

    /// Underlying I/O failure from the transport layer.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failure of a wire message.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

/// Result type for consensus core operations.
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Process exit codes for replica binaries hosting this core.
///
/// `0` is normal shutdown, `1` is a configuration error, `2` is an
/// unrecoverable cryptographic failure at startup; everything else is
/// logged and does not terminate the replica.
pub mod exit_code {
    /// Normal shutdown.
    pub const OK: i32 = 0;
    /// Configuration error.
    pub const CONFIG_ERROR: i32 = 1;
    /// Unrecoverable cryptographic failure at startup.
    pub const CRYPTO_FAILURE: i32 = 2;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bft_fault_tolerance_matches_floor_n_minus_1_over_3() {
        assert_eq!(max_byzantine_bft(4), 1);
        assert_eq!(max_byzantine_bft(7), 2);
        assert_eq!(bft_quorum(4), 3);
    }

    #[test]
    fn raft_fault_tolerance_matches_floor_n_minus_1_over_2() {
        assert_eq!(max_crash_raft(5), 2);
        assert_eq!(raft_quorum(5), 3);
    }

    #[test]
    fn consensus_algorithm_round_trips_through_serde() {
        let encoded = serde_json::to_string(&ConsensusAlgorithm::Tusk).unwrap();
        assert_eq!(encoded, "\"tusk\"");
        let decoded: ConsensusAlgorithm = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, ConsensusAlgorithm::Tusk);
    }
}
