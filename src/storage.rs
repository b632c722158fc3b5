//! Key-Value Storage Adapter.
//!
//! The durable state the execution pipeline and concurrency controller
//! read and write: versioned values keyed by a 32-byte address, the same
//! shape `StreamingController`'s `DataStorage* storage_` collaborator
//! takes in the source system's contract executor.

use dashmap::DashMap;

/// A 32-byte account/object address.
pub type Address = [u8; 32];

/// Capability trait for versioned key-value storage.
///
/// Every successful `store`/`remove` bumps the address's version, so the
/// concurrency controller can detect a stale `Load` by comparing the
/// version it read against the current one. Required durable across
/// restarts when the backend is persistent (per `spec.md` §6); the core
/// itself does not assume durability for the correctness of a single run
/// — a concrete durable backend (LevelDB/RocksDB) is an external
/// collaborator out of scope for this crate.
pub trait KvStorage: Send + Sync {
    /// Current value, or `None` if never written.
    fn get(&self, address: &Address) -> Option<Vec<u8>>;

    /// Current version (0 if never written).
    fn get_version(&self, address: &Address) -> u64;

    /// Write `data`, bumping the version; returns the new version.
    fn store(&self, address: &Address, data: Vec<u8>) -> u64;

    /// Delete the value, bumping the version; returns the new version.
    fn remove(&self, address: &Address) -> u64;

    /// Every address currently holding a value, with its value and
    /// version. Unordered.
    fn get_all(&self) -> Vec<(Address, Vec<u8>, u64)>;

    /// Every stored entry whose address falls in `[lo, hi]` (inclusive,
    /// lexicographic on the address bytes).
    fn get_range(&self, lo: &Address, hi: &Address) -> Vec<(Address, Vec<u8>, u64)>;

    /// Flush any buffered writes to durable media. A no-op for a backend
    /// with no write buffering (e.g. the in-memory reference
    /// implementation); meaningful only for a persistent backend.
    fn flush(&self) -> crate::Result<()>;
}

/// In-memory reference implementation, used for tests and single-process
/// deployments.
#[derive(Default)]
pub struct InMemoryStorage {
    values: DashMap<Address, (Vec<u8>, u64)>,
}

impl InMemoryStorage {
    /// Build an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStorage for InMemoryStorage {
    fn get(&self, address: &Address) -> Option<Vec<u8>> {
        self.values.get(address).map(|v| v.0.clone())
    }

    fn get_version(&self, address: &Address) -> u64 {
        self.values.get(address).map(|v| v.1).unwrap_or(0)
    }

    fn store(&self, address: &Address, data: Vec<u8>) -> u64 {
        let mut entry = self.values.entry(*address).or_insert((Vec::new(), 0));
        entry.1 += 1;
        entry.0 = data;
        entry.1
    }

    fn remove(&self, address: &Address) -> u64 {
        if let Some(mut entry) = self.values.get_mut(address) {
            entry.1 += 1;
            entry.0.clear();
            return entry.1;
        }
        0
    }

    fn get_all(&self) -> Vec<(Address, Vec<u8>, u64)> {
        self.values.iter().map(|e| (*e.key(), e.value().0.clone(), e.value().1)).collect()
    }

    fn get_range(&self, lo: &Address, hi: &Address) -> Vec<(Address, Vec<u8>, u64)> {
        self.values
            .iter()
            .filter(|e| e.key() >= lo && e.key() <= hi)
            .map(|e| (*e.key(), e.value().0.clone(), e.value().1))
            .collect()
    }

    fn flush(&self) -> crate::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_bumps_version_and_updates_value() {
        let storage = InMemoryStorage::new();
        let addr = [1u8; 32];
        assert_eq!(storage.get_version(&addr), 0);
        let v1 = storage.store(&addr, b"a".to_vec());
        assert_eq!(v1, 1);
        let v2 = storage.store(&addr, b"b".to_vec());
        assert_eq!(v2, 2);
        assert_eq!(storage.get(&addr), Some(b"b".to_vec()));
    }

    #[test]
    fn remove_bumps_version_and_clears_value() {
        let storage = InMemoryStorage::new();
        let addr = [2u8; 32];
        storage.store(&addr, b"x".to_vec());
        let v = storage.remove(&addr);
        assert_eq!(v, 2);
        assert_eq!(storage.get(&addr), Some(vec![]));
    }

    #[test]
    fn get_range_is_inclusive_on_both_bounds() {
        let storage = InMemoryStorage::new();
        let mut low = [0u8; 32];
        low[31] = 1;
        let mut mid = [0u8; 32];
        mid[31] = 5;
        let mut high = [0u8; 32];
        high[31] = 9;
        storage.store(&low, b"lo".to_vec());
        storage.store(&mid, b"mid".to_vec());
        storage.store(&high, b"hi".to_vec());

        let ranged = storage.get_range(&low, &mid);
        assert_eq!(ranged.len(), 2);
        assert_eq!(storage.get_all().len(), 3);
        assert!(storage.flush().is_ok());
    }
}
