//! Concurrency Controller (streaming variant).
//!
//! Speculative per-transaction execution followed by in-order commit
//! replay: each commit's reads (`Load{version}`) are re-checked against
//! the live store at commit time, and any commit whose reads have gone
//! stale is queued for redo rather than applied.
//!
//! Grounded on `resdb::contract::streaming::StreamingController`: the
//! per-address FIFO of pending commit ids (`commit_list_`), the
//! fixed-size `changes_list_`/`is_redo_` redo window, and the
//! `CheckCommit`/`CommitInternal` replay order all carry over. The
//! original's 128-bucket hash-sharded map over `commit_list_` was a
//! concurrency optimization for its own mutex-per-bucket scheme; a
//! `DashMap` already shards internally, so this controller keys
//! `commit_list` directly by address.
//!
//! **Open Question resolution**: the redo re-trigger window is bounded
//! at the source system's configured size (128 slots) and is preserved
//! here as a stated resource bound — under sustained load where more
//! than `window_size` commits are speculatively in flight at once, an
//! older commit's change set is silently overwritten by a newer one
//! sharing its slot. The source system runs with this same bound.

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use crate::storage::{Address, KvStorage};

/// Default redo-window size, matching the source system's configured
/// bound.
pub const DEFAULT_WINDOW_SIZE: usize = 128;

/// One speculative operation recorded against an address during a
/// transaction's execution.
#[derive(Clone, Debug)]
pub enum Op {
    /// A read, capturing the storage version observed at execution time.
    Load {
        /// The version read.
        version: u64,
    },
    /// A write.
    Store {
        /// The value written.
        data: Vec<u8>,
    },
    /// A deletion.
    Remove,
}

/// The per-commit speculative change set: every address touched, with
/// its ordered list of operations.
pub type ModifyMap = HashMap<Address, Vec<Op>>;

struct Slot {
    changes: ModifyMap,
    is_redo: bool,
}

/// Speculative-execution concurrency controller for one replica's
/// execution pipeline.
pub struct ConcurrencyController {
    window_size: usize,
    last_commit_id: AtomicI64,
    slots: Mutex<Vec<Slot>>,
    /// Per-address FIFO of commit ids with a pending change set against
    /// that address, oldest first.
    commit_list: DashMap<Address, VecDeque<i64>>,
    redo: Mutex<Vec<i64>>,
}

impl ConcurrencyController {
    /// Build a controller with the default 128-slot redo window.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW_SIZE)
    }

    /// Build a controller with an explicit redo-window size.
    pub fn with_window(window_size: usize) -> Self {
        let slots = (0..window_size).map(|_| Slot { changes: HashMap::new(), is_redo: false }).collect();
        Self {
            window_size,
            last_commit_id: AtomicI64::new(0),
            slots: Mutex::new(slots),
            commit_list: DashMap::new(),
            redo: Mutex::new(Vec::new()),
        }
    }

    fn slot_index(&self, commit_id: i64) -> usize {
        (commit_id as usize) % self.window_size
    }

    /// Record the speculative change set for a not-yet-committed
    /// transaction.
    pub fn push_commit(&self, commit_id: i64, changes: ModifyMap) {
        let idx = self.slot_index(commit_id);
        let mut slots = self.slots.lock();
        slots[idx].changes = changes;
        slots[idx].is_redo = false;
    }

    fn redo_commit(&self, commit_id: i64) {
        let idx = self.slot_index(commit_id);
        let mut slots = self.slots.lock();
        if slots[idx].is_redo {
            return;
        }
        slots[idx].is_redo = true;
        drop(slots);
        self.redo.lock().push(commit_id);
    }

    fn is_read(&self, address: &Address, commit_id: i64) -> bool {
        let idx = self.slot_index(commit_id);
        let slots = self.slots.lock();
        slots[idx].changes.get(address).map(|ops| ops.iter().any(|op| matches!(op, Op::Load { .. }))).unwrap_or(false)
    }

    fn check_first_commit(&self, address: &Address, commit_id: i64) -> bool {
        match self.commit_list.get(address) {
            Some(fifo) => fifo.front().map(|front| *front >= commit_id).unwrap_or(false),
            None => false,
        }
    }

    fn check_commit(&self, commit_id: i64, storage: &dyn KvStorage) -> bool {
        let idx = self.slot_index(commit_id);
        let addresses: Vec<Address> = {
            let slots = self.slots.lock();
            slots[idx].changes.keys().copied().collect()
        };
        for address in &addresses {
            if !self.check_first_commit(address, commit_id) {
                return false;
            }
            let ops = {
                let slots = self.slots.lock();
                slots[idx].changes.get(address).cloned().unwrap_or_default()
            };
            for op in &ops {
                if let Op::Load { version } = op {
                    if *version != storage.get_version(address) {
                        self.redo_commit(commit_id);
                        return false;
                    }
                }
            }
        }
        true
    }

    fn pop_fifo(&self, address: &Address) -> Option<i64> {
        let mut fifo = self.commit_list.get_mut(address)?;
        fifo.pop_front();
        fifo.front().copied()
    }

    fn remove_slot(&self, commit_id: i64) {
        let idx = self.slot_index(commit_id);
        let mut slots = self.slots.lock();
        slots[idx].changes.clear();
        slots[idx].is_redo = false;
    }

    fn commit_internal(&self, commit_id: i64, storage: &dyn KvStorage) -> bool {
        if !self.check_commit(commit_id, storage) {
            return false;
        }
        let idx = self.slot_index(commit_id);
        let change_set = {
            let slots = self.slots.lock();
            slots[idx].changes.clone()
        };
        if change_set.is_empty() {
            return false;
        }
        let last_commit_id = self.last_commit_id.load(Ordering::Acquire);
        let mut new_commit_ids = HashSet::new();
        for (address, ops) in &change_set {
            let mut applied = false;
            for op in ops.iter().rev() {
                match op {
                    Op::Load { .. } => continue,
                    Op::Store { data } => {
                        storage.store(address, data.clone());
                        applied = true;
                        break;
                    }
                    Op::Remove => {
                        storage.remove(address);
                        applied = true;
                        break;
                    }
                }
            }
            let next_commit_id = self.pop_fifo(address);
            if let Some(next) = next_commit_id {
                if next > 0 && next <= last_commit_id {
                    new_commit_ids.insert(next);
                } else if applied && next > last_commit_id && self.is_read(address, next) {
                    new_commit_ids.insert(next);
                }
            }
        }
        self.remove_slot(commit_id);
        for redo_id in new_commit_ids {
            self.redo_commit(redo_id);
        }
        true
    }

    /// Attempt to finalize `commit_id` in order: registers it onto each
    /// touched address's FIFO (if this is its first commit attempt),
    /// replays the change set against `storage` if the per-address
    /// ordering and read versions still check out, and advances
    /// `last_commit_id` when the transactions commit contiguously.
    /// Returns whether the commit was applied this call (a `false`
    /// return means it is queued for redo, recoverable via
    /// [`Self::redo_set`]).
    pub fn commit(&self, commit_id: i64, storage: &dyn KvStorage) -> bool {
        {
            let idx = self.slot_index(commit_id);
            let mut slots = self.slots.lock();
            slots[idx].is_redo = false;
        }
        let last_commit_id = self.last_commit_id.load(Ordering::Acquire);
        if commit_id > last_commit_id {
            let idx = self.slot_index(commit_id);
            let addresses: Vec<Address> = {
                let slots = self.slots.lock();
                slots[idx].changes.keys().copied().collect()
            };
            for address in addresses {
                self.commit_list.entry(address).or_insert_with(VecDeque::new).push_back(commit_id);
            }
        }
        self.redo.lock().clear();
        let applied = self.commit_internal(commit_id, storage);
        if commit_id == last_commit_id + 1 {
            self.last_commit_id.store(commit_id, Ordering::Release);
        }
        applied
    }

    /// Drain the set of commit ids queued for redo since the last
    /// [`Self::commit`] call.
    pub fn redo_set(&self) -> Vec<i64> {
        std::mem::take(&mut self.redo.lock())
    }

    /// The highest commit id applied contiguously from the start.
    pub fn last_commit_id(&self) -> i64 {
        self.last_commit_id.load(Ordering::Acquire)
    }
}

impl Default for ConcurrencyController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryStorage;

    #[test]
    fn commits_in_order_advance_last_commit_id_contiguously() {
        let storage = InMemoryStorage::new();
        let controller = ConcurrencyController::new();
        let addr = [5u8; 32];

        let mut changes = HashMap::new();
        changes.insert(addr, vec![Op::Store { data: b"v1".to_vec() }]);
        controller.push_commit(1, changes);
        assert!(controller.commit(1, &storage));
        assert_eq!(controller.last_commit_id(), 1);
    }

    #[test]
    fn stale_load_version_queues_a_redo_instead_of_committing() {
        let storage = InMemoryStorage::new();
        let controller = ConcurrencyController::new();
        let addr = [6u8; 32];

        // Another writer bumps the version after the speculative read.
        storage.store(&addr, b"external".to_vec());

        let mut changes = HashMap::new();
        changes.insert(addr, vec![Op::Load { version: 0 }, Op::Store { data: b"stale-write".to_vec() }]);
        controller.push_commit(1, changes);

        assert!(!controller.commit(1, &storage));
        assert_eq!(controller.redo_set(), vec![1]);
    }

    #[test]
    fn out_of_order_commit_waits_for_the_address_fifo_to_reach_it() {
        let storage = InMemoryStorage::new();
        let controller = ConcurrencyController::new();
        let addr = [7u8; 32];

        let mut changes1 = HashMap::new();
        changes1.insert(addr, vec![Op::Store { data: b"a".to_vec() }]);
        controller.push_commit(1, changes1);

        let mut changes2 = HashMap::new();
        changes2.insert(addr, vec![Op::Store { data: b"b".to_vec() }]);
        controller.push_commit(2, changes2);

        // Register both onto the FIFO via commit() attempts, commit 2
        // first: it should not apply because commit 1 is still ahead of
        // it in the per-address FIFO.
        assert!(!controller.commit(2, &storage));
        assert!(controller.commit(1, &storage));
    }

    #[test]
    fn redo_window_recycles_slots_at_the_configured_bound() {
        let storage = InMemoryStorage::new();
        let controller = ConcurrencyController::with_window(4);
        let addr = [8u8; 32];

        let mut changes = HashMap::new();
        changes.insert(addr, vec![Op::Store { data: b"slot0".to_vec() }]);
        controller.push_commit(0, changes.clone());
        controller.push_commit(4, changes); // same slot (4 % 4 == 0), overwrites slot 0

        assert!(controller.commit(4, &storage));
    }
}
