//! `TxStore`: slot allocation, the committing-transactions bitmap,
//! commit/rollback/savepoint application, prepared-transaction lookup
//! by name, and crash recovery.
//!
//! Narrowed from the distilled contract in one respect: a real
//! transaction store manages arbitrarily many heterogeneous maps
//! behind one shared undo log (the original keeps the undo entry's
//! value as an untyped `Object`). Modeling that in Rust needs type
//! erasure (`Box<dyn Any>`) that buys nothing for this crate's test
//! surface, so `TxStore<K, V>` here owns exactly one `Substrate<K, V>`
//! and one undo-log family. Multi-map snapshot coherence is still
//! available at the [`crate::snapshot::acquire_multi`] level for
//! callers who stand up several stores side by side.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;

use fsqlite_error::{FrankenError, Result};

use crate::bitset::VersionedBitSet;
use crate::config::StoreConfig;
use crate::opid::make_op_id;
use crate::substrate::Substrate;
use crate::transaction::{Isolation, Transaction, TransactionLookup};
use crate::undo::UndoLog;
use crate::versioned_value::VersionedCell;

/// Tracks how many callers currently hold a pinned reference to some
/// map-root version (see [`Transaction::mark_statement_start`]). This
/// reference substrate reclaims old versions simply by dropping the
/// last `Arc` to them, so the counter here is observability only —
/// nothing reads it to decide when to free anything.
#[derive(Debug, Default)]
pub struct VersionTracker {
    active: Arc<AtomicU64>,
}

impl VersionTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn register_version_usage(&self) -> TxCounterGuard {
        self.active.fetch_add(1, Ordering::AcqRel);
        TxCounterGuard { active: Arc::clone(&self.active) }
    }

    #[must_use]
    pub fn active_count(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }
}

/// RAII pin obtained from [`VersionTracker::register_version_usage`].
#[derive(Debug)]
pub struct TxCounterGuard {
    active: Arc<AtomicU64>,
}

impl Drop for TxCounterGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Which slots ended up committed vs rolled back during [`TxStore::recover`].
#[derive(Debug, Default, Clone)]
pub struct RecoveryReport {
    pub committed_slots: Vec<u32>,
    pub rolled_back_slots: Vec<u32>,
}

struct SlotTable {
    slots: Vec<Option<Arc<Transaction>>>,
}

/// The shared transaction manager for one `Substrate<K, V>`.
pub struct TxStore<K, V> {
    config: StoreConfig,
    substrate: Substrate<K, V>,
    committing: ArcSwap<VersionedBitSet>,
    slots: Mutex<SlotTable>,
    undo_logs: Vec<UndoLog<K, V>>,
    prepared: Mutex<HashMap<String, u32>>,
    next_sequence: AtomicU64,
    version_tracker: VersionTracker,
}

impl<K, V> TxStore<K, V>
where
    K: Ord + Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(config: StoreConfig) -> Self {
        let max_slots = config.max_slots();
        let mut slots = Vec::with_capacity(max_slots as usize + 1);
        slots.resize_with(max_slots as usize + 1, || None);
        let mut undo_logs = Vec::with_capacity(max_slots as usize + 1);
        undo_logs.resize_with(max_slots as usize + 1, UndoLog::new);
        Self {
            config,
            substrate: Substrate::new(),
            committing: ArcSwap::from_pointee(VersionedBitSet::empty(max_slots as usize + 1)),
            slots: Mutex::new(SlotTable { slots }),
            undo_logs,
            prepared: Mutex::new(HashMap::new()),
            next_sequence: AtomicU64::new(1),
            version_tracker: VersionTracker::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn substrate(&self) -> &Substrate<K, V> {
        &self.substrate
    }

    #[must_use]
    pub fn committing_bitmap(&self) -> &ArcSwap<VersionedBitSet> {
        &self.committing
    }

    #[must_use]
    pub fn version_tracker(&self) -> &VersionTracker {
        &self.version_tracker
    }

    pub(crate) fn undo_log_for(&self, slot_id: u32) -> &UndoLog<K, V> {
        &self.undo_logs[slot_id as usize]
    }

    /// Open a new transaction, assigning it the lowest free slot.
    pub fn begin(&self, owner_id: u64, isolation: Isolation, timeout_millis: i64) -> Result<Arc<Transaction>> {
        let mut table = self.slots.lock();
        let max = self.config.max_slots();
        let found = (1..=max).find(|&candidate| table.slots[candidate as usize].is_none());
        let Some(slot_id) = found else {
            return Err(FrankenError::TooManyOpenTransactions { max_slots: max });
        };
        let sequence_num = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let tx = Arc::new(Transaction::new(slot_id, sequence_num, owner_id, timeout_millis, isolation));
        table.slots[slot_id as usize] = Some(Arc::clone(&tx));
        drop(table);
        tracing::debug!(slot_id, sequence_num, owner_id, ?isolation, "transaction opened");
        Ok(tx)
    }

    fn release_slot(&self, slot_id: u32) {
        let mut table = self.slots.lock();
        if let Some(tx) = table.slots[slot_id as usize].take() {
            if let Some(name) = tx.name() {
                self.prepared.lock().remove(&name);
            }
        }
    }

    pub fn prepare(&self, tx: &Arc<Transaction>) -> Result<()> {
        tx.prepare()?;
        tracing::debug!(slot_id = tx.slot_id, "transaction prepared");
        Ok(())
    }

    /// Register `tx` under `name` so a later `find_prepared` (after a
    /// crash and [`Self::recover`]) can locate it again for an
    /// external transaction manager to resolve.
    pub fn set_prepared_name(&self, tx: &Arc<Transaction>, name: impl Into<String>) -> Result<()> {
        let name = name.into();
        tx.set_name(name.clone());
        self.prepared.lock().insert(name, tx.slot_id);
        Ok(())
    }

    #[must_use]
    pub fn find_prepared(&self, name: &str) -> Option<Arc<Transaction>> {
        let slot = *self.prepared.lock().get(name)?;
        self.get_transaction(slot)
    }

    fn set_committing_bit(&self, slot_id: u32, value: bool) {
        loop {
            let current = self.committing.load_full();
            let updated = if value { current.with_set(slot_id as usize) } else { current.with_clear(slot_id as usize) };
            let updated = Arc::new(updated);
            let prev = self.committing.compare_and_swap(&current, updated);
            if Arc::ptr_eq(&prev, &current) {
                return;
            }
        }
    }

    /// If the live cell at `key` is still owned by `slot_id` (the
    /// common case — nobody else may touch another transaction's
    /// uncommitted cell), promote it to committed using its `current`
    /// value, or erase it entirely if `current` is `None` (a deleted
    /// key reaching commit).
    fn promote_key(&self, slot_id: u32, key: &K) {
        let root = self.substrate.root();
        if let Some(cell) = Substrate::get(&root, key) {
            if cell.owner_slot() == Some(slot_id) {
                match cell.current {
                    Some(v) => self.substrate.force_put(key.clone(), VersionedCell::committed(v)),
                    None => self.substrate.force_remove(key),
                }
            }
        }
    }

    /// Commit `tx`: set its committing bit so concurrent readers see
    /// its writes as resolved, rewrite every key it touched to a
    /// committed cell, then clear the bit and close the transaction.
    pub fn commit(&self, tx: &Arc<Transaction>) -> Result<()> {
        self.set_committing_bit(tx.slot_id, true);
        let undo = self.undo_log_for(tx.slot_id);
        undo.mark_committing();

        let mut seen = HashSet::new();
        for (_, record) in undo.iter_asc() {
            if record.is_commit_marker() {
                continue;
            }
            if let Some(key) = record.key {
                if seen.insert(key.clone()) {
                    self.promote_key(tx.slot_id, &key);
                }
            }
        }

        tx.mark_committed()?;
        undo.clear();
        self.set_committing_bit(tx.slot_id, false);
        tx.mark_closed()?;
        self.release_slot(tx.slot_id);
        tracing::info!(slot_id = tx.slot_id, "transaction committed");
        Ok(())
    }

    /// Undo log ids in `[to_log_id, from_log_id)` for `slot_id`,
    /// newest first, restoring each key's prior cell (or removing it
    /// if the key did not exist before).
    fn apply_undo_range(&self, slot_id: u32, from_log_id_exclusive: u64, to_log_id_floor: u64) {
        if from_log_id_exclusive == 0 {
            return;
        }
        let undo = self.undo_log_for(slot_id);
        let from_op = make_op_id(slot_id, from_log_id_exclusive - 1);
        let to_op = make_op_id(slot_id, to_log_id_floor).wrapping_sub(1);
        for (op_id, record) in undo.iter_desc_from(from_op, to_op) {
            if record.is_commit_marker() {
                continue;
            }
            if let Some(key) = &record.key {
                match &record.old_value {
                    Some(old_cell) => self.substrate.force_put(key.clone(), old_cell.clone()),
                    None => self.substrate.force_remove(key),
                }
            }
            undo.remove(op_id);
        }
    }

    /// Full rollback: undo every record the transaction made, close it,
    /// and free its slot.
    pub fn rollback(&self, tx: &Arc<Transaction>) -> Result<()> {
        self.apply_undo_range(tx.slot_id, tx.log_id(), 0);
        tx.mark_rolled_back()?;
        self.undo_log_for(tx.slot_id).clear();
        tx.mark_closed()?;
        self.release_slot(tx.slot_id);
        tracing::info!(slot_id = tx.slot_id, "transaction rolled back");
        Ok(())
    }

    /// Roll back to a savepoint obtained from [`Transaction::savepoint`],
    /// leaving the transaction `Open` and able to continue.
    pub fn rollback_to_savepoint(&self, tx: &Arc<Transaction>, savepoint_log_id: u64) -> Result<()> {
        let current_log_id = tx.begin_savepoint_rollback()?;
        self.apply_undo_range(tx.slot_id, current_log_id, savepoint_log_id);
        tx.end_savepoint_rollback(savepoint_log_id)
    }

    /// Scan every slot's undo log for leftover entries from before a
    /// restart (in this in-memory reference store, callers seed that
    /// state directly rather than loading it off disk): replay forward
    /// the slots that had decided to commit, roll back the rest.
    pub fn recover(&self) -> RecoveryReport {
        let mut report = RecoveryReport::default();
        for slot_id in 1..=self.config.max_slots() {
            let undo = self.undo_log_for(slot_id);
            if undo.is_empty() {
                continue;
            }
            if undo.is_committing() {
                let mut seen = HashSet::new();
                for (_, record) in undo.iter_asc() {
                    if record.is_commit_marker() {
                        continue;
                    }
                    if let Some(key) = record.key {
                        if seen.insert(key.clone()) {
                            self.promote_key(slot_id, &key);
                        }
                    }
                }
                undo.clear();
                report.committed_slots.push(slot_id);
            } else {
                for (op_id, record) in undo.iter_asc().into_iter().rev() {
                    if record.is_commit_marker() {
                        continue;
                    }
                    if let Some(key) = &record.key {
                        match &record.old_value {
                            Some(old_cell) => self.substrate.force_put(key.clone(), old_cell.clone()),
                            None => self.substrate.force_remove(key),
                        }
                    }
                    undo.remove(op_id);
                }
                undo.clear();
                report.rolled_back_slots.push(slot_id);
            }
            self.set_committing_bit(slot_id, false);
            self.release_slot(slot_id);
        }
        tracing::info!(
            committed = report.committed_slots.len(),
            rolled_back = report.rolled_back_slots.len(),
            "recovery complete"
        );
        report
    }

    /// Seed a slot's undo log directly, simulating what would have
    /// been loaded from disk before [`Self::recover`] runs. Test/setup
    /// only — normal operation never calls this.
    pub fn seed_undo_log_for_recovery(&self, slot_id: u32, entries: Vec<(u64, crate::undo::UndoRecord<K, V>)>, committing: bool) {
        let undo = self.undo_log_for(slot_id);
        for (op_id, record) in entries {
            undo.put(op_id, record);
        }
        if committing {
            undo.mark_committing();
        }
    }
}

impl<K, V> TransactionLookup for TxStore<K, V>
where
    K: Ord + Clone + Hash + Eq + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn get_transaction(&self, slot_id: u32) -> Option<Arc<Transaction>> {
        if slot_id == 0 || slot_id as usize >= self.slots.lock().slots.len() {
            return None;
        }
        self.slots.lock().slots[slot_id as usize].clone()
    }

    fn max_slots(&self) -> u32 {
        self.config.max_slots()
    }
}
