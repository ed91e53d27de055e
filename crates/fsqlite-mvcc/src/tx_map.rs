//! `TxMap`: the per-transaction view of a `Substrate` that application
//! code actually calls — `get`/`put`/`remove`/`putIfAbsent`/`lock`,
//! their non-blocking `try_*` counterparts, ordered navigation, and the
//! uncommitted/committed read variants.

use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;

use fsqlite_error::{FrankenError, Result};

use crate::bitset::VersionedBitSet;
use crate::decision::{AbortReason, WriteDecision};
use crate::snapshot::{self, Snapshot};
use crate::substrate::{Decision, MapRoot, Substrate};
use crate::store::TxStore;
use crate::transaction::{Isolation, Transaction};
use crate::versioned_value::VersionedCell;

/// A non-blocking try: `timeout_millis = -2` in the wait protocol.
const NO_WAIT: i64 = -2;

pub struct TxMap<'a, K, V> {
    store: &'a TxStore<K, V>,
    tx: Arc<Transaction>,
    map_id: i64,
    map_name: String,
    cached_snapshot: Mutex<Option<Snapshot<K, V>>>,
}

impl<'a, K, V> TxMap<'a, K, V>
where
    K: Ord + Clone + Hash + Eq + Debug + Send + Sync + 'static,
    V: Clone + PartialEq + Send + Sync + 'static,
{
    #[must_use]
    pub fn new(store: &'a TxStore<K, V>, tx: Arc<Transaction>, map_id: i64, map_name: impl Into<String>) -> Self {
        Self { store, tx, map_id, map_name: map_name.into(), cached_snapshot: Mutex::new(None) }
    }

    #[must_use]
    pub fn transaction(&self) -> &Arc<Transaction> {
        &self.tx
    }

    /// Called once per statement: refreshes the per-statement snapshot
    /// for `ReadCommitted`, or lazily pins the transaction-wide one for
    /// `RepeatableRead`/`Snapshot`/`Serializable` on first use.
    pub fn mark_statement_start(&self) {
        self.tx.mark_statement_start(self.store.version_tracker());
        if self.tx.isolation == Isolation::ReadCommitted {
            *self.cached_snapshot.lock() = None;
        }
    }

    pub fn mark_statement_end(&self) {
        self.tx.mark_statement_end();
        if self.tx.isolation == Isolation::ReadCommitted {
            *self.cached_snapshot.lock() = None;
        }
    }

    fn snapshot(&self) -> Snapshot<K, V> {
        let mut cached = self.cached_snapshot.lock();
        if let Some(s) = cached.as_ref() {
            return s.clone();
        }
        let snap = snapshot::acquire(self.store.committing_bitmap(), self.store.substrate());
        *cached = Some(snap.clone());
        snap
    }

    /// Keys, within this map, that this transaction's own undo log
    /// records a write for. Cheap even for a long-running transaction:
    /// it walks the transaction's own log, not the live substrate.
    fn own_write_keys(&self) -> Vec<K> {
        self.store
            .undo_log_for(self.tx.slot_id)
            .iter_asc()
            .filter_map(|(_, record)| if record.map_id == self.map_id { record.key } else { None })
            .collect()
    }

    /// Patch `frozen_root` so that cells this transaction itself wrote
    /// after the snapshot was taken become visible again. A statement
    /// snapshot under `RepeatableRead`/`Snapshot`/`Serializable` is
    /// acquired once and then never refreshed for the transaction's
    /// lifetime, so without this a `put`/`remove` issued after the
    /// snapshot was pinned would be invisible to the same transaction's
    /// later reads — `VersionedCell::resolve` already special-cases
    /// `owner == reader_slot` to mean "see it," so merging the live
    /// owned cell back in is enough; no read method downstream needs to
    /// change.
    fn overlay_own_writes(&self, frozen_root: MapRoot<K, V>) -> MapRoot<K, V> {
        let own_keys = self.own_write_keys();
        if own_keys.is_empty() {
            return frozen_root;
        }
        let live_root = self.store.substrate().root();
        let mut patched = (*frozen_root).clone();
        for key in own_keys {
            if let Some(cell) = Substrate::get(&live_root, &key) {
                if cell.owner_slot() == Some(self.tx.slot_id) {
                    patched = patched.update(key, cell);
                    continue;
                }
            }
        }
        Arc::new(patched)
    }

    /// `ReadUncommitted` always reads the live root with no snapshot
    /// coherence requirement; every other level reads a coherent
    /// `(root, committing)` pair, merged with this transaction's own
    /// pending writes on top of its frozen baseline (see
    /// [`Self::overlay_own_writes`]).
    fn root_and_committing(&self) -> (MapRoot<K, V>, Arc<VersionedBitSet>) {
        if self.tx.isolation == Isolation::ReadUncommitted {
            (self.store.substrate().root(), self.store.committing_bitmap().load_full())
        } else {
            let snap = self.snapshot();
            (self.overlay_own_writes(snap.root), snap.committing)
        }
    }

    fn resolve_for(&self, cell: &VersionedCell<V>, committing: &VersionedBitSet) -> Option<V> {
        if self.tx.isolation == Isolation::ReadUncommitted {
            cell.resolve_uncommitted()
        } else {
            cell.resolve(self.tx.slot_id, committing)
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let (root, committing) = self.root_and_committing();
        Substrate::get(&root, key).and_then(|c| self.resolve_for(&c, &committing))
    }

    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    #[must_use]
    pub fn is_deleted_by_current_transaction(&self, key: &K) -> bool {
        let root = self.store.substrate().root();
        matches!(Substrate::get(&root, key), Some(c) if c.owner_slot() == Some(self.tx.slot_id) && c.current.is_none())
    }

    #[must_use]
    pub fn is_same_transaction(&self, key: &K) -> bool {
        let root = self.store.substrate().root();
        matches!(Substrate::get(&root, key), Some(c) if c.owner_slot() == Some(self.tx.slot_id))
    }

    /// Wait for `blocking_slot` to release `key`, then let the caller's
    /// retry loop re-`operate`. By the time `wait_on` runs, the
    /// decision-maker has already classified the cell as contended by a
    /// *live* transaction (a dead owner is resolved by the decision-maker
    /// itself via forward-rollback, never surfaced here) — if the slot
    /// has since gone away anyway, there is nothing to wait on and the
    /// retry will re-evaluate the cell fresh.
    fn wait_on(&self, blocking_slot: u32, key: &K) -> Result<()> {
        let Some(other) = self.store.get_transaction(blocking_slot) else {
            return Ok(());
        };
        tracing::trace!(slot_id = self.tx.slot_id, blocking_slot, key = ?key, "blocked on row lock");
        let woke = self.tx.wait_for(&other, self.store, self.map_name.clone(), format!("{key:?}"), self.tx.timeout_millis)?;
        if woke {
            Ok(())
        } else {
            Err(FrankenError::LockTimeout { blocking_slot, timeout_ms: self.tx.timeout_millis })
        }
    }

    /// Non-blocking variant of [`Self::wait_on`]: drives the wait
    /// protocol with `timeout_millis = NO_WAIT` (`-2`) and reports
    /// contention as `Ok(false)` instead of erroring, for `try_*` callers.
    fn try_wait_on(&self, blocking_slot: u32, key: &K) -> Result<bool> {
        let Some(other) = self.store.get_transaction(blocking_slot) else {
            return Ok(true);
        };
        tracing::trace!(slot_id = self.tx.slot_id, blocking_slot, key = ?key, "try-lock contended");
        self.tx.wait_for(&other, self.store, self.map_name.clone(), format!("{key:?}"), NO_WAIT)
    }

    fn write_update(&self, key: &K, value: Option<V>) -> Result<()> {
        loop {
            let committing = self.store.committing_bitmap().load_full();
            let undo = self.store.undo_log_for(self.tx.slot_id);
            let mut dm = WriteDecision::update(Arc::clone(&self.tx), undo, self.map_id, value.clone(), &committing, self.store);
            match self.store.substrate().operate(key, &mut dm) {
                Decision::Put(_) | Decision::Remove => return Ok(()),
                Decision::Repeat => unreachable!("Substrate::operate never returns Repeat to the caller"),
                Decision::Abort => match dm.outcome {
                    Some(AbortReason::Contention { blocking_slot }) => self.wait_on(blocking_slot, key)?,
                    Some(AbortReason::Failed(e)) => return Err(e),
                    other => unreachable!("update() can only abort with Contention or Failed, got {other:?}"),
                },
            }
        }
    }

    pub fn put(&self, key: K, value: V) -> Result<()> {
        self.write_update(&key, Some(value))
    }

    pub fn remove(&self, key: &K) -> Result<()> {
        self.write_update(key, None)
    }

    /// Non-blocking put: returns `Ok(false)` instead of waiting when
    /// the key is held by another transaction.
    pub fn try_put(&self, key: &K, value: V) -> Result<bool> {
        self.try_write_update(key, Some(value))
    }

    pub fn try_remove(&self, key: &K) -> Result<bool> {
        self.try_write_update(key, None)
    }

    fn try_write_update(&self, key: &K, value: Option<V>) -> Result<bool> {
        let committing = self.store.committing_bitmap().load_full();
        let undo = self.store.undo_log_for(self.tx.slot_id);
        let mut dm = WriteDecision::update(Arc::clone(&self.tx), undo, self.map_id, value, &committing, self.store);
        match self.store.substrate().operate(key, &mut dm) {
            Decision::Put(_) | Decision::Remove => Ok(true),
            Decision::Repeat => unreachable!(),
            Decision::Abort => match dm.outcome {
                Some(AbortReason::Contention { .. }) => Ok(false),
                Some(AbortReason::Failed(e)) => Err(e),
                other => unreachable!("{other:?}"),
            },
        }
    }

    /// Insert only if the key is not currently visible to this
    /// transaction. Returns `Ok(false)` (not an error) when it already
    /// exists.
    pub fn put_if_absent(&self, key: K, value: V) -> Result<bool> {
        loop {
            let committing = self.store.committing_bitmap().load_full();
            let undo = self.store.undo_log_for(self.tx.slot_id);
            let mut dm = WriteDecision::put_if_absent(Arc::clone(&self.tx), undo, self.map_id, value.clone(), &committing, self.store);
            match self.store.substrate().operate(&key, &mut dm) {
                Decision::Put(_) => return Ok(true),
                Decision::Remove => unreachable!("put_if_absent never removes"),
                Decision::Repeat => unreachable!(),
                Decision::Abort => match dm.outcome {
                    Some(AbortReason::AlreadyExists) => return Ok(false),
                    Some(AbortReason::Contention { blocking_slot }) => self.wait_on(blocking_slot, &key)?,
                    Some(AbortReason::Failed(e)) => return Err(e),
                    other => unreachable!("{other:?}"),
                },
            }
        }
    }

    /// Claim ownership of `key`'s current value without changing it
    /// (`SELECT ... FOR UPDATE`-style locking).
    pub fn lock(&self, key: &K) -> Result<()> {
        loop {
            let committing = self.store.committing_bitmap().load_full();
            let undo = self.store.undo_log_for(self.tx.slot_id);
            let mut dm = WriteDecision::lock(Arc::clone(&self.tx), undo, self.map_id, &committing, self.store);
            match self.store.substrate().operate(key, &mut dm) {
                Decision::Put(_) | Decision::Remove => return Ok(()),
                Decision::Repeat => unreachable!(),
                Decision::Abort => match dm.outcome {
                    Some(AbortReason::Contention { blocking_slot }) => self.wait_on(blocking_slot, key)?,
                    Some(AbortReason::Failed(e)) => return Err(e),
                    other => unreachable!("{other:?}"),
                },
            }
        }
    }

    /// Non-blocking variant of [`Self::lock`]: a single attempt driven
    /// with `timeout_millis = NO_WAIT` (`-2`), reporting contention as
    /// `Ok(false)` rather than waiting for it to clear.
    pub fn try_lock(&self, key: &K) -> Result<bool> {
        let committing = self.store.committing_bitmap().load_full();
        let undo = self.store.undo_log_for(self.tx.slot_id);
        let mut dm = WriteDecision::lock(Arc::clone(&self.tx), undo, self.map_id, &committing, self.store);
        match self.store.substrate().operate(key, &mut dm) {
            Decision::Put(_) | Decision::Remove => Ok(true),
            Decision::Repeat => unreachable!(),
            Decision::Abort => match dm.outcome {
                Some(AbortReason::Contention { blocking_slot }) => self.try_wait_on(blocking_slot, key),
                Some(AbortReason::Failed(e)) => Err(e),
                other => unreachable!("{other:?}"),
            },
        }
    }

    /// Non-blocking `put`: alias for [`Self::try_put`] under the name
    /// the wait protocol's `trySet` operation uses for a plain value
    /// write (as opposed to [`Self::try_lock`], which claims ownership
    /// without changing the value).
    pub fn try_set(&self, key: &K, value: V) -> Result<bool> {
        self.try_put(key, value)
    }

    /// `Serializable`'s additional write-write check: confirm
    /// the committed value at `key` still matches what this
    /// transaction's pinned snapshot saw. A no-op at every other
    /// isolation level.
    pub fn validate_for_serializable(&self, key: &K) -> Result<()> {
        if self.tx.isolation != Isolation::Serializable {
            return Ok(());
        }
        let snapshot_value = {
            let snap = self.snapshot();
            Substrate::get(&snap.root, key)
        };
        loop {
            let committing = self.store.committing_bitmap().load_full();
            let undo = self.store.undo_log_for(self.tx.slot_id);
            let mut dm = WriteDecision::repeatable_read_lock(
                Arc::clone(&self.tx),
                undo,
                self.map_id,
                &committing,
                self.store,
                snapshot_value.clone(),
            );
            match self.store.substrate().operate(key, &mut dm) {
                Decision::Put(_) | Decision::Remove => return Ok(()),
                Decision::Repeat => unreachable!(),
                Decision::Abort => match dm.outcome {
                    Some(AbortReason::Conflict) => {
                        return Err(FrankenError::TransactionIllegalState {
                            reason: format!("serializable write-write conflict on key {key:?}"),
                        });
                    }
                    Some(AbortReason::Contention { blocking_slot }) => self.wait_on(blocking_slot, key)?,
                    Some(AbortReason::Failed(e)) => return Err(e),
                    other => unreachable!("{other:?}"),
                },
            }
        }
    }

    /// Entry count including uncommitted writes — an upper-bound
    /// estimate, not a count of what this transaction actually sees.
    #[must_use]
    pub fn size_estimate(&self) -> usize {
        Substrate::len(&self.store.substrate().root())
    }

    #[must_use]
    pub fn first_entry(&self) -> Option<(K, V)> {
        let (root, committing) = self.root_and_committing();
        let mut cursor = Substrate::first_key(&root);
        while let Some(key) = cursor {
            if let Some(v) = Substrate::get(&root, &key).and_then(|c| self.resolve_for(&c, &committing)) {
                return Some((key, v));
            }
            cursor = Substrate::higher_key(&root, &key);
        }
        None
    }

    #[must_use]
    pub fn last_entry(&self) -> Option<(K, V)> {
        let (root, committing) = self.root_and_committing();
        let mut cursor = Substrate::last_key(&root);
        while let Some(key) = cursor {
            if let Some(v) = Substrate::get(&root, &key).and_then(|c| self.resolve_for(&c, &committing)) {
                return Some((key, v));
            }
            cursor = Substrate::lower_key(&root, &key);
        }
        None
    }

    #[must_use]
    pub fn higher_entry(&self, key: &K) -> Option<(K, V)> {
        let (root, committing) = self.root_and_committing();
        let mut cursor = Substrate::higher_key(&root, key);
        while let Some(k) = cursor {
            if let Some(v) = Substrate::get(&root, &k).and_then(|c| self.resolve_for(&c, &committing)) {
                return Some((k, v));
            }
            cursor = Substrate::higher_key(&root, &k);
        }
        None
    }

    #[must_use]
    pub fn lower_entry(&self, key: &K) -> Option<(K, V)> {
        let (root, committing) = self.root_and_committing();
        let mut cursor = Substrate::lower_key(&root, key);
        while let Some(k) = cursor {
            if let Some(v) = Substrate::get(&root, &k).and_then(|c| self.resolve_for(&c, &committing)) {
                return Some((k, v));
            }
            cursor = Substrate::lower_key(&root, &k);
        }
        None
    }

    #[must_use]
    pub fn ceiling_key(&self, key: &K) -> Option<K> {
        let (root, committing) = self.root_and_committing();
        let mut cursor = Substrate::ceiling_key(&root, key);
        while let Some(k) = cursor {
            if Substrate::get(&root, &k).and_then(|c| self.resolve_for(&c, &committing)).is_some() {
                return Some(k);
            }
            cursor = Substrate::higher_key(&root, &k);
        }
        None
    }

    #[must_use]
    pub fn floor_key(&self, key: &K) -> Option<K> {
        let (root, committing) = self.root_and_committing();
        let mut cursor = Substrate::floor_key(&root, key);
        while let Some(k) = cursor {
            if Substrate::get(&root, &k).and_then(|c| self.resolve_for(&c, &committing)).is_some() {
                return Some(k);
            }
            cursor = Substrate::lower_key(&root, &k);
        }
        None
    }

    /// Every key/value this transaction can currently see, in key
    /// order. Under `RepeatableRead`/`Snapshot`/`Serializable` this
    /// reads the transaction-pinned snapshot, so repeated calls are
    /// stable for the transaction's lifetime — the "RepeatableIterator"
    /// in the design notes is just this method under those levels.
    #[must_use]
    pub fn iter_committed(&self) -> Vec<(K, V)> {
        let (root, committing) = self.root_and_committing();
        Substrate::cursor_asc(&root, None).filter_map(|(k, cell)| self.resolve_for(&cell, &committing).map(|v| (k, v))).collect()
    }

    /// Every key/value in the live map regardless of commit state,
    /// ignoring the committing bitmap entirely — used for size
    /// estimation and validation passes, never for ordinary reads.
    #[must_use]
    pub fn iter_uncommitted(&self) -> Vec<(K, V)> {
        let root = self.store.substrate().root();
        Substrate::cursor_asc(&root, None).filter_map(|(k, cell)| cell.resolve_uncommitted().map(|v| (k, v))).collect()
    }

    pub fn clear(&self) -> Result<()> {
        let keys: Vec<K> = self.iter_committed().into_iter().map(|(k, _)| k).collect();
        for key in keys {
            self.write_update(&key, None)?;
        }
        Ok(())
    }

    /// The sentinel `timeout_millis` value `try_lock`/`try_put`/
    /// `try_remove`/`try_set` drive the wait protocol with.
    #[must_use]
    pub const fn no_wait_timeout() -> i64 {
        NO_WAIT
    }
}

impl<'a, V> TxMap<'a, u64, V>
where
    V: Clone + PartialEq + Send + Sync + 'static,
{
    /// Insert `value` under a freshly-generated key one past the
    /// current maximum (auto-increment style). Only meaningful for
    /// `u64`-keyed maps.
    pub fn append(&self, value: V) -> Result<u64> {
        let root = self.store.substrate().root();
        let next_key = Substrate::last_key(&root).map_or(0, |k| k + 1);
        self.write_update(&next_key, Some(value))?;
        Ok(next_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;

    fn store(max_slots: u32) -> TxStore<u64, Vec<u8>> {
        TxStore::new(StoreConfig::builder().max_slots(max_slots).build())
    }

    #[test]
    fn put_then_get_round_trips_for_the_writer() {
        let s = store(16);
        let tx = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let map = TxMap::new(&s, tx.clone(), 1, "t");
        map.put(1, b"a".to_vec()).unwrap();
        assert_eq!(map.get(&1), Some(b"a".to_vec()));
    }

    #[test]
    fn read_committed_hides_uncommitted_write_from_other_transaction() {
        let s = store(16);
        let writer = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let writer_map = TxMap::new(&s, writer.clone(), 1, "t");
        writer_map.put(1, b"new".to_vec()).unwrap();

        let reader = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let reader_map = TxMap::new(&s, reader, 1, "t");
        assert_eq!(reader_map.get(&1), None, "uncommitted write must be invisible under read committed");
    }

    #[test]
    fn read_uncommitted_sees_the_write_immediately() {
        let s = store(16);
        let writer = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let writer_map = TxMap::new(&s, writer.clone(), 1, "t");
        writer_map.put(1, b"new".to_vec()).unwrap();

        let reader = s.begin(2, Isolation::ReadUncommitted, 1000).unwrap();
        let reader_map = TxMap::new(&s, reader, 1, "t");
        assert_eq!(reader_map.get(&1), Some(b"new".to_vec()));
    }

    #[test]
    fn repeatable_read_sees_its_own_write_after_the_snapshot_is_pinned() {
        let s = store(16);
        let tx = s.begin(1, Isolation::RepeatableRead, 1000).unwrap();
        let map = TxMap::new(&s, tx, 1, "t");
        assert_eq!(map.get(&1), None, "pins the statement snapshot on first read");
        map.put(1, b"mine".to_vec()).unwrap();
        assert_eq!(map.get(&1), Some(b"mine".to_vec()), "a transaction must see its own write over its frozen snapshot");
        assert_eq!(map.iter_committed(), vec![(1, b"mine".to_vec())]);
    }

    #[test]
    fn serializable_sees_its_own_delete_after_the_snapshot_is_pinned() {
        let s = store(16);
        let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        {
            let m1 = TxMap::new(&s, t1.clone(), 1, "t");
            m1.put(1, b"a".to_vec()).unwrap();
        }
        s.commit(&t1).unwrap();

        let tx = s.begin(2, Isolation::Serializable, 1000).unwrap();
        let map = TxMap::new(&s, tx, 1, "t");
        assert_eq!(map.get(&1), Some(b"a".to_vec()), "pins the snapshot on first read");
        map.remove(&1).unwrap();
        assert_eq!(map.get(&1), None, "own pending delete must be visible on top of the frozen snapshot");
    }

    #[test]
    fn write_resolves_orphaned_cell_from_a_slot_that_no_longer_exists_instead_of_hanging() {
        let s = store(16);
        // Simulate a cell left behind by a transaction whose slot was
        // already freed without the cell being cleaned up: no `begin`
        // ever allocated slot 9, so `get_transaction(9)` reports it dead.
        s.substrate().force_put(1, VersionedCell::uncommitted(crate::opid::make_op_id(9, 0), Some(b"orphan".to_vec()), Some(b"base".to_vec())));

        let tx = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let map = TxMap::new(&s, tx, 1, "t");
        map.put(1, b"mine".to_vec()).unwrap();
        assert_eq!(map.get(&1), Some(b"mine".to_vec()));
    }

    #[test]
    fn try_lock_fails_fast_against_a_live_contended_owner() {
        let s = store(16);
        let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let m1 = TxMap::new(&s, t1.clone(), 1, "t");
        m1.put(1, b"a".to_vec()).unwrap();

        let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let m2 = TxMap::new(&s, t2, 1, "t");
        assert_eq!(m2.try_lock(&1).unwrap(), false, "try_lock must not block on a live holder");
    }

    #[test]
    fn try_lock_succeeds_on_an_unheld_key() {
        let s = store(16);
        let tx = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let map = TxMap::new(&s, tx.clone(), 1, "t");
        map.put(1, b"a".to_vec()).unwrap();
        s.commit(&tx).unwrap();

        let tx2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let map2 = TxMap::new(&s, tx2, 1, "t");
        assert!(map2.try_lock(&1).unwrap());
    }

    #[test]
    fn try_set_is_non_blocking_like_try_put() {
        let s = store(16);
        let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let m1 = TxMap::new(&s, t1.clone(), 1, "t");
        m1.put(1, b"a".to_vec()).unwrap();

        let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let m2 = TxMap::new(&s, t2, 1, "t");
        assert_eq!(m2.try_set(&1, b"b".to_vec()).unwrap(), false);
    }

    #[test]
    fn commit_makes_the_write_visible_to_read_committed() {
        let s = store(16);
        let writer = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        {
            let writer_map = TxMap::new(&s, writer.clone(), 1, "t");
            writer_map.put(1, b"new".to_vec()).unwrap();
        }
        s.commit(&writer).unwrap();

        let reader = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let reader_map = TxMap::new(&s, reader, 1, "t");
        assert_eq!(reader_map.get(&1), Some(b"new".to_vec()));
    }

    #[test]
    fn put_if_absent_reports_existing_without_waiting() {
        let s = store(16);
        let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        {
            let m = TxMap::new(&s, t1.clone(), 1, "t");
            assert!(m.put_if_absent(1, b"a".to_vec()).unwrap());
        }
        s.commit(&t1).unwrap();

        let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let m2 = TxMap::new(&s, t2, 1, "t");
        assert!(!m2.put_if_absent(1, b"b".to_vec()).unwrap());
    }

    #[test]
    fn try_put_returns_false_instead_of_blocking_on_contention() {
        let s = store(16);
        let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let m1 = TxMap::new(&s, t1.clone(), 1, "t");
        m1.put(1, b"a".to_vec()).unwrap();

        let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let m2 = TxMap::new(&s, t2, 1, "t");
        assert_eq!(m2.try_put(&1, b"b".to_vec()).unwrap(), false);
    }

    #[test]
    fn append_assigns_increasing_keys() {
        let s = store(16);
        let t = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let m = TxMap::new(&s, t, 1, "t");
        let k1 = m.append(b"a".to_vec()).unwrap();
        let k2 = m.append(b"b".to_vec()).unwrap();
        assert!(k2 > k1);
    }

    #[test]
    fn navigation_skips_deleted_entries() {
        let s = store(16);
        let t = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        let m = TxMap::new(&s, t.clone(), 1, "t");
        m.put(1, b"a".to_vec()).unwrap();
        m.put(2, b"b".to_vec()).unwrap();
        m.put(3, b"c".to_vec()).unwrap();
        s.commit(&t).unwrap();

        let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
        let m2 = TxMap::new(&s, t2.clone(), 1, "t");
        m2.remove(&2).unwrap();
        assert_eq!(m2.higher_entry(&1), Some((3, b"c".to_vec())), "the writer itself must skip its own pending delete");
        assert_eq!(m2.first_entry(), Some((1, b"a".to_vec())));
        assert_eq!(m2.last_entry(), Some((3, b"c".to_vec())));
    }

    #[test]
    fn blocking_write_wakes_after_the_holder_commits() {
        let s = Arc::new(store(16));
        let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
        {
            let m1 = TxMap::new(&s, t1.clone(), 1, "t");
            m1.put(1, b"a".to_vec()).unwrap();
        }

        let s2 = Arc::clone(&s);
        let t1_for_thread = t1.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            s2.commit(&t1_for_thread).unwrap();
        });

        let t2 = s.begin(2, Isolation::ReadCommitted, 2000).unwrap();
        let m2 = TxMap::new(&s, t2.clone(), 1, "t");
        m2.put(1, b"b".to_vec()).unwrap();
        s.commit(&t2).unwrap();
        handle.join().unwrap();

        let t3 = s.begin(3, Isolation::ReadCommitted, 1000).unwrap();
        let m3 = TxMap::new(&s, t3, 1, "t");
        assert_eq!(m3.get(&1), Some(b"b".to_vec()));
    }
}
