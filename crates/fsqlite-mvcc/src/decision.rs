//! Decision-maker strategies plugged into [`crate::substrate::Substrate::operate`]:
//! `Update` (plain put/delete), `PutIfAbsent`, `Lock`, and
//! `RepeatableReadLock` (lock plus a serializable write-write check).
//!
//! `operate` calls `decide` again whenever a previous `Put`/`Remove`
//! lost its compare-and-swap race, not only on an explicit `Repeat`.
//! Each of these decision-makers may have already appended an undo
//! record and advanced the transaction's log id on that earlier call;
//! before computing a fresh decision they first undo that orphaned
//! attempt ("the second sighting" in the design notes).

use std::sync::Arc;

use fsqlite_error::FrankenError;

use crate::bitset::VersionedBitSet;
use crate::substrate::{Decision, DecisionMaker};
use crate::transaction::{Transaction, TransactionLookup};
use crate::undo::{UndoLog, UndoRecord};
use crate::versioned_value::VersionedCell;

/// Why `decide` returned [`Decision::Abort`]. `Substrate::operate`
/// itself only ever sees `Decision::Abort`; callers that need to tell
/// "wait and retry" apart from "fail now" read this back off the
/// decision-maker after `operate` returns.
#[derive(Debug, Clone)]
pub enum AbortReason {
    /// Blocked behind another transaction's uncommitted write.
    Contention { blocking_slot: u32 },
    /// `putIfAbsent` found the key already present.
    AlreadyExists,
    /// `RepeatableReadLock` found the committed value had changed
    /// since the snapshot it is validating against.
    Conflict,
    /// Logging the write failed (e.g. the transaction's log is full).
    Failed(FrankenError),
}

enum Mode<V> {
    Update,
    PutIfAbsent,
    Lock,
    RepeatableReadLock { snapshot_value: Option<VersionedCell<V>> },
}

/// What a foreign cell means for this writer, after consulting whether
/// its owning slot is still a live transaction.
enum Visibility<V> {
    /// Committed, self-owned, or owned by a transaction already in the
    /// committing bitmap — proceed using the cell as-is.
    Visible,
    /// The owning slot no longer maps to any transaction. The orphan is
    /// rolled forward: `committed` (its pre-write baseline) becomes the
    /// effective existing value, replacing the stale cell.
    ForwardRolledBack(Option<V>),
    /// Owned by a live, non-committing transaction in a different slot.
    Contended(u32),
    /// First sighting of a dead-owner cell; `operate` should reload and
    /// try again without surfacing contention to the caller.
    Repeat,
}

/// The write-path decision maker. One instance is built per call to
/// `TxMap`'s `put`/`putIfAbsent`/`remove`/`lock`, and fed to
/// `Substrate::operate` until it returns something other than `Repeat`.
pub struct WriteDecision<'a, K, V> {
    txn: Arc<Transaction>,
    undo_log: &'a UndoLog<K, V>,
    map_id: i64,
    new_value: Option<V>,
    committing: &'a VersionedBitSet,
    lookup: &'a dyn TransactionLookup,
    mode: Mode<V>,
    pending: Option<u64>,
    /// `(owner_slot, opId)` of a foreign non-committing cell whose owner
    /// slot no longer maps to a live transaction, recorded the first time
    /// `classify` sees it. A second consecutive sighting of the same pair
    /// means the owner is truly gone (not a momentary race with recovery
    /// freeing the slot), and the orphan is rolled forward over.
    dead_owner_sighting: Option<(u32, u64)>,
    pub outcome: Option<AbortReason>,
}

impl<'a, K, V> WriteDecision<'a, K, V>
where
    K: Clone,
    V: Clone,
{
    fn new(
        txn: Arc<Transaction>,
        undo_log: &'a UndoLog<K, V>,
        map_id: i64,
        new_value: Option<V>,
        committing: &'a VersionedBitSet,
        lookup: &'a dyn TransactionLookup,
        mode: Mode<V>,
    ) -> Self {
        Self { txn, undo_log, map_id, new_value, committing, lookup, mode, pending: None, dead_owner_sighting: None, outcome: None }
    }

    /// Plain put (`new_value = Some`) or delete (`new_value = None`).
    /// Aborts on contention against another transaction's uncommitted
    /// write to the same key.
    pub fn update(
        txn: Arc<Transaction>,
        undo_log: &'a UndoLog<K, V>,
        map_id: i64,
        new_value: Option<V>,
        committing: &'a VersionedBitSet,
        lookup: &'a dyn TransactionLookup,
    ) -> Self {
        Self::new(txn, undo_log, map_id, new_value, committing, lookup, Mode::Update)
    }

    /// Insert only if the key is not currently visible to this
    /// transaction. Fails with `AlreadyExists` (not contention) when it is.
    pub fn put_if_absent(
        txn: Arc<Transaction>,
        undo_log: &'a UndoLog<K, V>,
        map_id: i64,
        value: V,
        committing: &'a VersionedBitSet,
        lookup: &'a dyn TransactionLookup,
    ) -> Self {
        Self::new(txn, undo_log, map_id, Some(value), committing, lookup, Mode::PutIfAbsent)
    }

    /// Claim ownership of the current value without changing it.
    /// A no-op (`Decision::Remove` on an absent key is itself a no-op)
    /// when there is nothing to lock.
    pub fn lock(
        txn: Arc<Transaction>,
        undo_log: &'a UndoLog<K, V>,
        map_id: i64,
        committing: &'a VersionedBitSet,
        lookup: &'a dyn TransactionLookup,
    ) -> Self {
        Self::new(txn, undo_log, map_id, None, committing, lookup, Mode::Lock)
    }

    /// Like [`Self::lock`], but first checks the live committed value
    /// against `snapshot_value`; a mismatch means another transaction
    /// committed a change since the snapshot was taken, and is reported
    /// as `AbortReason::Conflict` rather than contention.
    pub fn repeatable_read_lock(
        txn: Arc<Transaction>,
        undo_log: &'a UndoLog<K, V>,
        map_id: i64,
        committing: &'a VersionedBitSet,
        lookup: &'a dyn TransactionLookup,
        snapshot_value: Option<VersionedCell<V>>,
    ) -> Self {
        Self::new(txn, undo_log, map_id, None, committing, lookup, Mode::RepeatableReadLock { snapshot_value })
    }

    fn discard_orphan(&mut self) {
        if let Some(prev_op_id) = self.pending.take() {
            self.undo_log.remove(prev_op_id);
            let _ = self.txn.log_undo();
        }
    }

    fn log_and_record(&mut self, key: &K, existing: Option<&VersionedCell<V>>) -> Option<u64> {
        match self.txn.log() {
            Ok(op_id) => {
                self.undo_log.put(op_id, UndoRecord::change(self.map_id, key.clone(), existing.cloned()));
                self.pending = Some(op_id);
                Some(op_id)
            }
            Err(e) => {
                self.outcome = Some(AbortReason::Failed(e));
                None
            }
        }
    }

    fn committed_base(existing: Option<&VersionedCell<V>>) -> Option<V> {
        existing.and_then(|c| if c.is_committed() { c.current.clone() } else { c.committed.clone() })
    }

    /// Classify a foreign (non-self, non-committing) uncommitted cell by
    /// whether its owning slot is still a live transaction. Committed
    /// and self-owned/committing cells are always `Visible` and never
    /// reach the liveness check.
    fn classify(&mut self, cell: &VersionedCell<V>) -> Visibility<V> {
        if cell.is_committed() {
            return Visibility::Visible;
        }
        let owner = cell.owner_slot().expect("uncommitted cell always has an owner");
        if owner == self.txn.slot_id || self.committing.get(owner as usize) {
            return Visibility::Visible;
        }
        if self.lookup.get_transaction(owner).is_some() {
            self.dead_owner_sighting = None;
            return Visibility::Contended(owner);
        }
        match self.dead_owner_sighting {
            Some((prev_owner, prev_op_id)) if prev_owner == owner && prev_op_id == cell.op_id => {
                self.dead_owner_sighting = None;
                Visibility::ForwardRolledBack(cell.committed.clone())
            }
            _ => {
                self.dead_owner_sighting = Some((owner, cell.op_id));
                Visibility::Repeat
            }
        }
    }

    /// Resolve `existing` against [`Self::classify`], returning the cell
    /// to treat as the current state of the key: the real cell when
    /// visible, a synthetic committed cell built from the orphan's
    /// baseline when forward-rolled-back, or `Err` with the
    /// `Decision<V>` to return immediately (contention abort or repeat).
    fn effective_existing(&mut self, existing: Option<&VersionedCell<V>>) -> Result<Option<VersionedCell<V>>, Decision<V>> {
        let Some(cell) = existing else {
            return Ok(None);
        };
        match self.classify(cell) {
            Visibility::Visible => Ok(Some(cell.clone())),
            Visibility::ForwardRolledBack(baseline) => Ok(baseline.map(VersionedCell::committed)),
            Visibility::Contended(owner) => {
                self.outcome = Some(AbortReason::Contention { blocking_slot: owner });
                Err(Decision::Abort)
            }
            Visibility::Repeat => Err(Decision::Repeat),
        }
    }

    fn decide_update(&mut self, existing: Option<&VersionedCell<V>>, key: &K) -> Decision<V> {
        let effective = match self.effective_existing(existing) {
            Ok(effective) => effective,
            Err(decision) => return decision,
        };
        if effective.is_none() && self.new_value.is_none() {
            return Decision::Remove;
        }
        let committed_base = Self::committed_base(effective.as_ref());
        let Some(op_id) = self.log_and_record(key, effective.as_ref()) else { return Decision::Abort };
        Decision::Put(VersionedCell::uncommitted(op_id, self.new_value.clone(), committed_base))
    }

    fn decide_put_if_absent(&mut self, existing: Option<&VersionedCell<V>>, key: &K) -> Decision<V> {
        if let Some(cell) = existing {
            if cell.resolve(self.txn.slot_id, self.committing).is_some() {
                self.outcome = Some(AbortReason::AlreadyExists);
                return Decision::Abort;
            }
        }
        let effective = match self.effective_existing(existing) {
            Ok(effective) => effective,
            Err(decision) => return decision,
        };
        let committed_base = Self::committed_base(effective.as_ref());
        let Some(op_id) = self.log_and_record(key, effective.as_ref()) else { return Decision::Abort };
        Decision::Put(VersionedCell::uncommitted(op_id, self.new_value.clone(), committed_base))
    }

    fn decide_lock(&mut self, existing: Option<&VersionedCell<V>>, key: &K) -> Decision<V> {
        let Some(cell) = existing else {
            return Decision::Remove;
        };
        if !cell.is_committed() && cell.owner_slot() == Some(self.txn.slot_id) {
            return Decision::Remove;
        }
        let effective = match self.effective_existing(existing) {
            Ok(effective) => effective,
            Err(decision) => return decision,
        };
        let claimed_current = effective.as_ref().and_then(|c| c.current.clone());
        let committed_base = Self::committed_base(effective.as_ref());
        let Some(op_id) = self.log_and_record(key, effective.as_ref()) else { return Decision::Abort };
        Decision::Put(VersionedCell::uncommitted(op_id, claimed_current, committed_base))
    }
}

impl<'a, K, V> WriteDecision<'a, K, V>
where
    K: Clone,
    V: Clone + PartialEq,
{
    fn decide_repeatable_read_lock(&mut self, existing: Option<&VersionedCell<V>>, key: &K) -> Decision<V> {
        let Mode::RepeatableReadLock { snapshot_value } = &self.mode else {
            unreachable!("decide_repeatable_read_lock called outside RepeatableReadLock mode")
        };
        let current_committed = Self::committed_base(existing);
        let snapshot_committed = Self::committed_base(snapshot_value.as_ref());
        if current_committed != snapshot_committed {
            self.outcome = Some(AbortReason::Conflict);
            return Decision::Abort;
        }
        self.decide_lock(existing, key)
    }
}

impl<'a, K, V> DecisionMaker<K, V> for WriteDecision<'a, K, V>
where
    K: Clone,
    V: Clone + PartialEq,
{
    fn decide(&mut self, existing: Option<&VersionedCell<V>>, key: &K) -> Decision<V> {
        self.discard_orphan();
        if self.outcome.is_some() {
            return Decision::Abort;
        }
        match self.mode {
            Mode::Update => self.decide_update(existing, key),
            Mode::PutIfAbsent => self.decide_put_if_absent(existing, key),
            Mode::Lock => self.decide_lock(existing, key),
            Mode::RepeatableReadLock { .. } => self.decide_repeatable_read_lock(existing, key),
        }
    }
}
