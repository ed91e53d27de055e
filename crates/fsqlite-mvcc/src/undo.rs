//! Per-slot undo log: a persistent ordered map from opId to
//! [`UndoRecord`], the write-ahead record that drives rollback and
//! crash recovery.

use std::collections::BTreeMap;

use parking_lot::RwLock;

use crate::versioned_value::VersionedCell;

/// `mapId` reserved for the distinguished first record of a
/// transaction's log, marking that the transaction had decided to
/// commit before it finished rewriting cells.
pub const COMMIT_MARKER_MAP_ID: i64 = -1;

/// A single undo entry: enough to restore `key` in `map_id` to
/// `old_value`, or (for the `COMMIT_MARKER`) nothing at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UndoRecord<K, V> {
    /// Target map, or [`COMMIT_MARKER_MAP_ID`] for the commit marker.
    pub map_id: i64,
    /// Key within the map. `None` only for the commit marker.
    pub key: Option<K>,
    /// Cell to restore on rollback. `None` means the key did not exist
    /// before this write (rollback removes it).
    pub old_value: Option<VersionedCell<V>>,
}

impl<K, V> UndoRecord<K, V> {
    /// Build the distinguished commit marker record, always written as
    /// the first entry (log id 0) of a transaction that has decided to
    /// commit.
    #[must_use]
    pub fn commit_marker() -> Self {
        Self { map_id: COMMIT_MARKER_MAP_ID, key: None, old_value: None }
    }

    /// True for the commit marker.
    #[must_use]
    pub fn is_commit_marker(&self) -> bool {
        self.map_id == COMMIT_MARKER_MAP_ID
    }

    /// A normal change record.
    #[must_use]
    pub fn change(map_id: i64, key: K, old_value: Option<VersionedCell<V>>) -> Self {
        debug_assert_ne!(map_id, COMMIT_MARKER_MAP_ID, "map_id -1 is reserved for the commit marker");
        Self { map_id, key: Some(key), old_value }
    }
}

/// One slot's undo log. Single-writer (the owning transaction appends
/// and erases entries); readers (size estimation, recovery scan) take
/// a read lock. Keyed by opId, which is always increasing within a
/// slot's lifetime, so iteration in key order is log-id order.
///
/// [`UndoRecord::commit_marker`] models the record shape the on-disk
/// wire format would use for the distinguished commit marker. The
/// in-memory log tracks the same fact more directly with a flag: by
/// the time recovery needs an answer it only ever asks "had this slot
/// decided to commit before the crash", never "at what log position".
#[derive(Debug)]
pub struct UndoLog<K, V> {
    entries: RwLock<BTreeMap<u64, UndoRecord<K, V>>>,
    committing: std::sync::atomic::AtomicBool,
}

impl<K: Clone, V: Clone> Default for UndoLog<K, V> {
    fn default() -> Self {
        Self { entries: RwLock::new(BTreeMap::new()), committing: std::sync::atomic::AtomicBool::new(false) }
    }
}

impl<K: Clone, V: Clone> UndoLog<K, V> {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that this slot's transaction has decided to commit. Set
    /// once, before the commit loop starts rewriting cells, so a crash
    /// mid-commit can be told apart from a crash mid-transaction.
    pub fn mark_committing(&self) {
        self.committing.store(true, std::sync::atomic::Ordering::Release);
    }

    /// True once [`Self::mark_committing`] has been called. Recovery
    /// uses this to decide whether to replay a slot's writes forward
    /// or roll them all back.
    #[must_use]
    pub fn is_committing(&self) -> bool {
        self.committing.load(std::sync::atomic::Ordering::Acquire)
    }

    /// Append a record at `op_id`. Callers must not reuse an opId
    /// already present.
    pub fn put(&self, op_id: u64, record: UndoRecord<K, V>) {
        self.entries.write().insert(op_id, record);
    }

    /// Fetch the record at `op_id`, if present.
    #[must_use]
    pub fn get(&self, op_id: u64) -> Option<UndoRecord<K, V>> {
        self.entries.read().get(&op_id).cloned()
    }

    /// Remove the record at `op_id`.
    pub fn remove(&self, op_id: u64) -> Option<UndoRecord<K, V>> {
        self.entries.write().remove(&op_id)
    }

    /// True when this slot's log has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of entries currently logged (used for size estimation).
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// The first record by opId order, used by recovery to decide
    /// commit-forward vs rollback for this slot.
    #[must_use]
    pub fn first(&self) -> Option<(u64, UndoRecord<K, V>)> {
        self.entries.read().iter().next().map(|(k, v)| (*k, v.clone()))
    }

    /// Iterate `(op_id, record)` pairs in descending opId order — the
    /// order `rollbackTo` walks them in (most recent write first).
    #[must_use]
    pub fn iter_desc_from(&self, from_op_id: u64, to_op_id: u64) -> Vec<(u64, UndoRecord<K, V>)> {
        self.entries
            .read()
            .range(..=from_op_id)
            .rev()
            .take_while(|(op, _)| **op > to_op_id)
            .map(|(k, v)| (*k, v.clone()))
            .collect()
    }

    /// Iterate all `(op_id, record)` pairs in ascending order — the
    /// order `commit` walks them in (oldest write first).
    #[must_use]
    pub fn iter_asc(&self) -> Vec<(u64, UndoRecord<K, V>)> {
        self.entries.read().iter().map(|(k, v)| (*k, v.clone())).collect()
    }

    /// Drop every entry. Used once a transaction finishes committing or
    /// is fully rolled back.
    pub fn clear(&self) {
        self.entries.write().clear();
        self.committing.store(false, std::sync::atomic::Ordering::Release);
    }
}
