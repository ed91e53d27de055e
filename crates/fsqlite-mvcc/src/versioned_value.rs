//! The versioned cell: the single-cell encoding of committed and
//! uncommitted writes that every transactional map stores in place of
//! a bare value.

use crate::bitset::VersionedBitSet;
use crate::opid::{is_committed, slot_of, COMMITTED_OP_ID};

/// A value stored in a transactional map.
///
/// `op_id == 0` means *Committed*: `current` holds the committed value
/// and `committed` is always `None` (there is nothing to fall back to).
/// `op_id != 0` means *Uncommitted*: the writer identified by `op_id`
/// may still roll back, so `committed` preserves what a different
/// transaction must observe until the writer's commit becomes visible.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct VersionedCell<V> {
    /// Zero for a committed cell, otherwise the writer's opId.
    pub op_id: u64,
    /// The value the owning writer will commit. `None` encodes delete.
    pub current: Option<V>,
    /// The previously-committed value a non-owning reader still sees
    /// until the writer's commit bit is set. `None` if the key did not
    /// exist before this writer touched it.
    pub committed: Option<V>,
}

impl<V> VersionedCell<V> {
    /// Build a committed cell. `v` must not itself be a tombstone — a
    /// committed cell holding `None` is never stored; the key is simply
    /// absent from the map.
    #[must_use]
    pub fn committed(v: V) -> Self {
        Self { op_id: COMMITTED_OP_ID, current: Some(v), committed: None }
    }

    /// Build an uncommitted cell owned by `op_id`.
    #[must_use]
    pub fn uncommitted(op_id: u64, current: Option<V>, committed: Option<V>) -> Self {
        debug_assert!(!is_committed(op_id), "uncommitted cell must carry a nonzero opId");
        Self { op_id, current, committed }
    }

    /// True when this cell has no pending writer.
    #[must_use]
    pub fn is_committed(&self) -> bool {
        is_committed(self.op_id)
    }

    /// Slot id of the owning writer, or `None` for a committed cell.
    #[must_use]
    pub fn owner_slot(&self) -> Option<u32> {
        if self.is_committed() {
            None
        } else {
            Some(slot_of(self.op_id))
        }
    }
}

impl<V: Clone> VersionedCell<V> {
    /// Resolve this cell to the value a reader in `reader_slot` sees,
    /// given a coherent `committing` bitmap.
    ///
    /// - Committed cells resolve to `current` unconditionally.
    /// - Uncommitted cells resolve to `current` when the reader *is* the
    ///   owner, or when the owner's bit is set in `committing` (the
    ///   owner has logically committed from this reader's point of
    ///   view); otherwise they resolve to `committed` (the writer has
    ///   not yet committed, so its pending value is invisible).
    #[must_use]
    pub fn resolve(&self, reader_slot: u32, committing: &VersionedBitSet) -> Option<V> {
        if self.is_committed() {
            return self.current.clone();
        }
        let owner = slot_of(self.op_id);
        if owner == reader_slot || committing.get(owner as usize) {
            self.current.clone()
        } else {
            self.committed.clone()
        }
    }

    /// Like [`resolve`](Self::resolve) but used by the read-uncommitted
    /// iterator, which always shows `current` regardless of commit
    /// state (it may be `None` to represent a pending delete).
    #[must_use]
    pub fn resolve_uncommitted(&self) -> Option<V> {
        self.current.clone()
    }
}
