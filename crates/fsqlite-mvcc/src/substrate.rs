//! The ordered-map storage substrate: the external contract a caller
//! plugs a real persistent store into.
//!
//! This treats the persistent B-tree substrate as an
//! external collaborator accessed through a narrow interface: an
//! atomically-replaceable immutable root, a CAS-retrying `operate`
//! primitive, and ordered cursor access. `Substrate<K, V>` below is the
//! in-memory reference implementation of that contract — enough to
//! exercise every transaction-layer invariant without a real paged
//! B-tree behind it.
//!
//! The root is `im::OrdMap<K, VersionedCell<V>>` (cheap structural-
//! sharing clones on every publish) held behind `arc_swap::ArcSwap`
//! (lock-free publish, and `Arc::ptr_eq` gives the identity comparison
//! the snapshot silence loop needs).

use std::ops::Bound;
use std::sync::Arc;

use arc_swap::ArcSwap;
use im::OrdMap;

use crate::versioned_value::VersionedCell;

/// The outcome a [`DecisionMaker`] returns for a key under contention.
#[derive(Debug, Clone)]
pub enum Decision<V> {
    /// Install `VersionedCell` as the new value for the key.
    Put(VersionedCell<V>),
    /// Delete the key.
    Remove,
    /// Do nothing; the caller (`TxMap`'s write loop) must wait and retry.
    Abort,
    /// Do nothing; `operate` itself retries immediately against a
    /// freshly-loaded root, with no caller-visible delay.
    Repeat,
}

/// A strategy plugged into [`Substrate::operate`]. Implementors may
/// hold internal mutable state across `Repeat` retries (e.g. the
/// orphan-opId cache described in the decision-maker design notes).
pub trait DecisionMaker<K, V> {
    /// Inspect the existing cell (`None` if the key is absent) and
    /// decide what to do.
    fn decide(&mut self, existing: Option<&VersionedCell<V>>, key: &K) -> Decision<V>;
}

/// A fixed-in-time view of the map, identity-comparable via `Arc::ptr_eq`.
pub type MapRoot<K, V> = Arc<OrdMap<K, VersionedCell<V>>>;

/// In-memory reference substrate implementing the storage contract for
/// one transactional map.
pub struct Substrate<K, V> {
    root: ArcSwap<OrdMap<K, VersionedCell<V>>>,
}

impl<K, V> Default for Substrate<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self { root: ArcSwap::from_pointee(OrdMap::new()) }
    }
}

impl<K, V> Substrate<K, V>
where
    K: Ord + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the current root. Two loads compared with `Arc::ptr_eq`
    /// tell a reader whether a publish happened in between.
    #[must_use]
    pub fn root(&self) -> MapRoot<K, V> {
        self.root.load_full()
    }

    /// Read `key` as of `root` (not necessarily the current root —
    /// callers pass a snapshot they captured earlier).
    #[must_use]
    pub fn get(root: &MapRoot<K, V>, key: &K) -> Option<VersionedCell<V>> {
        root.get(key).cloned()
    }

    /// Number of entries in `root`. Callers interested in a
    /// read-uncommitted size estimate pass the current root directly;
    /// callers wanting a committed-only count filter first via
    /// [`crate::tx_map::TxMap`].
    #[must_use]
    pub fn len(root: &MapRoot<K, V>) -> usize {
        root.len()
    }

    /// Unconditional write, bypassing the decision-maker protocol. Used
    /// only by recovery, which already holds exclusive access to the
    /// store.
    pub fn force_put(&self, key: K, cell: VersionedCell<V>) {
        loop {
            let current = self.root.load_full();
            let updated = current.update(key.clone(), cell.clone());
            if self.cas(&current, updated) {
                return;
            }
        }
    }

    /// Unconditional remove, bypassing the decision-maker protocol.
    pub fn force_remove(&self, key: &K) {
        loop {
            let current = self.root.load_full();
            if !current.contains_key(key) {
                return;
            }
            let updated = current.without(key);
            if self.cas(&current, updated) {
                return;
            }
        }
    }

    /// The CAS-retrying atomic-operate primitive: call
    /// `dm.decide` against the live root, apply `Put`/`Remove` via
    /// compare-and-swap, retry on `Repeat` or on a lost CAS race, and
    /// return immediately on `Abort`.
    pub fn operate(&self, key: &K, dm: &mut dyn DecisionMaker<K, V>) -> Decision<V> {
        loop {
            let current = self.root.load_full();
            let existing = current.get(key).cloned();
            match dm.decide(existing.as_ref(), key) {
                Decision::Abort => return Decision::Abort,
                Decision::Repeat => continue,
                Decision::Put(cell) => {
                    let updated = current.update(key.clone(), cell.clone());
                    if self.cas(&current, updated) {
                        return Decision::Put(cell);
                    }
                }
                Decision::Remove => {
                    let updated = current.without(key);
                    if self.cas(&current, updated) {
                        return Decision::Remove;
                    }
                }
            }
        }
    }

    fn cas(&self, expected: &MapRoot<K, V>, new_map: OrdMap<K, VersionedCell<V>>) -> bool {
        let new_arc = Arc::new(new_map);
        let prev = self.root.compare_and_swap(expected, new_arc);
        Arc::ptr_eq(&prev, expected)
    }

    /// Ascending cursor over `root` starting at `from` (inclusive), or
    /// the whole map if `from` is `None`.
    pub fn cursor_asc<'a>(
        root: &'a MapRoot<K, V>,
        from: Option<&K>,
    ) -> Box<dyn Iterator<Item = (K, VersionedCell<V>)> + 'a> {
        match from {
            None => Box::new(root.iter().map(|(k, v)| (k.clone(), v.clone()))),
            Some(k) => Box::new(
                root.range((Bound::Included(k.clone()), Bound::Unbounded))
                    .map(|(k, v)| (k.clone(), v.clone())),
            ),
        }
    }

    /// Descending cursor over `root` starting at `from` (inclusive), or
    /// the whole map if `from` is `None`.
    pub fn cursor_desc<'a>(
        root: &'a MapRoot<K, V>,
        from: Option<&K>,
    ) -> Box<dyn Iterator<Item = (K, VersionedCell<V>)> + 'a> {
        match from {
            None => Box::new(root.iter().rev().map(|(k, v)| (k.clone(), v.clone()))),
            Some(k) => Box::new(
                root.range((Bound::Unbounded, Bound::Included(k.clone())))
                    .rev()
                    .map(|(k, v)| (k.clone(), v.clone())),
            ),
        }
    }

    #[must_use]
    pub fn first_key(root: &MapRoot<K, V>) -> Option<K> {
        root.get_min().map(|(k, _)| k.clone())
    }

    #[must_use]
    pub fn last_key(root: &MapRoot<K, V>) -> Option<K> {
        root.get_max().map(|(k, _)| k.clone())
    }

    #[must_use]
    pub fn higher_key(root: &MapRoot<K, V>, key: &K) -> Option<K> {
        root.range((Bound::Excluded(key.clone()), Bound::Unbounded)).next().map(|(k, _)| k.clone())
    }

    #[must_use]
    pub fn ceiling_key(root: &MapRoot<K, V>, key: &K) -> Option<K> {
        root.range((Bound::Included(key.clone()), Bound::Unbounded)).next().map(|(k, _)| k.clone())
    }

    #[must_use]
    pub fn lower_key(root: &MapRoot<K, V>, key: &K) -> Option<K> {
        root.range((Bound::Unbounded, Bound::Excluded(key.clone()))).next_back().map(|(k, _)| k.clone())
    }

    #[must_use]
    pub fn floor_key(root: &MapRoot<K, V>, key: &K) -> Option<K> {
        root.range((Bound::Unbounded, Bound::Included(key.clone()))).next_back().map(|(k, _)| k.clone())
    }
}
