//! Copy-on-write versioned bit set.
//!
//! `committingTransactions` and `openSlots` are both instances of this
//! type: an immutable, fixed-capacity bit array plus a monotonic
//! version, published by atomic reference swap. Readers compare two
//! loads by identity (pointer equality), never by value, which is what
//! makes the snapshot silence loop (`snapshot::acquire`) terminate
//! without needing a fence the substrate doesn't provide.

const WORD_BITS: usize = 64;

/// Low-level word operations shared by `VersionedBitSet` and callers
/// that need to scan a raw bit array (recovery, size estimation).
pub mod wordops {
    use super::WORD_BITS;

    /// Word index containing bit `idx`.
    #[must_use]
    pub fn word_index(idx: usize) -> usize {
        idx / WORD_BITS
    }

    /// Bit offset of `idx` within its word.
    #[must_use]
    pub fn bit_offset(idx: usize) -> u32 {
        (idx % WORD_BITS) as u32
    }

    /// Number of words needed to hold `capacity` bits.
    #[must_use]
    pub fn words_for_capacity(capacity: usize) -> usize {
        capacity.div_ceil(WORD_BITS)
    }

    /// Read bit `idx` from `words`.
    #[must_use]
    pub fn get(words: &[u64], idx: usize) -> bool {
        match words.get(word_index(idx)) {
            Some(w) => (w >> bit_offset(idx)) & 1 == 1,
            None => false,
        }
    }

    /// Set bit `idx` in `words` (grows nothing; caller must size
    /// `words` for the intended capacity up front).
    pub fn set(words: &mut [u64], idx: usize) {
        words[word_index(idx)] |= 1u64 << bit_offset(idx);
    }

    /// Clear bit `idx` in `words`.
    pub fn clear(words: &mut [u64], idx: usize) {
        words[word_index(idx)] &= !(1u64 << bit_offset(idx));
    }

    /// Flip bit `idx` in `words`.
    pub fn flip(words: &mut [u64], idx: usize) {
        words[word_index(idx)] ^= 1u64 << bit_offset(idx);
    }

    /// Lowest set bit at or after `from`, within `capacity` bits.
    #[must_use]
    pub fn next_set_bit(words: &[u64], from: usize, capacity: usize) -> Option<usize> {
        let mut idx = from;
        while idx < capacity {
            if get(words, idx) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// Lowest clear bit at or after `from`, within `capacity` bits.
    #[must_use]
    pub fn next_clear_bit(words: &[u64], from: usize, capacity: usize) -> Option<usize> {
        let mut idx = from;
        while idx < capacity {
            if !get(words, idx) {
                return Some(idx);
            }
            idx += 1;
        }
        None
    }

    /// Highest set bit plus one, or zero if the set is empty.
    #[must_use]
    pub fn length(words: &[u64], capacity: usize) -> usize {
        for idx in (0..capacity).rev() {
            if get(words, idx) {
                return idx + 1;
            }
        }
        0
    }
}

/// Immutable bit array with a monotonic version, published by atomic
/// reference swap (see [`crate::snapshot`] and [`crate::store::TxStore`]).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedBitSet {
    words: Vec<u64>,
    capacity: usize,
    version: u64,
}

impl VersionedBitSet {
    /// Build an empty bit set with room for `capacity` bits at version 0.
    #[must_use]
    pub fn empty(capacity: usize) -> Self {
        Self {
            words: vec![0u64; wordops::words_for_capacity(capacity)],
            capacity,
            version: 0,
        }
    }

    /// Bit capacity of this set.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Monotonic version, incremented on every publish.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Read bit `idx`. Out-of-range reads return `false`.
    #[must_use]
    pub fn get(&self, idx: usize) -> bool {
        if idx >= self.capacity {
            return false;
        }
        wordops::get(&self.words, idx)
    }

    /// Lowest set bit at or after `from`.
    #[must_use]
    pub fn next_set_bit(&self, from: usize) -> Option<usize> {
        wordops::next_set_bit(&self.words, from, self.capacity)
    }

    /// Lowest clear bit at or after `from`.
    #[must_use]
    pub fn next_clear_bit(&self, from: usize) -> Option<usize> {
        wordops::next_clear_bit(&self.words, from, self.capacity)
    }

    /// Highest set bit plus one, or zero if empty.
    #[must_use]
    pub fn length(&self) -> usize {
        wordops::length(&self.words, self.capacity)
    }

    /// Count of set bits.
    #[must_use]
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Return a new instance with `idx` set, version bumped by one.
    /// Does not mutate `self` — callers publish the result.
    #[must_use]
    pub fn with_set(&self, idx: usize) -> Self {
        self.copy_and_mutate(idx, wordops::set)
    }

    /// Return a new instance with `idx` cleared, version bumped by one.
    #[must_use]
    pub fn with_clear(&self, idx: usize) -> Self {
        self.copy_and_mutate(idx, wordops::clear)
    }

    /// Return a new instance with `idx` flipped, version bumped by one.
    #[must_use]
    pub fn with_flip(&self, idx: usize) -> Self {
        self.copy_and_mutate(idx, wordops::flip)
    }

    fn copy_and_mutate(&self, idx: usize, op: fn(&mut [u64], usize)) -> Self {
        assert!(idx < self.capacity, "bit index {idx} out of range (capacity {})", self.capacity);
        let mut words = self.words.clone();
        op(&mut words, idx);
        Self {
            words,
            capacity: self.capacity,
            version: self.version.wrapping_add(1),
        }
    }
}
