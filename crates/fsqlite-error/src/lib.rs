//! Shared error type for the transaction layer.
//!
//! Every fallible operation in `fsqlite-mvcc` returns [`Result<T>`], a
//! thin alias over [`FrankenError`]. The transaction-specific variants
//! correspond one-to-one with the error kinds a caller can observe;
//! everything else (`Io`, `Substrate`, `Serialization`) exists because a
//! real crate touches bytes and an underlying store, not just logical
//! state.

use std::fmt;

/// The error type threaded through the transaction layer.
#[derive(Debug, thiserror::Error)]
pub enum FrankenError {
    /// The slot bitmap is full; no transaction can be started until one
    /// closes.
    #[error("too many open transactions (limit = {max_slots})")]
    TooManyOpenTransactions {
        /// Configured slot capacity.
        max_slots: u32,
    },

    /// A transaction's log id grew past the 2^40 bound encodable in an
    /// opId.
    #[error("transaction {slot_id} exceeded the maximum undo log size")]
    TransactionTooBig {
        /// Slot id of the offending transaction.
        slot_id: u32,
    },

    /// An operation was attempted that is illegal for the transaction's
    /// current state (e.g. committing a closed transaction, or a
    /// concurrent state-word CAS race during savepoint rollback).
    #[error("illegal transaction state: {reason}")]
    TransactionIllegalState {
        /// Human-readable description of the violated transition.
        reason: String,
    },

    /// Recovery found an undo log that does not satisfy the write-ahead
    /// invariant.
    #[error("corrupt undo log for slot {slot_id}: {reason}")]
    TransactionCorrupt {
        /// Slot id whose log failed to validate.
        slot_id: u32,
        /// What was wrong with it.
        reason: String,
    },

    /// `waitFor` timed out before the blocking transaction released its
    /// lock.
    #[error("lock timeout waiting on slot {blocking_slot} after {timeout_ms}ms")]
    LockTimeout {
        /// Slot id of the transaction we were waiting on.
        blocking_slot: u32,
        /// Timeout that elapsed.
        timeout_ms: i64,
    },

    /// Cycle detected in the wait-for graph; `victim_slot` was aborted.
    #[error("deadlock detected: {report}")]
    Deadlock {
        /// Slot id chosen as the victim.
        victim_slot: u32,
        /// Human-readable cycle description.
        report: String,
    },

    /// The underlying ordered-map substrate reported a failure (as
    /// opposed to a logical transaction-layer error).
    #[error("storage substrate error: {0}")]
    Substrate(String),

    /// A wire-format decode/encode failure in the undo log or versioned
    /// cell codec.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Wraps `std::io::Error` for substrates backed by real files.
    #[error("I/O error: {0}")]
    Io(#[from] IoErrorWrapper),
}

/// `std::io::Error` does not implement `Clone`/`PartialEq`, which makes
/// it awkward to embed directly in an enum that test code wants to
/// match on; wrap it so `FrankenError` stays easy to construct from
/// `#[from]` while keeping the message around for display.
#[derive(Debug)]
pub struct IoErrorWrapper(pub std::io::Error);

impl fmt::Display for IoErrorWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<std::io::Error> for FrankenError {
    fn from(e: std::io::Error) -> Self {
        FrankenError::Io(IoErrorWrapper(e))
    }
}

/// Result alias used throughout the transaction layer.
pub type Result<T> = std::result::Result<T, FrankenError>;

impl FrankenError {
    /// True for errors that are expected to surface to the caller per
    /// the error-handling policy (lock timeout, deadlock); all other
    /// contention is handled internally and never constructs a
    /// `FrankenError` in the first place.
    #[must_use]
    pub fn is_caller_visible_contention(&self) -> bool {
        matches!(self, FrankenError::LockTimeout { .. } | FrankenError::Deadlock { .. })
    }
}
