//! Operation identifier packing.
//!
//! An opId is a 64-bit integer packing a slot id (upper bits) and a log
//! id (lower 40 bits). Zero is reserved and marks a committed cell.

/// Number of bits reserved for the log id in the lower part of an opId.
pub const LOG_ID_BITS: u32 = 40;

/// Mask selecting the log-id bits of an opId.
pub const LOG_ID_MASK: u64 = (1u64 << LOG_ID_BITS) - 1;

/// Exclusive upper bound on log ids; `Transaction::log` must reject any
/// attempt to reach this value.
pub const MAX_LOG_ID: u64 = 1u64 << LOG_ID_BITS;

/// Sentinel opId meaning "committed" (no pending writer).
pub const COMMITTED_OP_ID: u64 = 0;

/// Default slot capacity, matching the reference implementation this
/// layer is modeled on.
pub const DEFAULT_MAX_SLOTS: u32 = 65_535;

/// Pack a slot id and log id into a single opId.
///
/// # Panics
/// Panics if `log_id >= MAX_LOG_ID`; callers must check via
/// [`Transaction::log`](crate::transaction::Transaction::log) which
/// enforces the bound before ever calling this.
#[must_use]
pub fn make_op_id(slot_id: u32, log_id: u64) -> u64 {
    debug_assert!(log_id < MAX_LOG_ID, "log id {log_id} overflows the 40-bit field");
    (u64::from(slot_id) << LOG_ID_BITS) | (log_id & LOG_ID_MASK)
}

/// Extract the slot id from an opId.
#[must_use]
pub fn slot_of(op_id: u64) -> u32 {
    (op_id >> LOG_ID_BITS) as u32
}

/// Extract the log id from an opId.
#[must_use]
pub fn log_id_of(op_id: u64) -> u64 {
    op_id & LOG_ID_MASK
}

/// True when `op_id` marks a committed cell (no pending writer).
#[must_use]
pub fn is_committed(op_id: u64) -> bool {
    op_id == COMMITTED_OP_ID
}
