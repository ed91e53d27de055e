//! Per-transaction state machine: composite atomic state word,
//! savepoints, isolation level, and the wait/deadlock protocol.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smallvec::{smallvec, SmallVec};

use fsqlite_error::{FrankenError, Result};

use crate::opid::{make_op_id, LOG_ID_MASK, MAX_LOG_ID};
use crate::store::TxCounterGuard;

/// Isolation level. The layer treats `RepeatableRead`, `Snapshot`, and
/// `Serializable` identically for visibility; `Serializable`'s
/// write-write conflict is additionally enforced by the repeatable-read
/// lock decision-maker (see [`crate::decision`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Isolation {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Snapshot,
    Serializable,
}

impl Isolation {
    /// True when reads should populate the transaction-scoped
    /// `snapshots` map (pinned for the transaction's lifetime) rather
    /// than just the per-statement one.
    #[must_use]
    pub fn is_repeatable_or_higher(self) -> bool {
        matches!(self, Isolation::RepeatableRead | Isolation::Snapshot | Isolation::Serializable)
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransactionStatus {
    Open = 0,
    Prepared = 1,
    Committed = 2,
    RollingBack = 3,
    RolledBack = 4,
    Closed = 5,
}

impl TransactionStatus {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Open,
            1 => Self::Prepared,
            2 => Self::Committed,
            3 => Self::RollingBack,
            4 => Self::RolledBack,
            5 => Self::Closed,
            other => unreachable!("invalid transaction status tag {other}"),
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "OPEN",
            Self::Prepared => "PREPARED",
            Self::Committed => "COMMITTED",
            Self::RollingBack => "ROLLING_BACK",
            Self::RolledBack => "ROLLED_BACK",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

// Composite atomic state word layout: [log_id: 40 bits][status: 3 bits][has_rollback: 1 bit].
const STATUS_SHIFT: u32 = 40;
const STATUS_MASK: u64 = 0b111;
const HAS_ROLLBACK_BIT: u64 = 1 << 43;

fn compose(status: TransactionStatus, has_rollback: bool, log_id: u64) -> u64 {
    debug_assert!(log_id < MAX_LOG_ID);
    (log_id & LOG_ID_MASK) | ((status as u64) << STATUS_SHIFT) | if has_rollback { HAS_ROLLBACK_BIT } else { 0 }
}

fn decompose(word: u64) -> (TransactionStatus, bool, u64) {
    let log_id = word & LOG_ID_MASK;
    let status = TransactionStatus::from_u8(((word >> STATUS_SHIFT) & STATUS_MASK) as u8);
    let has_rollback = word & HAS_ROLLBACK_BIT != 0;
    (status, has_rollback, log_id)
}

/// Weak cross-transaction reference: slot id plus the sequence number
/// that disambiguates slot reincarnation. Never a strong `Arc`
/// reference to another transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxRef {
    pub slot_id: u32,
    pub sequence_num: u64,
}

/// How a caller looks up the live `Transaction` for a slot id, and how
/// many slots exist — implemented by [`crate::store::TxStore`]. Kept as
/// a trait so the wait/deadlock code in this module never has to name
/// `TxStore` directly.
pub trait TransactionLookup {
    fn get_transaction(&self, slot_id: u32) -> Option<Arc<Transaction>>;
    fn max_slots(&self) -> u32;
}

/// Per-transaction state. Cheap to pass around by `Arc`; all mutation
/// goes through the composite atomic word or a `parking_lot` lock on
/// the rarely-touched fields (name, blocking pointers).
pub struct Transaction {
    pub slot_id: u32,
    pub sequence_num: u64,
    pub owner_id: u64,
    pub timeout_millis: i64,
    pub isolation: Isolation,

    state: AtomicU64,

    name: Mutex<Option<String>>,
    blocking_transaction: Mutex<Option<TxRef>>,
    blocking_map: Mutex<Option<String>>,
    blocking_key: Mutex<Option<String>>,

    tx_pin: Mutex<Option<TxCounterGuard>>,
    statement_pin: Mutex<Option<TxCounterGuard>>,

    wait_mutex: Mutex<()>,
    wait_condvar: Condvar,
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("slot_id", &self.slot_id)
            .field("sequence_num", &self.sequence_num)
            .field("status", &self.status())
            .field("log_id", &self.log_id())
            .field("isolation", &self.isolation)
            .finish_non_exhaustive()
    }
}

impl Transaction {
    #[must_use]
    pub fn new(slot_id: u32, sequence_num: u64, owner_id: u64, timeout_millis: i64, isolation: Isolation) -> Self {
        Self {
            slot_id,
            sequence_num,
            owner_id,
            timeout_millis,
            isolation,
            state: AtomicU64::new(compose(TransactionStatus::Open, false, 0)),
            name: Mutex::new(None),
            blocking_transaction: Mutex::new(None),
            blocking_map: Mutex::new(None),
            blocking_key: Mutex::new(None),
            tx_pin: Mutex::new(None),
            statement_pin: Mutex::new(None),
            wait_mutex: Mutex::new(()),
            wait_condvar: Condvar::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> TransactionStatus {
        decompose(self.state.load(Ordering::Acquire)).0
    }

    #[must_use]
    pub fn has_rollback(&self) -> bool {
        decompose(self.state.load(Ordering::Acquire)).1
    }

    #[must_use]
    pub fn log_id(&self) -> u64 {
        decompose(self.state.load(Ordering::Acquire)).2
    }

    #[must_use]
    pub fn has_changes(&self) -> bool {
        self.log_id() > 0
    }

    #[must_use]
    pub fn tx_ref(&self) -> TxRef {
        TxRef { slot_id: self.slot_id, sequence_num: self.sequence_num }
    }

    #[must_use]
    pub fn name(&self) -> Option<String> {
        self.name.lock().clone()
    }

    pub fn set_name(&self, name: impl Into<String>) {
        *self.name.lock() = Some(name.into());
    }

    /// Current blocker, if any — used by `getBlockerId`.
    #[must_use]
    pub fn blocking_transaction(&self) -> Option<TxRef> {
        *self.blocking_transaction.lock()
    }

    /// Loop helper: read the composite word, let `f` decide the next
    /// word (or fail outright), CAS it in, retrying only on a lost
    /// race against a concurrent mutation.
    fn update_state<T>(&self, mut f: impl FnMut(TransactionStatus, bool, u64) -> Result<(u64, T)>) -> Result<T> {
        loop {
            let old = self.state.load(Ordering::Acquire);
            let (status, has_rollback, log_id) = decompose(old);
            let (new_word, ret) = f(status, has_rollback, log_id)?;
            if self
                .state
                .compare_exchange(old, new_word, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(ret);
            }
        }
    }

    fn illegal(reason: impl Into<String>) -> FrankenError {
        FrankenError::TransactionIllegalState { reason: reason.into() }
    }

    /// Append an undo record slot: atomically increments `logId`,
    /// validating that the transaction is still `Open`. Returns the
    /// opId to tag the write with.
    pub fn log(&self) -> Result<u64> {
        let slot_id = self.slot_id;
        let log_id = self.update_state(move |status, has_rollback, log_id| {
            if status != TransactionStatus::Open {
                return Err(Self::illegal(format!("log() on a transaction in state {status}")));
            }
            if log_id + 1 >= MAX_LOG_ID {
                return Err(FrankenError::TransactionTooBig { slot_id });
            }
            Ok((compose(status, has_rollback, log_id + 1), log_id))
        })?;
        Ok(make_op_id(slot_id, log_id))
    }

    /// Symmetric decrement used when a decision-maker's speculative
    /// write was never applied.
    pub fn log_undo(&self) -> Result<()> {
        self.update_state(|status, has_rollback, log_id| {
            if log_id == 0 {
                return Err(Self::illegal("log_undo() with an empty log"));
            }
            Ok((compose(status, has_rollback, log_id - 1), ()))
        })
    }

    /// Record the current log id as a savepoint marker.
    #[must_use]
    pub fn savepoint(&self) -> u64 {
        self.log_id()
    }

    pub fn prepare(&self) -> Result<()> {
        self.update_state(|status, has_rollback, log_id| {
            if status != TransactionStatus::Open {
                return Err(Self::illegal(format!("prepare() from state {status}")));
            }
            Ok((compose(TransactionStatus::Prepared, has_rollback, log_id), ()))
        })
    }

    pub fn mark_committed(&self) -> Result<()> {
        self.update_state(|status, has_rollback, log_id| {
            if !matches!(status, TransactionStatus::Open | TransactionStatus::Prepared) {
                return Err(Self::illegal(format!("commit() from state {status}")));
            }
            Ok((compose(TransactionStatus::Committed, has_rollback, log_id), ()))
        })?;
        self.notify_waiters();
        Ok(())
    }

    pub fn mark_rolled_back(&self) -> Result<()> {
        self.update_state(|status, _has_rollback, log_id| {
            if !matches!(status, TransactionStatus::Open | TransactionStatus::Prepared) {
                return Err(Self::illegal(format!("rollback() from state {status}")));
            }
            Ok((compose(TransactionStatus::RolledBack, true, log_id), ()))
        })?;
        self.notify_waiters();
        Ok(())
    }

    pub fn mark_closed(&self) -> Result<()> {
        self.update_state(|status, has_rollback, log_id| {
            if !matches!(status, TransactionStatus::Committed | TransactionStatus::RolledBack) {
                return Err(Self::illegal(format!("close from state {status}")));
            }
            Ok((compose(TransactionStatus::Closed, has_rollback, log_id), ()))
        })?;
        self.release_pins();
        self.notify_waiters();
        Ok(())
    }

    /// First half of a savepoint rollback: `Open -> RollingBack`.
    /// Returns the log id to roll back from.
    pub fn begin_savepoint_rollback(&self) -> Result<u64> {
        self.update_state(|status, has_rollback, log_id| {
            if status != TransactionStatus::Open {
                return Err(Self::illegal(format!("rollbackToSavepoint() from state {status}")));
            }
            Ok((compose(TransactionStatus::RollingBack, has_rollback, log_id), log_id))
        })
    }

    /// Second half: `RollingBack -> Open`, with `hasRollback` now set
    /// and `logId` restored to the savepoint's value.
    pub fn end_savepoint_rollback(&self, new_log_id: u64) -> Result<()> {
        self.update_state(|status, _has_rollback, _log_id| {
            if status != TransactionStatus::RollingBack {
                return Err(Self::illegal(format!(
                    "end_savepoint_rollback() raced: expected RollingBack, found {status}"
                )));
            }
            Ok((compose(TransactionStatus::Open, true, new_log_id), ()))
        })
    }

    // -- statement/snapshot pinning --------------------------------------

    pub fn mark_statement_start(&self, tracker: &crate::store::VersionTracker) {
        match self.isolation {
            Isolation::ReadUncommitted => {}
            Isolation::ReadCommitted => {
                *self.statement_pin.lock() = Some(tracker.register_version_usage());
            }
            Isolation::RepeatableRead | Isolation::Snapshot | Isolation::Serializable => {
                let mut pin = self.tx_pin.lock();
                if pin.is_none() {
                    *pin = Some(tracker.register_version_usage());
                }
            }
        }
    }

    pub fn mark_statement_end(&self) {
        if self.isolation == Isolation::ReadCommitted {
            *self.statement_pin.lock() = None;
        }
    }

    fn release_pins(&self) {
        *self.tx_pin.lock() = None;
        *self.statement_pin.lock() = None;
    }

    // -- wait / deadlock --------------------------------------------------

    fn notify_waiters(&self) {
        let _guard = self.wait_mutex.lock();
        self.wait_condvar.notify_all();
    }

    /// Block until `other` closes, rolls back, or `timeout_ms`
    /// elapses. `timeout_ms == -2` is a try-lock: returns `Ok(false)`
    /// immediately without waiting. Runs cycle detection first and
    /// returns `Err(Deadlock)` if `self` would be the victim.
    pub fn wait_for(
        self: &Arc<Self>,
        other: &Arc<Transaction>,
        lookup: &dyn TransactionLookup,
        map_name: impl Into<String>,
        key_desc: impl Into<String>,
        timeout_ms: i64,
    ) -> Result<bool> {
        *self.blocking_transaction.lock() = Some(other.tx_ref());
        *self.blocking_map.lock() = Some(map_name.into());
        *self.blocking_key.lock() = Some(key_desc.into());

        let result = self.wait_for_inner(other, lookup, timeout_ms);

        *self.blocking_transaction.lock() = None;
        *self.blocking_map.lock() = None;
        *self.blocking_key.lock() = None;
        result
    }

    fn wait_for_inner(
        self: &Arc<Self>,
        other: &Arc<Transaction>,
        lookup: &dyn TransactionLookup,
        timeout_ms: i64,
    ) -> Result<bool> {
        if let Some(cycle) = detect_cycle(self.slot_id, other, lookup) {
            let report = format_cycle(&cycle);
            tracing::warn!(victim = self.slot_id, %report, "deadlock detected");
            return Err(FrankenError::Deadlock { victim_slot: self.slot_id, report });
        }

        if timeout_ms == -2 {
            return Ok(false);
        }

        let mut guard = other.wait_mutex.lock();
        let deadline = if timeout_ms < 0 { None } else { Some(Instant::now() + Duration::from_millis(timeout_ms as u64)) };

        loop {
            if matches!(other.status(), TransactionStatus::Closed | TransactionStatus::RolledBack) || other.has_rollback() {
                return Ok(true);
            }
            match deadline {
                None => {
                    other.wait_condvar.wait(&mut guard);
                }
                Some(d) => {
                    let now = Instant::now();
                    if now >= d {
                        return Ok(false);
                    }
                    let timeout_result = other.wait_condvar.wait_for(&mut guard, d - now);
                    if timeout_result.timed_out() {
                        return Ok(false);
                    }
                }
            }
        }
    }
}

/// Follow `blockingTransaction` links starting at `start`; if the chain
/// returns to `victim_slot` while every node visited is `Open`, return
/// the cycle (victim first). Chains longer than `max_slots` are
/// treated as broken (not a cycle) — a generation check against a
/// stale weak reference, not a real cycle, stopped the walk.
fn detect_cycle(victim_slot: u32, start: &Arc<Transaction>, lookup: &dyn TransactionLookup) -> Option<SmallVec<[u32; 8]>> {
    let mut path: SmallVec<[u32; 8]> = smallvec![victim_slot];
    let mut current = Arc::clone(start);
    let bound = lookup.max_slots() as usize + 2;

    loop {
        if current.slot_id == victim_slot {
            path.push(current.slot_id);
            return Some(path);
        }
        if current.status() != TransactionStatus::Open {
            return None;
        }
        path.push(current.slot_id);
        if path.len() > bound {
            return None;
        }
        let next = current.blocking_transaction();
        let Some(next_ref) = next else { return None };
        match lookup.get_transaction(next_ref.slot_id) {
            Some(t) if t.sequence_num == next_ref.sequence_num => current = t,
            _ => return None,
        }
    }
}

fn format_cycle(cycle: &[u32]) -> String {
    let chain: Vec<String> = cycle.iter().map(std::string::ToString::to_string).collect();
    format!("cycle: {}", chain.join(" -> "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex as StdMutex;

    struct FakeLookup {
        txs: StdMutex<HashMap<u32, Arc<Transaction>>>,
    }
    impl TransactionLookup for FakeLookup {
        fn get_transaction(&self, slot_id: u32) -> Option<Arc<Transaction>> {
            self.txs.lock().unwrap().get(&slot_id).cloned()
        }
        fn max_slots(&self) -> u32 {
            1024
        }
    }

    fn tx(slot: u32, seq: u64) -> Arc<Transaction> {
        Arc::new(Transaction::new(slot, seq, 0, 1000, Isolation::ReadCommitted))
    }

    #[test]
    fn log_increments_and_packs_opid() {
        let t = tx(1, 1);
        let op1 = t.log().unwrap();
        let op2 = t.log().unwrap();
        assert_eq!(crate::opid::slot_of(op1), 1);
        assert_eq!(crate::opid::log_id_of(op1), 0);
        assert_eq!(crate::opid::log_id_of(op2), 1);
        assert_eq!(t.log_id(), 2);
    }

    #[test]
    fn log_undo_decrements_and_rejects_underflow() {
        let t = tx(1, 1);
        t.log().unwrap();
        t.log_undo().unwrap();
        assert_eq!(t.log_id(), 0);
        assert!(t.log_undo().is_err());
    }

    #[test]
    fn log_rejects_once_not_open() {
        let t = tx(1, 1);
        t.prepare().unwrap();
        assert!(t.log().is_err());
    }

    #[test]
    fn full_lifecycle_transitions() {
        let t = tx(1, 1);
        assert_eq!(t.status(), TransactionStatus::Open);
        t.prepare().unwrap();
        assert_eq!(t.status(), TransactionStatus::Prepared);
        t.mark_committed().unwrap();
        assert_eq!(t.status(), TransactionStatus::Committed);
        t.mark_closed().unwrap();
        assert_eq!(t.status(), TransactionStatus::Closed);
        assert!(t.mark_committed().is_err());
    }

    #[test]
    fn savepoint_rollback_round_trip_sets_has_rollback() {
        let t = tx(1, 1);
        t.log().unwrap();
        t.log().unwrap();
        let savepoint = t.savepoint();
        t.log().unwrap();
        assert_eq!(t.log_id(), 3);
        let from = t.begin_savepoint_rollback().unwrap();
        assert_eq!(from, 3);
        assert_eq!(t.status(), TransactionStatus::RollingBack);
        t.end_savepoint_rollback(savepoint).unwrap();
        assert_eq!(t.status(), TransactionStatus::Open);
        assert_eq!(t.log_id(), savepoint);
        assert!(t.has_rollback());
    }

    #[test]
    fn wait_for_try_lock_returns_false_without_blocking() {
        let lookup = FakeLookup { txs: StdMutex::new(HashMap::new()) };
        let a = tx(1, 1);
        let b = tx(2, 1);
        let got = a.wait_for(&b, &lookup, "m", "k".to_string(), -2).unwrap();
        assert!(!got);
        assert!(a.blocking_transaction().is_none(), "blocking fields must be cleared on exit");
    }

    #[test]
    fn wait_for_wakes_on_commit() {
        let lookup = Arc::new(FakeLookup { txs: StdMutex::new(HashMap::new()) });
        let a = tx(1, 1);
        let b = tx(2, 1);
        lookup.txs.lock().unwrap().insert(1, a.clone());
        lookup.txs.lock().unwrap().insert(2, b.clone());

        let b2 = b.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            b2.mark_committed().unwrap();
            b2.mark_closed().unwrap();
        });

        let lookup_ref: &dyn TransactionLookup = &*lookup;
        let got = a.wait_for(&b, lookup_ref, "m", "k".to_string(), 2000).unwrap();
        assert!(got);
        handle.join().unwrap();
    }

    #[test]
    fn wait_for_times_out() {
        let lookup = FakeLookup { txs: StdMutex::new(HashMap::new()) };
        let a = tx(1, 1);
        let b = tx(2, 1);
        let got = a.wait_for(&b, &lookup, "m", "k".to_string(), 20).unwrap();
        assert!(!got);
    }

    #[test]
    fn two_cycle_deadlock_detected() {
        let lookup = Arc::new(FakeLookup { txs: StdMutex::new(HashMap::new()) });
        let a = tx(1, 1);
        let b = tx(2, 1);
        lookup.txs.lock().unwrap().insert(1, a.clone());
        lookup.txs.lock().unwrap().insert(2, b.clone());

        // b is already waiting on a (simulates b having called wait_for first).
        *b.blocking_transaction.lock() = Some(a.tx_ref());

        let lookup_ref: &dyn TransactionLookup = &*lookup;
        let err = a.wait_for(&b, lookup_ref, "m", "k".to_string(), 500).unwrap_err();
        match err {
            FrankenError::Deadlock { victim_slot, .. } => assert_eq!(victim_slot, 1),
            other => panic!("expected Deadlock, got {other:?}"),
        }
    }
}
