//! End-to-end scenarios exercised against the in-memory reference
//! substrate, one per numbered case.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use fsqlite_mvcc::transaction::TransactionLookup;
use fsqlite_mvcc::{FrankenError, Isolation, StoreConfig, TxMap, TxStore, VersionedCell};

fn store(max_slots: u32) -> Arc<TxStore<u64, String>> {
    Arc::new(TxStore::new(StoreConfig::builder().max_slots(max_slots).build()))
}

#[test]
fn simple_commit() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
    {
        let m1 = TxMap::new(&s, t1.clone(), 1, "m");
        m1.put(1, "a".to_string()).unwrap();
        m1.put(2, "b".to_string()).unwrap();
    }
    s.commit(&t1).unwrap();

    let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2, 1, "m");
    assert_eq!(m2.get(&1), Some("a".to_string()));
    assert_eq!(m2.get(&2), Some("b".to_string()));
    assert_eq!(m2.get(&3), None);
}

#[test]
fn uncommitted_invisible_under_read_committed() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
    {
        let m1 = TxMap::new(&s, t1.clone(), 1, "m");
        m1.put(1, "x".to_string()).unwrap();
    }

    let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2.clone(), 1, "m");
    assert_eq!(m2.get(&1), None, "T1's uncommitted write must be invisible to T2 under read committed");

    s.commit(&t1).unwrap();
    m2.mark_statement_start();
    assert_eq!(m2.get(&1), Some("x".to_string()), "a fresh statement must observe the newly committed value");
}

#[test]
fn uncommitted_visible_under_read_uncommitted() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    m1.put(1, "x".to_string()).unwrap();

    let t2 = s.begin(2, Isolation::ReadUncommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2, 1, "m");
    assert_eq!(m2.get(&1), Some("x".to_string()));

    s.rollback(&t1).unwrap();
    assert_eq!(m2.get(&1), None, "a rolled-back write must disappear even under read uncommitted");
}

#[test]
fn put_if_absent_blocks_then_reports_existing_without_inserting() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    m1.put(1, "a".to_string()).unwrap();

    let s2 = Arc::clone(&s);
    let t1_for_thread = t1.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        s2.commit(&t1_for_thread).unwrap();
    });

    let t2 = s.begin(2, Isolation::ReadCommitted, 2000).unwrap();
    let m2 = TxMap::new(&s, t2, 1, "m");
    let inserted = m2.put_if_absent(1, "b".to_string()).unwrap();
    handle.join().unwrap();

    assert!(!inserted, "T2 must see T1's committed value and decline to insert");
    assert_eq!(m2.get(&1), Some("a".to_string()));
}

#[test]
fn deadlock_exactly_one_victim() {
    let s = store(16);
    // Locking only claims ownership of a key that already exists, so
    // seed both rows with a committed value first.
    s.substrate().force_put(1u64, fsqlite_mvcc::VersionedCell::committed("row1".to_string()));
    s.substrate().force_put(2u64, fsqlite_mvcc::VersionedCell::committed("row2".to_string()));

    let t1 = s.begin(1, Isolation::ReadCommitted, 2000).unwrap();
    let t2 = s.begin(2, Isolation::ReadCommitted, 2000).unwrap();

    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    let m2 = TxMap::new(&s, t2.clone(), 1, "m");
    m1.lock(&1).unwrap();
    m2.lock(&2).unwrap();

    let s_a = Arc::clone(&s);
    let t1_a = t1.clone();
    let handle = thread::spawn(move || {
        let m = TxMap::new(&s_a, t1_a, 1, "m");
        m.lock(&2)
    });

    thread::sleep(Duration::from_millis(30));
    let second = m2.lock(&1);
    if matches!(second, Err(FrankenError::Deadlock { .. })) {
        // The detector picked T2 as the victim: it must give up its
        // locks so T1's still-blocked wait can wake and complete.
        s.rollback(&t2).unwrap();
    }

    let first = handle.join().unwrap();
    if matches!(first, Err(FrankenError::Deadlock { .. })) {
        s.rollback(&t1).unwrap();
    }

    let deadlocks = [&first, &second].into_iter().filter(|r| matches!(r, Err(FrankenError::Deadlock { .. }))).count();
    let successes = [&first, &second].into_iter().filter(|r| r.is_ok()).count();
    assert_eq!(deadlocks, 1, "exactly one side must observe Deadlock");
    assert_eq!(successes, 1, "the other side must complete once the deadlocked one releases");
}

#[test]
fn recovery_of_an_uncommitted_transaction_rolls_back() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    m1.put(1, "a".to_string()).unwrap();

    // Simulate a crash: drop the in-memory transaction handle without
    // committing or rolling back, then run recovery as a fresh open
    // would. The undo log is still seeded from the uncommitted write
    // (`log_and_record` already wrote it), so recovery finds it directly.
    drop(t1);
    drop(m1);

    let report = s.recover();
    assert!(report.rolled_back_slots.contains(&1));
    assert!(s.get_transaction(1).is_none(), "recovered slot must be free for reuse");
    assert!(fsqlite_mvcc::substrate::Substrate::get(&s.substrate().root(), &1).is_none());
}

#[test]
fn commit_marker_recovery_replays_forward() {
    let s = store(16);

    // Seed as if T1 had reached the committing phase before the crash:
    // the key's live cell already carries T1's opId, and the slot's
    // undo log is marked committing.
    let op_id = fsqlite_mvcc::opid::make_op_id(1, 0);
    s.substrate().force_put(1u64, fsqlite_mvcc::VersionedCell::uncommitted(op_id, Some("a".to_string()), None));
    s.seed_undo_log_for_recovery(1, vec![(op_id, fsqlite_mvcc::undo::UndoRecord::change(1, 1u64, None))], true);

    let report = s.recover();
    assert!(report.committed_slots.contains(&1));

    let t = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m = TxMap::new(&s, t, 1, "m");
    assert_eq!(m.get(&1), Some("a".to_string()));
}

#[test]
fn snapshot_stability_under_repeatable_read() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::RepeatableRead, 1000).unwrap();
    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    m1.mark_statement_start();
    assert_eq!(m1.get(&1), None);

    let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2.clone(), 1, "m");
    m2.put(1, "a".to_string()).unwrap();
    s.commit(&t2).unwrap();

    assert_eq!(m1.get(&1), None, "T1's repeatable-read snapshot must not see T2's later commit");
    s.commit(&t1).unwrap();

    let t3 = s.begin(3, Isolation::ReadCommitted, 1000).unwrap();
    let m3 = TxMap::new(&s, t3, 1, "m");
    assert_eq!(m3.get(&1), Some("a".to_string()));
}

#[test]
fn repeatable_read_sees_its_own_write_on_top_of_its_pinned_snapshot() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::RepeatableRead, 1000).unwrap();
    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    m1.mark_statement_start();
    assert_eq!(m1.get(&1), None, "pins the statement snapshot on first read");

    m1.put(1, "mine".to_string()).unwrap();
    assert_eq!(m1.get(&1), Some("mine".to_string()), "T1 must see its own write despite its frozen snapshot");
    assert_eq!(m1.iter_committed(), vec![(1, "mine".to_string())]);

    s.commit(&t1).unwrap();
    let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2, 1, "m");
    assert_eq!(m2.get(&1), Some("mine".to_string()));
}

#[test]
fn a_second_transaction_can_write_a_key_left_behind_by_a_vanished_slot() {
    let s = store(16);
    // An uncommitted cell whose owner slot was never allocated by this
    // store stands in for a cell left behind by a slot that was freed
    // without the cell itself ever being cleaned up (e.g. a crash
    // between forward-committing a write and clearing its cell).
    s.substrate().force_put(
        1,
        VersionedCell::uncommitted(fsqlite_mvcc::opid::make_op_id(9, 0), Some("orphaned".to_string()), Some("base".to_string())),
    );
    assert!(s.get_transaction(9).is_none(), "slot 9 must not map to any live transaction");

    let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2.clone(), 1, "m");
    assert_eq!(m2.get(&1), Some("base".to_string()), "a non-owner must see the orphan's baseline, not its abandoned write");
    m2.put(1, "mine".to_string()).unwrap();
    assert_eq!(m2.get(&1), Some("mine".to_string()), "write must succeed without hanging behind a dead owner's leftover cell");
}

#[test]
fn try_lock_reports_contention_without_waiting() {
    let s = store(16);
    let t1 = s.begin(1, Isolation::ReadCommitted, 1000).unwrap();
    let m1 = TxMap::new(&s, t1.clone(), 1, "m");
    m1.put(1, "a".to_string()).unwrap();

    let t2 = s.begin(2, Isolation::ReadCommitted, 1000).unwrap();
    let m2 = TxMap::new(&s, t2, 1, "m");
    let started = std::time::Instant::now();
    assert_eq!(m2.try_lock(&1).unwrap(), false);
    assert!(started.elapsed() < Duration::from_millis(200), "try_lock must return immediately, not wait out the timeout");
}
