// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    columns::{AccessListColumn, MetaColumn, SpinLockColumn, ValueColumn},
    sgt, twopl,
    types::access,
};
use claims::{assert_err, assert_none, assert_ok, assert_some_eq};
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::{
    collections::HashSet,
    sync::atomic::{AtomicBool, Ordering},
};
use test_case::test_case;

/// Record state for the locking variant: payloads plus lsn, access lists and
/// the lock table.
struct LockingTable {
    column: ValueColumn<i64>,
    lsn: MetaColumn,
    rw_table: AccessListColumn,
    locks: twopl::LockTable,
}

impl LockingTable {
    fn new(len: usize, init: i64) -> Self {
        Self {
            column: ValueColumn::new(len, init),
            lsn: MetaColumn::new(len),
            rw_table: AccessListColumn::new(len),
            locks: twopl::LockTable::new(len),
        }
    }
}

/// Record state for the optimistic variant: payloads plus lsn, access lists
/// and the per-record install spinlocks.
struct OptimisticTable {
    column: ValueColumn<i64>,
    lsn: MetaColumn,
    rw_table: AccessListColumn,
    locked: SpinLockColumn,
}

impl OptimisticTable {
    fn new(len: usize, init: i64) -> Self {
        Self {
            column: ValueColumn::new(len, init),
            lsn: MetaColumn::new(len),
            rw_table: AccessListColumn::new(len),
            locked: SpinLockColumn::new(len),
        }
    }
}

#[test]
fn twopl_solo_read_write_commit() {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(8, 0);
    let mut session = coordinator.session::<i64>(0);

    let txn = session.start();
    assert!(session.write_value(
        42,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locks,
        0,
        txn,
        false,
    ));
    assert_some_eq!(
        session.read_value(&table.column, &table.lsn, &table.rw_table, &table.locks, 0, txn),
        42
    );
    assert_ok!(session.commit(txn));
    assert_eq!(table.column.index(0), 42);
    // All record-table entries were deallocated on commit.
    assert_eq!(table.rw_table.entry_count(0), 0);
}

#[test]
fn sgt_solo_read_write_commit() {
    let coordinator = sgt::TransactionCoordinator::new();
    let table = OptimisticTable::new(8, 0);
    let mut session = coordinator.session::<i64>(0);

    let txn = session.start();
    assert!(session.write_value(
        42,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locked,
        0,
        txn,
        false,
    ));
    assert_some_eq!(
        session.read_value(&table.column, &table.lsn, &table.rw_table, &table.locked, 0, txn),
        42
    );
    assert_ok!(session.commit(txn));
    assert_eq!(table.column.index(0), 42);
    assert_eq!(table.rw_table.entry_count(0), 0);
}

#[test]
#[should_panic(expected = "core id 200 out of range")]
fn session_rejects_out_of_range_core() {
    let coordinator = twopl::TransactionCoordinator::new();
    let _ = coordinator.session::<i64>(200);
}

#[test]
fn twopl_installed_access_is_visible() {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(2, 0);
    let mut session = coordinator.session::<i64>(0);

    let txn = session.start();
    assert!(session.read(&table.lsn, &table.rw_table, &table.locks, 1, txn));
    // A reader that installed at `prv` observes lsn past it and finds its
    // own tag in the record's access list.
    assert!(table.lsn.index(1) >= 1);
    let tags: Vec<u64> = table.rw_table.snapshot(1).iter().map(|(_, tag)| *tag).collect();
    assert!(tags.contains(&access(txn, false)));
    assert_ok!(session.commit(txn));
}

#[test]
fn twopl_write_write_conflict_denies_younger() {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(8, 0);
    let mut older = coordinator.session::<i64>(0);
    let mut younger = coordinator.session::<i64>(1);

    let t_old = older.start();
    assert!(older.write_value(
        7,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locks,
        7,
        t_old,
        false,
    ));

    let t_young = younger.start();
    assert!(!younger.write_value(
        8,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locks,
        7,
        t_young,
        false,
    ));
    // The denied writer died without wounding anyone.
    let victims = assert_err!(younger.commit(t_young));
    assert!(victims.is_empty());

    assert_ok!(older.commit(t_old));
    assert_eq!(table.column.index(7), 7);
}

#[test]
fn twopl_writer_behind_reader_retries_after_commit() {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(8, 10);
    let mut reader = coordinator.session::<i64>(0);
    let mut writer = coordinator.session::<i64>(1);

    let t_read = reader.start();
    assert_some_eq!(
        reader.read_value(&table.column, &table.lsn, &table.rw_table, &table.locks, 3, t_read),
        10
    );

    // The younger writer is denied while the read lock is held.
    let t_write = writer.start();
    assert!(!writer.write_value(
        100,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locks,
        3,
        t_write,
        false,
    ));
    let victims = assert_err!(writer.commit(t_write));
    assert!(victims.is_empty());

    assert_ok!(reader.commit(t_read));

    // Retrying as a fresh transaction succeeds once the reader is gone.
    let t_retry = writer.start();
    assert!(writer.write_value(
        100,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locks,
        3,
        t_retry,
        false,
    ));
    assert_ok!(writer.commit(t_retry));
    assert_eq!(table.column.index(3), 100);
}

#[test]
fn twopl_older_writer_wounds_running_reader() {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(4, 5);
    let reader_holding = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let coordinator = &coordinator;
        let table = &table;
        let reader_holding = &reader_holding;

        scope.spawn(move || {
            let mut victim = coordinator.session::<i64>(9);
            let txn = victim.start();
            assert_some_eq!(
                victim.read_value(
                    &table.column,
                    &table.lsn,
                    &table.rw_table,
                    &table.locks,
                    0,
                    txn
                ),
                5
            );
            reader_holding.store(true, Ordering::Release);
            // Keep issuing reads until the wound lands.
            loop {
                if victim
                    .read_value(&table.column, &table.lsn, &table.rw_table, &table.locks, 1, txn)
                    .is_none()
                {
                    break;
                }
                std::thread::yield_now();
            }
            let victims = assert_err!(victim.commit(txn));
            assert!(victims.is_empty());
        });

        while !reader_holding.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        // Core 0 ranks older than the reader on core 9 and wounds it.
        let mut writer = coordinator.session::<i64>(0);
        let txn = writer.start();
        assert!(writer.write_value(
            50,
            &table.column,
            &table.lsn,
            &table.rw_table,
            &table.locks,
            0,
            txn,
            false,
        ));
        assert_ok!(writer.commit(txn));
    });

    assert_eq!(table.column.index(0), 50);
    assert_eq!(table.rw_table.entry_count(0), 0);
    assert_eq!(table.rw_table.entry_count(1), 0);
}

#[test_case(&[7]; "single write")]
#[test_case(&[7, 9]; "double write")]
#[test_case(&[7, 9, 11]; "triple write")]
fn twopl_abort_restores_pre_image(values: &[i64]) {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(4, 5);
    let mut session = coordinator.session::<i64>(0);

    let txn = session.start();
    for value in values {
        assert!(session.write_value(
            *value,
            &table.column,
            &table.lsn,
            &table.rw_table,
            &table.locks,
            1,
            txn,
            false,
        ));
    }
    session.abort(txn);
    let victims = assert_err!(session.commit(txn));
    assert!(victims.is_empty());
    // LIFO undo leaves the value present before the transaction started.
    assert_eq!(table.column.index(1), 5);
    assert_eq!(table.rw_table.entry_count(1), 0);
}

#[test_case(&[7]; "single write")]
#[test_case(&[7, 9]; "double write")]
fn sgt_abort_restores_pre_image(values: &[i64]) {
    let coordinator = sgt::TransactionCoordinator::new();
    let table = OptimisticTable::new(4, 5);
    let mut session = coordinator.session::<i64>(0);

    let txn = session.start();
    for value in values {
        assert!(session.write_value(
            *value,
            &table.column,
            &table.lsn,
            &table.rw_table,
            &table.locked,
            1,
            txn,
            false,
        ));
    }
    session.abort(txn);
    let victims = assert_err!(session.commit(txn));
    assert!(victims.is_empty());
    assert_eq!(table.column.index(1), 5);
    assert_eq!(table.rw_table.entry_count(1), 0);
}

#[test]
fn sgt_abort_cascades_to_dirty_reader() {
    let coordinator = sgt::TransactionCoordinator::new();
    let table = OptimisticTable::new(8, 1);
    let mut writer = coordinator.session::<i64>(0);
    let mut reader = coordinator.session::<i64>(1);

    let t_writer = writer.start();
    assert!(writer.write_value(
        99,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locked,
        5,
        t_writer,
        false,
    ));

    // The reader observes the uncommitted install and picks up a cascade
    // dependency on the writer.
    let t_reader = reader.start();
    assert_some_eq!(
        reader.read_value(&table.column, &table.lsn, &table.rw_table, &table.locked, 5, t_reader),
        99
    );

    writer.abort(t_writer);
    let victims = assert_err!(writer.commit(t_writer));
    assert_eq!(victims, HashSet::from([t_reader]));

    // The victim notices at its next operation and dies with an empty
    // cascade set of its own.
    assert_none!(reader.read_value(
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locked,
        5,
        t_reader
    ));
    let victims = assert_err!(reader.commit(t_reader));
    assert!(victims.is_empty());

    assert_eq!(table.column.index(5), 1);
    assert_eq!(table.rw_table.entry_count(5), 0);
}

#[test]
fn sgt_cycle_aborts_one_survivor_commits() {
    let coordinator = sgt::TransactionCoordinator::new();
    let table = OptimisticTable::new(8, 0);
    let mut a = coordinator.session::<i64>(0);
    let mut b = coordinator.session::<i64>(1);
    let (x, y) = (0usize, 1usize);

    let t_a = a.start();
    let t_b = b.start();

    // Write skew: both read the record the other one writes. The cycle
    // consists of read-write edges only, so the survivor holds no dirty
    // read and commits cleanly.
    assert_some_eq!(
        a.read_value(&table.column, &table.lsn, &table.rw_table, &table.locked, x, t_a),
        0
    );
    assert_some_eq!(
        b.read_value(&table.column, &table.lsn, &table.rw_table, &table.locked, y, t_b),
        0
    );
    assert!(a.write_value(
        1,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locked,
        y,
        t_a,
        false,
    ));
    // Closing the cycle fails the second writer's own operation.
    assert!(!b.write_value(
        1,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locked,
        x,
        t_b,
        false,
    ));

    assert_ok!(a.commit(t_a));
    let victims = assert_err!(b.commit(t_b));
    assert!(victims.is_empty());

    assert_eq!(table.column.index(x), 0);
    assert_eq!(table.column.index(y), 1);
}

#[test]
fn sgt_second_writer_waits_for_commit() {
    let coordinator = sgt::TransactionCoordinator::new();
    let table = OptimisticTable::new(4, 0);
    let first_installed = AtomicBool::new(false);

    std::thread::scope(|scope| {
        let coordinator = &coordinator;
        let table = &table;
        let first_installed = &first_installed;

        scope.spawn(move || {
            let mut first = coordinator.session::<i64>(0);
            let txn = first.start();
            assert!(first.write_value(
                10,
                &table.column,
                &table.lsn,
                &table.rw_table,
                &table.locked,
                0,
                txn,
                false,
            ));
            first_installed.store(true, Ordering::Release);
            assert_ok!(first.commit(txn));
        });

        while !first_installed.load(Ordering::Acquire) {
            std::thread::yield_now();
        }
        // This write is taken back out and retried until the first writer
        // commits; it must never overtake it.
        let mut second = coordinator.session::<i64>(1);
        let txn = second.start();
        assert!(second.write_value(
            20,
            &table.column,
            &table.lsn,
            &table.rw_table,
            &table.locked,
            0,
            txn,
            false,
        ));
        assert_ok!(second.commit(txn));
    });

    assert_eq!(table.column.index(0), 20);
    assert_eq!(table.rw_table.entry_count(0), 0);
}

#[test]
fn twopl_transfer_conservation_under_contention() {
    const SLOTS: usize = 4;
    const WORKERS: u8 = 4;
    const TRANSFERS: usize = 100;
    const INITIAL: i64 = 1_000;

    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(SLOTS, INITIAL);

    std::thread::scope(|scope| {
        for worker in 0..WORKERS {
            let coordinator = &coordinator;
            let table = &table;
            scope.spawn(move || {
                let mut rng = StdRng::seed_from_u64(worker as u64);
                let mut session = coordinator.session::<i64>(worker);
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0..SLOTS);
                    let to = (from + rng.gen_range(1..SLOTS)) % SLOTS;
                    let amount = rng.gen_range(1..10);
                    // Retry the logical transfer until it commits.
                    loop {
                        let txn = session.start();
                        let applied = (|| {
                            let src = session.read_value(
                                &table.column,
                                &table.lsn,
                                &table.rw_table,
                                &table.locks,
                                from,
                                txn,
                            )?;
                            let dst = session.read_value(
                                &table.column,
                                &table.lsn,
                                &table.rw_table,
                                &table.locks,
                                to,
                                txn,
                            )?;
                            session
                                .write_value(
                                    src - amount,
                                    &table.column,
                                    &table.lsn,
                                    &table.rw_table,
                                    &table.locks,
                                    from,
                                    txn,
                                    false,
                                )
                                .then_some(())?;
                            session
                                .write_value(
                                    dst + amount,
                                    &table.column,
                                    &table.lsn,
                                    &table.rw_table,
                                    &table.locks,
                                    to,
                                    txn,
                                    false,
                                )
                                .then_some(())
                        })();
                        if applied.is_none() {
                            let _ = session.commit(txn);
                            continue;
                        }
                        if session.commit(txn).is_ok() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let total: i64 = (0..SLOTS).map(|offset| table.column.index(offset)).sum();
    assert_eq!(total, SLOTS as i64 * INITIAL);
    for offset in 0..SLOTS {
        assert_eq!(table.rw_table.entry_count(offset), 0);
    }
}

#[test]
fn sgt_transfer_conservation_under_contention() {
    const SLOTS: usize = 4;
    const WORKERS: usize = 3;
    const TRANSFERS: usize = 60;
    const INITIAL: i64 = 1_000;

    let coordinator = sgt::TransactionCoordinator::new();
    let table = OptimisticTable::new(SLOTS, INITIAL);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(WORKERS)
        .build()
        .unwrap();
    pool.scope(|scope| {
        for worker in 0..WORKERS {
            let coordinator = &coordinator;
            let table = &table;
            scope.spawn(move |_| {
                let mut rng = StdRng::seed_from_u64(worker as u64);
                let mut session = coordinator.session::<i64>(worker as u8);
                for _ in 0..TRANSFERS {
                    let from = rng.gen_range(0..SLOTS);
                    let to = (from + rng.gen_range(1..SLOTS)) % SLOTS;
                    let amount = rng.gen_range(1..10);
                    loop {
                        let txn = session.start();
                        let applied = (|| {
                            let src = session.read_value(
                                &table.column,
                                &table.lsn,
                                &table.rw_table,
                                &table.locked,
                                from,
                                txn,
                            )?;
                            let dst = session.read_value(
                                &table.column,
                                &table.lsn,
                                &table.rw_table,
                                &table.locked,
                                to,
                                txn,
                            )?;
                            session
                                .write_value(
                                    src - amount,
                                    &table.column,
                                    &table.lsn,
                                    &table.rw_table,
                                    &table.locked,
                                    from,
                                    txn,
                                    false,
                                )
                                .then_some(())?;
                            session
                                .write_value(
                                    dst + amount,
                                    &table.column,
                                    &table.lsn,
                                    &table.rw_table,
                                    &table.locked,
                                    to,
                                    txn,
                                    false,
                                )
                                .then_some(())
                        })();
                        if applied.is_none() {
                            let _ = session.commit(txn);
                            continue;
                        }
                        if session.commit(txn).is_ok() {
                            break;
                        }
                    }
                }
            });
        }
    });

    let total: i64 = (0..SLOTS).map(|offset| table.column.index(offset)).sum();
    assert_eq!(total, SLOTS as i64 * INITIAL);
    for offset in 0..SLOTS {
        assert_eq!(table.rw_table.entry_count(offset), 0);
    }
}

#[cfg(feature = "op-log")]
#[test]
fn op_log_records_lifecycle() {
    let coordinator = twopl::TransactionCoordinator::new();
    let table = LockingTable::new(2, 0);
    let mut session = coordinator.session::<i64>(0);

    let txn = session.start();
    assert!(session.write_value(
        1,
        &table.column,
        &table.lsn,
        &table.rw_table,
        &table.locks,
        0,
        txn,
        false,
    ));
    assert_some_eq!(
        session.read_value(&table.column, &table.lsn, &table.rw_table, &table.locks, 0, txn),
        1
    );
    assert_ok!(session.commit(txn));

    let ops: Vec<char> = coordinator.take_op_log().iter().map(|info| info.op).collect();
    assert_eq!(ops, vec!['w', 'r', 'c']);
}

/// One generated access of a single-threaded two-session workload.
#[derive(Clone, Debug)]
struct GeneratedOp {
    offset: usize,
    is_write: bool,
    value: i64,
}

fn op_strategy() -> impl Strategy<Value = GeneratedOp> {
    (0..6usize, any::<bool>(), 1..100i64).prop_map(|(offset, is_write, value)| GeneratedOp {
        offset,
        is_write,
        value,
    })
}

proptest! {
    /// Two sessions issue their accesses back to back and commit in order;
    /// the final column state must equal replaying the committed
    /// transactions' writes in commit order.
    #[test]
    fn twopl_matches_commit_order_baseline(
        ops_a in proptest::collection::vec(op_strategy(), 1..5),
        ops_b in proptest::collection::vec(op_strategy(), 1..5),
    ) {
        let coordinator = twopl::TransactionCoordinator::new();
        let table = LockingTable::new(6, 0);
        let mut shadow = vec![0i64; 6];

        let mut a = coordinator.session::<i64>(0);
        let mut b = coordinator.session::<i64>(1);
        let t_a = a.start();
        let t_b = b.start();

        fn run<'env>(
            session: &mut twopl::Session<'env, i64>,
            table: &'env LockingTable,
            txn: crate::TxnId,
            ops: &[GeneratedOp],
        ) -> bool {
            for op in ops {
                let ok = if op.is_write {
                    session.write_value(
                        op.value,
                        &table.column,
                        &table.lsn,
                        &table.rw_table,
                        &table.locks,
                        op.offset,
                        txn,
                        false,
                    )
                } else {
                    session
                        .read_value(
                            &table.column,
                            &table.lsn,
                            &table.rw_table,
                            &table.locks,
                            op.offset,
                            txn,
                        )
                        .is_some()
                };
                if !ok {
                    return false;
                }
            }
            true
        }

        let a_alive = run(&mut a, &table, t_a, &ops_a);
        let b_alive = run(&mut b, &table, t_b, &ops_b);

        let a_committed = a.commit(t_a).is_ok();
        let b_committed = b.commit(t_b).is_ok();
        prop_assert_eq!(a_alive, a_committed);
        prop_assert_eq!(b_alive, b_committed);

        for (committed, ops) in [(a_committed, &ops_a), (b_committed, &ops_b)] {
            if committed {
                for op in ops {
                    if op.is_write {
                        shadow[op.offset] = op.value;
                    }
                }
            }
        }
        for offset in 0..6 {
            prop_assert_eq!(table.column.index(offset), shadow[offset]);
        }
        for offset in 0..6 {
            prop_assert_eq!(table.rw_table.entry_count(offset), 0);
        }
    }
}
