// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Per-record read/write locking with a wound-or-deny policy. There are no
//! OS-level waits: a request either succeeds, is denied, or wounds younger
//! holders and spins until their aborts drain the record.

use crate::{columns::BOUNDED_SPINS, counters, op_log::LogInfo, types::TxnId};
use crossbeam::utils::CachePadded;
use dashmap::DashSet;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use tracing::trace;

/// Per-record lock word: current mode and owner(s).
#[derive(Debug)]
enum LockHolder {
    Free,
    Read(BTreeSet<TxnId>),
    Write(TxnId),
}

#[derive(Debug)]
struct RecordLock {
    holder: LockHolder,
    /// Ids currently spinning for this record after wounding its holders.
    waiters: BTreeSet<TxnId>,
}

impl RecordLock {
    fn new() -> Self {
        Self {
            holder: LockHolder::Free,
            waiters: BTreeSet::new(),
        }
    }
}

/// Per-offset lock metadata for one column family. Callers pass the table
/// alongside the other record columns on every access.
pub struct LockTable {
    slots: Vec<CachePadded<Mutex<RecordLock>>>,
}

impl LockTable {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len)
                .map(|_| CachePadded::new(Mutex::new(RecordLock::new())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn slot(&self, offset: usize) -> &Mutex<RecordLock> {
        &self.slots[offset]
    }
}

pub(crate) struct LockManager {
    /// Transactions wounded by an older conflicting transaction. The victim
    /// folds the mark into its own session state by aborting at its next
    /// access or commit; `end` clears the mark.
    wounded: DashSet<TxnId>,
    /// Transactions between `start` and `end`.
    active: DashSet<TxnId>,
    #[cfg(feature = "op-log")]
    op_log: crate::op_log::OpLog,
}

impl LockManager {
    pub(crate) fn new() -> Self {
        Self {
            wounded: DashSet::new(),
            active: DashSet::new(),
            #[cfg(feature = "op-log")]
            op_log: crate::op_log::OpLog::new(),
        }
    }

    pub(crate) fn start(&self, txn: TxnId) {
        let inserted = self.active.insert(txn);
        debug_assert!(inserted, "transaction {} started twice", txn);
    }

    pub(crate) fn end(&self, txn: TxnId) {
        let removed = self.active.remove(&txn).is_some();
        debug_assert!(removed, "transaction {} ended without start", txn);
        self.wounded.remove(&txn);
    }

    pub(crate) fn is_wounded(&self, txn: TxnId) -> bool {
        self.wounded.contains(&txn)
    }

    /// Attempts to lock `(lock_table, offset)` for `txn` in the requested
    /// mode. Conflicting holders that all rank younger than `txn` are
    /// wounded (recorded in `abort_set`) and the call spins until their
    /// aborts release the record; a single older conflicting holder denies
    /// the request instead, and the caller must abort `txn`.
    pub(crate) fn lock(
        &self,
        txn: TxnId,
        is_write: bool,
        lock_table: &LockTable,
        offset: usize,
        abort_set: &mut HashSet<TxnId>,
    ) -> bool {
        let mut spins = 0u32;
        loop {
            {
                let mut slot = lock_table.slot(offset).lock();
                let conflicting: Vec<TxnId> = match (&slot.holder, is_write) {
                    (LockHolder::Free, _) => Vec::new(),
                    (LockHolder::Read(_), false) => Vec::new(),
                    (LockHolder::Read(holders), true) => {
                        holders.iter().copied().filter(|h| *h != txn).collect()
                    },
                    (LockHolder::Write(holder), _) => {
                        if *holder == txn {
                            Vec::new()
                        } else {
                            vec![*holder]
                        }
                    },
                };

                if conflicting.is_empty() {
                    let installed = match &mut slot.holder {
                        LockHolder::Free => Some(if is_write {
                            LockHolder::Write(txn)
                        } else {
                            LockHolder::Read(BTreeSet::from([txn]))
                        }),
                        LockHolder::Read(holders) => {
                            if is_write {
                                // Sole-reader upgrade; any other reader would
                                // have conflicted above.
                                debug_assert!(holders.len() == 1 && holders.contains(&txn));
                                Some(LockHolder::Write(txn))
                            } else {
                                holders.insert(txn);
                                None
                            }
                        },
                        // Re-entrant request against an own write lock.
                        LockHolder::Write(holder) => {
                            debug_assert_eq!(*holder, txn);
                            None
                        },
                    };
                    if let Some(holder) = installed {
                        slot.holder = holder;
                    }
                    slot.waiters.remove(&txn);
                    return true;
                }

                if conflicting.iter().any(|h| *h < txn) {
                    // An older holder: letting this transaction wait could
                    // close a wait cycle, so deny it instead.
                    slot.waiters.remove(&txn);
                    return false;
                }

                // Every conflicting holder ranks younger: wound them all and
                // wait for their aborts to drain the record.
                for holder in &conflicting {
                    if self.wounded.insert(*holder) {
                        abort_set.insert(*holder);
                        counters::TXN_WOUNDED_COUNT.inc();
                        trace!(victim = *holder, by = txn, "wounding younger lock holder");
                    }
                }
                slot.waiters.insert(txn);
            }

            if self.wounded.contains(&txn) {
                // Wounded while waiting; give up so the caller aborts.
                lock_table.slot(offset).lock().waiters.remove(&txn);
                return false;
            }

            spins += 1;
            if spins >= BOUNDED_SPINS {
                std::thread::yield_now();
                spins = 0;
            } else {
                std::hint::spin_loop();
            }
        }
    }

    /// Releases a lock held by `txn`; a no-op when `txn` is not a holder, so
    /// release paths may walk their whole undo log blindly.
    pub(crate) fn unlock(&self, txn: TxnId, lock_table: &LockTable, offset: usize) {
        let mut slot = lock_table.slot(offset).lock();
        let freed = match &mut slot.holder {
            LockHolder::Read(holders) => {
                holders.remove(&txn);
                holders.is_empty()
            },
            LockHolder::Write(holder) => *holder == txn,
            LockHolder::Free => false,
        };
        if freed {
            slot.holder = LockHolder::Free;
        }
    }

    #[cfg(feature = "op-log")]
    pub(crate) fn log(&self, info: LogInfo) {
        self.op_log.append(info);
    }

    #[cfg(not(feature = "op-log"))]
    pub(crate) fn log(&self, _info: LogInfo) {}

    #[cfg(feature = "op-log")]
    pub(crate) fn take_log(&self) -> Vec<LogInfo> {
        self.op_log.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_readers_join() {
        let manager = LockManager::new();
        let table = LockTable::new(1);
        let mut aborts = HashSet::new();

        manager.start(1);
        manager.start(2);
        assert!(manager.lock(1, false, &table, 0, &mut aborts));
        assert!(manager.lock(2, false, &table, 0, &mut aborts));
        assert!(aborts.is_empty());

        manager.unlock(1, &table, 0);
        manager.unlock(2, &table, 0);
        manager.end(1);
        manager.end(2);
    }

    #[test]
    fn younger_writer_denied() {
        let manager = LockManager::new();
        let table = LockTable::new(1);
        let mut aborts = HashSet::new();

        manager.start(1);
        manager.start(2);
        assert!(manager.lock(1, true, &table, 0, &mut aborts));
        // Write locks exclude everything, reads included.
        assert!(!manager.lock(2, true, &table, 0, &mut aborts));
        assert!(!manager.lock(2, false, &table, 0, &mut aborts));
        assert!(aborts.is_empty());
        assert!(!manager.is_wounded(1));
    }

    #[test]
    fn younger_writer_denied_by_read_holder() {
        let manager = LockManager::new();
        let table = LockTable::new(1);
        let mut aborts = HashSet::new();

        manager.start(1);
        manager.start(2);
        assert!(manager.lock(1, false, &table, 0, &mut aborts));
        assert!(!manager.lock(2, true, &table, 0, &mut aborts));
        // The read holder set stays usable for further readers.
        assert!(manager.lock(2, false, &table, 0, &mut aborts));
    }

    #[test]
    fn sole_reader_upgrades() {
        let manager = LockManager::new();
        let table = LockTable::new(1);
        let mut aborts = HashSet::new();

        manager.start(1);
        assert!(manager.lock(1, false, &table, 0, &mut aborts));
        assert!(manager.lock(1, true, &table, 0, &mut aborts));
        // Exclusive after the upgrade.
        assert!(!manager.lock(2, false, &table, 0, &mut aborts));
    }

    #[test]
    fn unlock_is_idempotent_and_owner_checked() {
        let manager = LockManager::new();
        let table = LockTable::new(1);
        let mut aborts = HashSet::new();

        manager.start(1);
        manager.start(2);
        manager.start(3);
        assert!(manager.lock(1, true, &table, 0, &mut aborts));
        manager.unlock(1, &table, 0);
        assert!(manager.lock(2, true, &table, 0, &mut aborts));
        // Repeated release by a past holder must not free txn 2's lock.
        manager.unlock(1, &table, 0);
        assert!(!manager.lock(3, false, &table, 0, &mut aborts));
    }

    #[test]
    fn older_writer_wounds_and_acquires() {
        let manager = LockManager::new();
        let table = LockTable::new(1);

        manager.start(1);
        manager.start(2);
        let mut victim_aborts = HashSet::new();
        assert!(manager.lock(2, true, &table, 0, &mut victim_aborts));

        std::thread::scope(|s| {
            let manager = &manager;
            let table = &table;
            // Victim thread: polls its wound mark the way a session's
            // aliveness check would, then releases.
            s.spawn(move || {
                while !manager.is_wounded(2) {
                    std::thread::yield_now();
                }
                manager.unlock(2, table, 0);
                manager.end(2);
            });

            let mut aborts = HashSet::new();
            assert!(manager.lock(1, true, table, 0, &mut aborts));
            assert_eq!(aborts, HashSet::from([2]));
        });
        manager.end(1);
    }
}
