// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Strict two-phase locking variant of the transaction coordinator. Every
//! data access takes the record's lock up front and holds it to commit or
//! abort; conflicts resolve through the lock manager's wound-or-deny policy,
//! so no caller ever parks on an OS primitive.

mod lock_manager;

pub use lock_manager::LockTable;
use lock_manager::LockManager;

use crate::{
    columns::{AccessListColumn, MetaColumn, ValueColumn},
    counters,
    op_log::LogInfo,
    txn_info::TransactionInformation,
    types::{access, assemble_txn_id, CoreId, TxnId, MAX_CORE_ID},
};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Shared coordinator state; workers interact through per-thread
/// [`Session`]s.
pub struct TransactionCoordinator {
    lock_manager: LockManager,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            lock_manager: LockManager::new(),
        }
    }

    /// Opens a worker session pinned to `core`. One session per OS thread;
    /// a session drives one transaction at a time and owns all of its
    /// scratch state.
    pub fn session<V: Clone>(&self, core: CoreId) -> Session<'_, V> {
        debug_assert!(core <= MAX_CORE_ID, "core id {} out of range", core);
        Session {
            coordinator: self,
            core,
            transaction_counter: 0,
            not_alive: HashSet::new(),
            abort_transaction: HashSet::new(),
            atom_info: Vec::new(),
            epoch_guard: None,
        }
    }

    #[cfg(feature = "op-log")]
    pub fn take_op_log(&self) -> Vec<LogInfo> {
        self.lock_manager.take_log()
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-private transaction state. The scratch containers are reused
/// across transactions on the same session but present fresh-object
/// semantics at every `start`.
pub struct Session<'env, V> {
    coordinator: &'env TransactionCoordinator,
    core: CoreId,
    transaction_counter: u64,
    /// Ids this worker already marked aborted; operations on them
    /// short-circuit to failure until `commit` harvests the outcome.
    not_alive: HashSet<TxnId>,
    /// Other transactions this transaction caused to abort, handed to the
    /// caller on commit failure.
    abort_transaction: HashSet<TxnId>,
    /// Undo log, in access order; undo and release walk it newest-first.
    atom_info: Vec<TransactionInformation<'env, V, LockTable>>,
    epoch_guard: Option<crossbeam::epoch::Guard>,
}

impl<'env, V: Clone> Session<'env, V> {
    /// Assigns a fresh transaction id, resets the per-transaction scratch
    /// state and registers the transaction with the lock manager.
    pub fn start(&mut self) -> TxnId {
        self.transaction_counter += 1;
        let txn = assemble_txn_id(self.core, self.transaction_counter);
        self.atom_info.clear();
        self.abort_transaction.clear();
        self.epoch_guard = Some(crossbeam::epoch::pin());
        self.coordinator.lock_manager.start(txn);
        counters::TXN_STARTED_COUNT.inc();
        trace!(txn, core = self.core, "transaction started");
        txn
    }

    /// Attempts a read of `(column, offset)` and returns the payload, or
    /// `None` when the transaction failed and was aborted.
    pub fn read_value(
        &mut self,
        column: &'env ValueColumn<V>,
        lsn: &'env MetaColumn,
        rw_table: &'env AccessListColumn,
        lock_table: &'env LockTable,
        offset: usize,
        txn: TxnId,
    ) -> Option<V> {
        if !self.acquire(false, rw_table, lock_table, offset, txn) {
            return None;
        }
        let value = column.index(offset);
        let prv = Self::install_tag(false, rw_table, lsn, offset, txn);
        self.atom_info.push(TransactionInformation::Read {
            rw_table,
            lock_meta: lock_table,
            prv,
            offset,
            txn,
        });
        Some(value)
    }

    /// Lock-only probe of a record, without copying the payload out.
    pub fn read(
        &mut self,
        lsn: &'env MetaColumn,
        rw_table: &'env AccessListColumn,
        lock_table: &'env LockTable,
        offset: usize,
        txn: TxnId,
    ) -> bool {
        if !self.acquire(false, rw_table, lock_table, offset, txn) {
            return false;
        }
        let prv = Self::install_tag(false, rw_table, lsn, offset, txn);
        self.atom_info.push(TransactionInformation::Read {
            rw_table,
            lock_meta: lock_table,
            prv,
            offset,
            txn,
        });
        true
    }

    /// Attempts to install `value` at `(column, offset)`, recording the
    /// pre-image for undo. Replay calls (`is_abort_replay`) bypass all
    /// concurrency checks and record nothing.
    pub fn write_value(
        &mut self,
        value: V,
        column: &'env ValueColumn<V>,
        lsn: &'env MetaColumn,
        rw_table: &'env AccessListColumn,
        lock_table: &'env LockTable,
        offset: usize,
        txn: TxnId,
        is_abort_replay: bool,
    ) -> bool {
        if is_abort_replay {
            column.replace(offset, value);
            return true;
        }
        if !self.acquire(true, rw_table, lock_table, offset, txn) {
            return false;
        }
        let old_value = column.replace(offset, value);
        let prv = Self::install_tag(true, rw_table, lsn, offset, txn);
        self.atom_info.push(TransactionInformation::Write {
            old_value,
            column,
            rw_table,
            lock_meta: lock_table,
            prv,
            offset,
            txn,
        });
        true
    }

    /// Aliveness check plus lock acquisition; on conflict the transaction is
    /// aborted in place.
    fn acquire(
        &mut self,
        is_write: bool,
        rw_table: &'env AccessListColumn,
        lock_table: &'env LockTable,
        offset: usize,
        txn: TxnId,
    ) -> bool {
        debug_assert!(txn > 0, "zero transaction id");
        if self.not_alive.contains(&txn) {
            return false;
        }
        debug_assert!(self.epoch_guard.is_some(), "no active transaction scope");
        if self.coordinator.lock_manager.is_wounded(txn) {
            // Wounded by another worker; run the undo path now.
            self.abort(txn);
            return false;
        }
        let granted = self.coordinator.lock_manager.lock(
            txn,
            is_write,
            lock_table,
            offset,
            &mut self.abort_transaction,
        );
        self.coordinator.lock_manager.log(LogInfo {
            transaction: txn,
            prv: 0,
            target: rw_table as *const AccessListColumn as usize,
            offset,
            op: if is_write { 'w' } else { 'r' },
        });
        if !granted {
            self.abort(txn);
            return false;
        }
        true
    }

    /// Installs the access tag for a granted access and publishes it
    /// through the record's lsn.
    fn install_tag(
        is_write: bool,
        rw_table: &AccessListColumn,
        lsn: &MetaColumn,
        offset: usize,
        txn: TxnId,
    ) -> u64 {
        let prv = rw_table.push_front(offset, access(txn, is_write));
        // Shared read locks may install concurrently, so the advance must be
        // monotonic rather than a plain store.
        lsn.advance_to(offset, prv + 1);
        prv
    }

    /// Undoes all writes in LIFO order, releases every lock, unlinks the
    /// recorded access tags and marks the transaction not-alive.
    pub fn abort(&mut self, txn: TxnId) {
        self.not_alive.insert(txn);
        for entry in self.atom_info.iter().rev() {
            // The record's write lock is still held here, so the pre-image
            // install cannot race with other writers.
            entry.undo();
        }
        self.coordinator.lock_manager.log(LogInfo {
            transaction: txn,
            prv: 0,
            target: 0,
            offset: 0,
            op: 'a',
        });
        for entry in self.atom_info.iter().rev() {
            self.coordinator
                .lock_manager
                .unlock(entry.txn(), entry.lock_meta(), entry.offset());
            entry.purge();
        }
        self.atom_info.clear();
        self.epoch_guard = None;
        counters::TXN_ABORTED_COUNT.inc();
        debug!(txn, victims = self.abort_transaction.len(), "transaction aborted");
    }

    /// Finalizes the transaction: releases all locks and record-table
    /// entries on success, or hands back the cascade set when the
    /// transaction died earlier. The not-alive mark is cleared on every
    /// terminal path.
    pub fn commit(&mut self, txn: TxnId) -> Result<(), HashSet<TxnId>> {
        let locally_dead = self.not_alive.contains(&txn);
        if locally_dead || self.coordinator.lock_manager.is_wounded(txn) {
            if !locally_dead {
                // The wound arrived from another worker and has not been
                // acted upon yet.
                self.abort(txn);
            }
            self.not_alive.remove(&txn);
            self.epoch_guard = None;
            self.coordinator.lock_manager.end(txn);
            return Err(std::mem::take(&mut self.abort_transaction));
        }

        self.coordinator.lock_manager.log(LogInfo {
            transaction: txn,
            prv: 0,
            target: 0,
            offset: 0,
            op: 'c',
        });
        for entry in self.atom_info.iter().rev() {
            self.coordinator
                .lock_manager
                .unlock(entry.txn(), entry.lock_meta(), entry.offset());
            entry.purge();
        }
        self.atom_info.clear();
        self.epoch_guard = None;
        self.coordinator.lock_manager.end(txn);
        counters::TXN_COMMITTED_COUNT.inc();
        Ok(())
    }
}
