// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Optimistic serialization-graph-testing variant of the transaction
//! coordinator. Accesses install themselves into the per-record access list
//! under a short record spinlock, feed every observed dependency into the
//! shared graph, and abort only when a cycle would form. Commit waits until
//! all predecessors committed; aborts cascade along write-write and
//! write-read edges.

mod serialization_graph;

use serialization_graph::SerializationGraph;

use crate::{
    columns::{AccessListColumn, MetaColumn, SpinLockColumn, ValueColumn},
    counters,
    op_log::LogInfo,
    txn_info::TransactionInformation,
    types::{access, assemble_txn_id, find, CoreId, TxnId, MAX_CORE_ID},
};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Shared coordinator state; workers interact through per-thread
/// [`Session`]s.
pub struct TransactionCoordinator {
    graph: SerializationGraph,
}

impl TransactionCoordinator {
    pub fn new() -> Self {
        Self {
            graph: SerializationGraph::new(),
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
        self.graph.take_log()
    }
}

impl Default for TransactionCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

/// Worker-private transaction state, reused across transactions on the same
/// session with fresh-object semantics at every `start`.
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
    /// Undo log, in access order; undo and unlink walk it newest-first.
    atom_info: Vec<TransactionInformation<'env, V, SpinLockColumn>>,
    epoch_guard: Option<crossbeam::epoch::Guard>,
}

impl<'env, V: Clone> Session<'env, V> {
    /// Assigns a fresh transaction id, resets the per-transaction scratch
    /// state and registers the node with the serialization graph.
    pub fn start(&mut self) -> TxnId {
        self.transaction_counter += 1;
        let txn = assemble_txn_id(self.core, self.transaction_counter);
        self.atom_info.clear();
        self.abort_transaction.clear();
        self.epoch_guard = Some(crossbeam::epoch::pin());
        self.coordinator.graph.create_node(txn);
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
        locked: &'env SpinLockColumn,
        offset: usize,
        txn: TxnId,
    ) -> Option<V> {
        self.read_internal(Some(column), lsn, rw_table, locked, offset, txn)
            .0
    }

    /// Dependency-install-only probe of a record, without copying the
    /// payload out.
    pub fn read(
        &mut self,
        lsn: &'env MetaColumn,
        rw_table: &'env AccessListColumn,
        locked: &'env SpinLockColumn,
        offset: usize,
        txn: TxnId,
    ) -> bool {
        self.read_internal(None, lsn, rw_table, locked, offset, txn).1
    }

    /// Shared read protocol: install the tag, wait for it to become
    /// visible, add a cascade edge for every earlier writer, detect cycles,
    /// then read the payload (when a column was supplied) inside the same
    /// critical section.
    fn read_internal(
        &mut self,
        column: Option<&'env ValueColumn<V>>,
        lsn: &'env MetaColumn,
        rw_table: &'env AccessListColumn,
        locked: &'env SpinLockColumn,
        offset: usize,
        txn: TxnId,
    ) -> (Option<V>, bool) {
        debug_assert!(txn > 0, "zero transaction id");
        if self.not_alive.contains(&txn) {
            return (None, false);
        }
        debug_assert!(self.epoch_guard.is_some(), "no active transaction scope");
        if self.coordinator.graph.needs_abort(txn) {
            self.abort(txn);
            return (None, false);
        }

        let guard = locked.lock(offset);
        let prv = rw_table.push_front(offset, access(txn, false));
        if prv > 0 {
            lsn.wait_until(offset, prv);
        }

        let mut cyclic = false;
        for (seq, tag) in rw_table.snapshot(offset) {
            if seq < prv {
                let (pred, pred_wrote) = find(tag);
                // Reading an earlier writer's install is a cascade edge.
                if pred_wrote
                    && pred != txn
                    && !self.coordinator.graph.insert_and_check(pred, txn, true)
                {
                    cyclic = true;
                }
            }
        }

        self.coordinator.graph.log(LogInfo {
            transaction: txn,
            prv,
            target: rw_table as *const AccessListColumn as usize,
            offset,
            op: if cyclic { 'e' } else { 'r' },
        });

        if cyclic {
            rw_table.erase(offset, prv);
            lsn.atomic_replace(offset, prv + 1);
            drop(guard);
            self.abort(txn);
            return (None, false);
        }

        let value = column.map(|column| column.index(offset));
        lsn.atomic_replace(offset, prv + 1);
        drop(guard);
        self.atom_info.push(TransactionInformation::Read {
            rw_table,
            lock_meta: locked,
            prv,
            offset,
            txn,
        });
        (value, true)
    }

    /// Attempts to install `value` at `(column, offset)`, recording the
    /// pre-image for undo. A write behind an uncommitted earlier writer is
    /// taken back out and retried once the predecessor finishes, so the
    /// graph stays serializable. Replay calls (`is_abort_replay`) bypass all
    /// checks and record nothing.
    pub fn write_value(
        &mut self,
        value: V,
        column: &'env ValueColumn<V>,
        lsn: &'env MetaColumn,
        rw_table: &'env AccessListColumn,
        locked: &'env SpinLockColumn,
        offset: usize,
        txn: TxnId,
        is_abort_replay: bool,
    ) -> bool {
        debug_assert!(txn > 0, "zero transaction id");
        if is_abort_replay {
            let _guard = locked.lock(offset);
            column.replace(offset, value);
            return true;
        }
        loop {
            if self.not_alive.contains(&txn) {
                return false;
            }
            debug_assert!(self.epoch_guard.is_some(), "no active transaction scope");
            if self.coordinator.graph.needs_abort(txn) {
                self.abort(txn);
                return false;
            }

            let guard = locked.lock(offset);
            let prv = rw_table.push_front(offset, access(txn, true));
            if prv > 0 {
                lsn.wait_until(offset, prv);
            }
            let snapshot = rw_table.snapshot(offset);

            // Delay behind uncommitted earlier writers: a write-write edge
            // cascades, and installing over the predecessor would lose its
            // pre-image ordering.
            let mut cyclic = false;
            let mut wait = false;
            for (seq, tag) in &snapshot {
                if *seq < prv {
                    let (pred, pred_wrote) = find(*tag);
                    if pred_wrote && pred != txn && !self.coordinator.graph.is_committed(pred) {
                        if !self.coordinator.graph.insert_and_check(pred, txn, true) {
                            cyclic = true;
                        }
                        wait = true;
                    }
                }
            }

            if !cyclic && !wait {
                for (seq, tag) in &snapshot {
                    if *seq < prv {
                        let (pred, pred_wrote) = find(*tag);
                        // An earlier read makes this a read-write edge; no
                        // cascade necessary.
                        if pred != txn
                            && !self.coordinator.graph.insert_and_check(pred, txn, pred_wrote)
                        {
                            cyclic = true;
                        }
                    }
                }
            }

            if !wait || cyclic {
                self.coordinator.graph.log(LogInfo {
                    transaction: txn,
                    prv,
                    target: rw_table as *const AccessListColumn as usize,
                    offset,
                    op: if cyclic { 'e' } else { 'w' },
                });
            }

            if cyclic {
                rw_table.erase(offset, prv);
                lsn.atomic_replace(offset, prv + 1);
                drop(guard);
                self.abort(txn);
                return false;
            }

            if wait {
                rw_table.erase(offset, prv);
                lsn.atomic_replace(offset, prv + 1);
                drop(guard);
                counters::WRITE_WRITE_RETRY_COUNT.inc();
                std::thread::yield_now();
                continue;
            }

            let old_value = column.replace(offset, value.clone());
            lsn.atomic_replace(offset, prv + 1);
            drop(guard);
            self.atom_info.push(TransactionInformation::Write {
                old_value,
                column,
                rw_table,
                lock_meta: locked,
                prv,
                offset,
                txn,
            });
            return true;
        }
    }

    /// Undoes all writes in LIFO order, cascade-aborts dependents, unlinks
    /// the recorded access tags and marks the transaction not-alive.
    pub fn abort(&mut self, txn: TxnId) {
        self.not_alive.insert(txn);
        for entry in self.atom_info.iter().rev() {
            if entry.is_write() {
                // Concurrent installers still run, so the pre-image goes
                // back under the record spinlock.
                let _guard = entry.lock_meta().lock(entry.offset());
                entry.undo();
            }
        }
        self.coordinator.graph.log(LogInfo {
            transaction: txn,
            prv: 0,
            target: 0,
            offset: 0,
            op: 'a',
        });
        self.coordinator
            .graph
            .abort(txn, &mut self.abort_transaction);
        for entry in self.atom_info.iter().rev() {
            entry.purge();
        }
        self.atom_info.clear();
        self.epoch_guard = None;
        counters::TXN_ABORTED_COUNT.inc();
        debug!(txn, victims = self.abort_transaction.len(), "transaction aborted");
    }

    /// Waits until every predecessor committed, then unlinks the node and
    /// releases the record-table entries. Returns the cascade set when the
    /// transaction died instead; the not-alive mark is cleared on every
    /// terminal path. This poll is the only unbounded wait in the system
    /// and yields the worker between rounds.
    pub fn commit(&mut self, txn: TxnId) -> Result<(), HashSet<TxnId>> {
        loop {
            if self.not_alive.remove(&txn) {
                self.epoch_guard = None;
                return Err(std::mem::take(&mut self.abort_transaction));
            }
            if self.coordinator.graph.needs_abort(txn) {
                self.abort(txn);
                self.not_alive.remove(&txn);
                self.epoch_guard = None;
                return Err(std::mem::take(&mut self.abort_transaction));
            }

            if self.coordinator.graph.check_committed(txn) {
                // Commit point: new edges from here on resolve against a
                // committed node, then the tags and the node disappear.
                self.coordinator.graph.mark_committed(txn);
                for entry in self.atom_info.iter().rev() {
                    entry.purge();
                }
                self.atom_info.clear();
                self.coordinator.graph.finalize_commit(txn);
                self.epoch_guard = None;
                self.coordinator.graph.log(LogInfo {
                    transaction: txn,
                    prv: 0,
                    target: 0,
                    offset: 0,
                    op: 'c',
                });
                counters::TXN_COMMITTED_COUNT.inc();
                return Ok(());
            }

            std::thread::yield_now();
        }
    }
}
