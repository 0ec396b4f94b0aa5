// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! Column-shaped record state shared by both coordinator variants: the value
//! vectors themselves, the per-record lsn gate, the per-record access lists,
//! and the per-record install spinlock used by the optimistic variant. Every
//! per-record slot is cache-padded so contended records do not false-share.

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;
use std::{
    cell::UnsafeCell,
    collections::VecDeque,
    sync::atomic::{AtomicU64, Ordering},
};

/// Iterations spent busy-spinning on a record gate before yielding the
/// worker to the OS scheduler.
pub(crate) const BOUNDED_SPINS: u32 = 10_000;

/// Payload slot whose synchronization is proven externally: any access must
/// happen under the record's lock (pessimistic variant) or the record
/// spinlock (optimistic variant). The wrapper only exists because the borrow
/// checker cannot see per-record exclusion established at runtime.
struct SyncSlot<V> {
    value: UnsafeCell<V>,
}

unsafe impl<V: Send> Sync for SyncSlot<V> {}

impl<V> SyncSlot<V> {
    fn new(value: V) -> Self {
        Self {
            value: UnsafeCell::new(value),
        }
    }

    /// Safety contract: caller holds the record's exclusion for the duration
    /// of the returned borrow.
    #[allow(clippy::mut_from_ref)]
    fn get_mut(&self) -> &mut V {
        unsafe { &mut *self.value.get() }
    }

    fn get(&self) -> &V {
        unsafe { &*self.value.get() }
    }
}

/// Fixed-size vector of record payloads addressed by offset.
pub struct ValueColumn<V> {
    slots: Vec<CachePadded<SyncSlot<V>>>,
}

impl<V: Clone> ValueColumn<V> {
    pub fn new(len: usize, init: V) -> Self {
        Self {
            slots: (0..len)
                .map(|_| CachePadded::new(SyncSlot::new(init.clone())))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Reads the record payload. Caller holds the record's lock or spinlock.
    pub fn index(&self, offset: usize) -> V {
        self.slots[offset].get().clone()
    }

    /// Installs `value` and returns the prior payload. Caller holds the
    /// record's exclusive lock or spinlock.
    pub fn replace(&self, offset: usize, value: V) -> V {
        std::mem::replace(self.slots[offset].get_mut(), value)
    }
}

/// Per-record sequence numbers. The lsn of a record strictly increases and
/// gates visibility of access-list entries: an entry installed with sequence
/// number `prv` is visible only once `lsn >= prv`.
pub struct MetaColumn {
    slots: Vec<CachePadded<AtomicU64>>,
}

impl MetaColumn {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn index(&self, offset: usize) -> u64 {
        self.slots[offset].load(Ordering::Acquire)
    }

    pub fn atomic_replace(&self, offset: usize, value: u64) {
        self.slots[offset].store(value, Ordering::Release);
    }

    /// Monotonic advance for paths where installs may race (shared read
    /// locks); a plain store could move the lsn backwards.
    pub fn advance_to(&self, offset: usize, value: u64) {
        self.slots[offset].fetch_max(value, Ordering::AcqRel);
    }

    /// Spins until the slot reaches `expected`, yielding after a bounded
    /// number of iterations.
    pub fn wait_until(&self, offset: usize, expected: u64) {
        let mut spins = 0u32;
        while self.index(offset) != expected {
            spins += 1;
            if spins >= BOUNDED_SPINS {
                std::thread::yield_now();
                spins = 0;
            } else {
                std::hint::spin_loop();
            }
        }
    }
}

/// One record's access list: insertion-ordered, newest first. Each entry is
/// an `(prv, tag)` pair where `prv` comes off a per-record monotonic counter
/// and doubles as the entry's erase handle.
pub struct AccessList {
    next_seq: AtomicU64,
    entries: Mutex<VecDeque<(u64, u64)>>,
}

impl AccessList {
    fn new() -> Self {
        Self {
            next_seq: AtomicU64::new(0),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Appends `tag` at the front and returns its sequence number. The
    /// counter is drawn under the list lock so sequence order and list order
    /// agree.
    fn push_front(&self, tag: u64) -> u64 {
        let mut entries = self.entries.lock();
        let prv = self.next_seq.fetch_add(1, Ordering::Relaxed);
        entries.push_front((prv, tag));
        prv
    }

    fn erase(&self, prv: u64) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|(seq, _)| *seq == prv) {
            Some(pos) => {
                entries.remove(pos);
                true
            },
            None => false,
        }
    }

    /// Copies the current entries out, newest first. Conflict checks walk
    /// the snapshot so they never hold the list lock across graph or lock
    /// manager calls.
    fn snapshot(&self) -> Vec<(u64, u64)> {
        self.entries.lock().iter().copied().collect()
    }

    fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// Fixed-size vector of per-record access lists.
pub struct AccessListColumn {
    lists: Vec<CachePadded<AccessList>>,
}

impl AccessListColumn {
    pub fn new(len: usize) -> Self {
        Self {
            lists: (0..len).map(|_| CachePadded::new(AccessList::new())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.lists.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lists.is_empty()
    }

    pub fn push_front(&self, offset: usize, tag: u64) -> u64 {
        self.lists[offset].push_front(tag)
    }

    pub fn erase(&self, offset: usize, prv: u64) -> bool {
        self.lists[offset].erase(prv)
    }

    pub fn snapshot(&self, offset: usize) -> Vec<(u64, u64)> {
        self.lists[offset].snapshot()
    }

    pub fn entry_count(&self, offset: usize) -> usize {
        self.lists[offset].len()
    }
}

/// Per-record install spinlock for the optimistic variant: a 0/1 word per
/// offset, acquired with a CAS on the shared slot and released by guard
/// drop.
pub struct SpinLockColumn {
    slots: Vec<CachePadded<AtomicU64>>,
}

pub struct SpinLockGuard<'a> {
    slot: &'a AtomicU64,
}

impl SpinLockColumn {
    pub fn new(len: usize) -> Self {
        Self {
            slots: (0..len).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn lock(&self, offset: usize) -> SpinLockGuard<'_> {
        let slot = &*self.slots[offset];
        let mut spins = 0u32;
        while slot
            .compare_exchange_weak(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins >= BOUNDED_SPINS {
                std::thread::yield_now();
                spins = 0;
            } else {
                std::hint::spin_loop();
            }
        }
        SpinLockGuard { slot }
    }
}

impl Drop for SpinLockGuard<'_> {
    fn drop(&mut self) {
        self.slot.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::access;
    use std::collections::HashSet;

    #[test]
    fn access_list_orders_newest_first() {
        let column = AccessListColumn::new(2);
        assert_eq!(column.push_front(0, access(1, false)), 0);
        assert_eq!(column.push_front(0, access(2, true)), 1);
        assert_eq!(column.push_front(0, access(3, false)), 2);

        let snapshot = column.snapshot(0);
        assert_eq!(snapshot[0], (2, access(3, false)));
        assert_eq!(snapshot[2], (0, access(1, false)));
        // The other record is untouched.
        assert_eq!(column.entry_count(1), 0);
    }

    #[test]
    fn access_list_erase_by_sequence() {
        let column = AccessListColumn::new(1);
        let prv = column.push_front(0, access(7, true));
        assert!(column.erase(0, prv));
        assert!(!column.erase(0, prv));
        assert_eq!(column.entry_count(0), 0);
        // Sequence numbers are not reused after an erase.
        assert_eq!(column.push_front(0, access(8, false)), prv + 1);
    }

    #[test]
    fn concurrent_pushes_get_unique_sequences() {
        let column = AccessListColumn::new(1);
        std::thread::scope(|s| {
            for t in 0..4u64 {
                let column = &column;
                s.spawn(move || {
                    for i in 0..100 {
                        column.push_front(0, access(t * 1000 + i + 1, false));
                    }
                });
            }
        });
        let snapshot = column.snapshot(0);
        assert_eq!(snapshot.len(), 400);
        let seqs: HashSet<u64> = snapshot.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs.len(), 400);
        // Newest-first means strictly descending sequence numbers.
        assert!(snapshot.windows(2).all(|w| w[0].0 > w[1].0));
    }

    #[test]
    fn meta_column_advance_is_monotonic() {
        let lsn = MetaColumn::new(1);
        lsn.advance_to(0, 5);
        lsn.advance_to(0, 3);
        assert_eq!(lsn.index(0), 5);
        lsn.atomic_replace(0, 6);
        assert_eq!(lsn.index(0), 6);
    }

    #[test]
    fn spinlock_excludes_writers() {
        let locks = SpinLockColumn::new(1);
        let column = ValueColumn::new(1, 0u64);
        std::thread::scope(|s| {
            for _ in 0..4 {
                let locks = &locks;
                let column = &column;
                s.spawn(move || {
                    for _ in 0..1000 {
                        let _guard = locks.lock(0);
                        let v = column.index(0);
                        column.replace(0, v + 1);
                    }
                });
            }
        });
        assert_eq!(column.index(0), 4000);
    }
}
