// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use crate::{
    columns::{AccessListColumn, ValueColumn},
    types::TxnId,
};

/// One recorded data access of an in-flight transaction, kept in the
/// worker-local undo log. Entries carry enough borrowed context to undo an
/// in-place write and to unlink the installed access tag when the
/// transaction finalizes. `L` is the variant's lock-meta column type (lock
/// table or install spinlock column); the borrows are statically bounded by
/// the enclosing session.
pub(crate) enum TransactionInformation<'env, V, L> {
    Read {
        rw_table: &'env AccessListColumn,
        lock_meta: &'env L,
        prv: u64,
        offset: usize,
        txn: TxnId,
    },
    Write {
        old_value: V,
        column: &'env ValueColumn<V>,
        rw_table: &'env AccessListColumn,
        lock_meta: &'env L,
        prv: u64,
        offset: usize,
        txn: TxnId,
    },
}

impl<'env, V: Clone, L> TransactionInformation<'env, V, L> {
    pub(crate) fn is_write(&self) -> bool {
        matches!(self, TransactionInformation::Write { .. })
    }

    pub(crate) fn offset(&self) -> usize {
        match self {
            TransactionInformation::Read { offset, .. }
            | TransactionInformation::Write { offset, .. } => *offset,
        }
    }

    pub(crate) fn txn(&self) -> TxnId {
        match self {
            TransactionInformation::Read { txn, .. }
            | TransactionInformation::Write { txn, .. } => *txn,
        }
    }

    pub(crate) fn lock_meta(&self) -> &'env L {
        match self {
            TransactionInformation::Read { lock_meta, .. }
            | TransactionInformation::Write { lock_meta, .. } => lock_meta,
        }
    }

    /// Re-installs the saved pre-image in place. Only meaningful for write
    /// entries; the caller holds the record's exclusion.
    pub(crate) fn undo(&self) {
        if let TransactionInformation::Write {
            old_value,
            column,
            offset,
            ..
        } = self
        {
            column.replace(*offset, old_value.clone());
        }
    }

    /// Unlinks this access's tag from the record's access list. The entry
    /// was installed by this transaction, so it must still be present.
    pub(crate) fn purge(&self) {
        match self {
            TransactionInformation::Read {
                rw_table, prv, offset, ..
            }
            | TransactionInformation::Write {
                rw_table, prv, offset, ..
            } => {
                let erased = rw_table.erase(*offset, *prv);
                debug_assert!(erased, "access tag for prv {} already unlinked", prv);
            },
        }
    }
}
