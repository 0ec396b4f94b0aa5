// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

//! In-memory operation log, compiled in with the `op-log` feature. Appends
//! never fail and are absorbed silently when the feature is off.

use crate::types::TxnId;

/// One operation record. `op` is one of `'r'`, `'w'`, `'a'`, `'c'`, `'e'`
/// for read, write, abort, commit and cycle-detected. `target` identifies
/// the touched access-list column by address.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogInfo {
    pub transaction: TxnId,
    pub prv: u64,
    pub target: usize,
    pub offset: usize,
    pub op: char,
}

#[cfg(feature = "op-log")]
pub(crate) struct OpLog {
    entries: parking_lot::Mutex<Vec<LogInfo>>,
}

#[cfg(feature = "op-log")]
impl OpLog {
    pub(crate) fn new() -> Self {
        Self {
            entries: parking_lot::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn append(&self, info: LogInfo) {
        self.entries.lock().push(info);
    }

    pub(crate) fn take(&self) -> Vec<LogInfo> {
        std::mem::take(&mut self.entries.lock())
    }
}
