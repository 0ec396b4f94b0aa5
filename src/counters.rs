// Copyright © Aptos Foundation
// SPDX-License-Identifier: Apache-2.0

use once_cell::sync::Lazy;
use prometheus::{register_int_counter, IntCounter};

/// Count of transactions started across all worker sessions.
pub static TXN_STARTED_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_started_count",
        "Count of transactions started across all worker sessions"
    )
    .unwrap()
});

/// Count of committed transactions.
pub static TXN_COMMITTED_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_committed_count",
        "Count of committed transactions"
    )
    .unwrap()
});

/// Count of aborted transactions, whatever the trigger.
pub static TXN_ABORTED_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_aborted_count",
        "Count of aborted transactions, whatever the trigger"
    )
    .unwrap()
});

/// Count of transactions wounded by an older conflicting transaction.
pub static TXN_WOUNDED_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_wounded_count",
        "Count of transactions wounded by an older conflicting transaction"
    )
    .unwrap()
});

/// Count of transactions marked for abort by a cascading predecessor abort.
pub static CASCADE_ABORT_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_cascade_abort_count",
        "Count of transactions marked for abort by a cascading predecessor abort"
    )
    .unwrap()
});

/// Count of dependency cycles caught by the serialization graph.
pub static CYCLE_DETECTED_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_cycle_detected_count",
        "Count of dependency cycles caught by the serialization graph"
    )
    .unwrap()
});

/// Count of write installations retried behind an uncommitted earlier
/// writer.
pub static WRITE_WRITE_RETRY_COUNT: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "txn_coordinator_write_write_retry_count",
        "Count of write installations retried behind an uncommitted earlier writer"
    )
    .unwrap()
});
