// Lock metrics
// Counters and gauges published through the `metrics` facade; no exporter is installed here

use metrics::{counter, describe_counter, describe_gauge, gauge};

use crate::backend::BackendKind;

/// Initialize all metric descriptions
/// Should be called once at application startup
pub fn init_metrics() {
    describe_counter!(
        "lock_acquired_total",
        "Total number of successful backend lock acquisitions"
    );
    describe_counter!(
        "lock_contended_total",
        "Total number of try-acquire attempts refused because the lock was held"
    );
    describe_counter!(
        "lock_retries_exhausted_total",
        "Total number of lock calls that gave up after the configured tries"
    );
    describe_counter!(
        "lock_renewals_total",
        "Total number of lease renewal attempts by outcome"
    );
    describe_counter!(
        "leader_transitions_total",
        "Total number of leadership gains and losses"
    );
    describe_gauge!("lock_waiters", "Local callers waiting on a lock name");

    tracing::debug!("Lock metrics initialized");
}

pub fn record_acquired(kind: BackendKind) {
    counter!("lock_acquired_total", "backend" => kind.as_str()).increment(1);
}

pub fn record_contended(kind: BackendKind) {
    counter!("lock_contended_total", "backend" => kind.as_str()).increment(1);
}

pub fn record_retries_exhausted() {
    counter!("lock_retries_exhausted_total").increment(1);
}

pub fn record_renewal(outcome: &'static str) {
    counter!("lock_renewals_total", "outcome" => outcome).increment(1);
}

pub fn record_leader_transition(event: &'static str) {
    counter!("leader_transitions_total", "event" => event).increment(1);
}

pub fn set_waiters(name: &str, waiters: i32) {
    gauge!("lock_waiters", "name" => name.to_string()).set(waiters as f64);
}
