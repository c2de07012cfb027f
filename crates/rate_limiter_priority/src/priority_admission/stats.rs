//! Metric emission for admission decisions.

use std::time::Duration;

use metrics::{counter, histogram};

/// Gauge-style snapshot after every pump pass. Histograms, as both values
/// move many times per reporting interval and the distribution is what
/// matters for diagnosis.
pub(super) fn emit_gate(in_flight: usize, queue_depth: usize) {
    histogram!("priority_admission_in_flight").record(in_flight as f64);
    histogram!("priority_admission_queue_depth").record(queue_depth as f64);
    tracing::trace!(
        target: "priority_admission::stats",
        in_flight,
        queue_depth,
        "Gate updated"
    );
}

pub(super) fn emit_admission(queue_wait: Duration, cost: u64) {
    histogram!("priority_admission_queue_wait").record(queue_wait);
    histogram!("priority_admission_admitted_cost").record(cost as f64);
    tracing::debug!(
        target: "priority_admission::stats",
        queue_wait_ms = queue_wait.as_millis() as u64,
        cost,
        "Request admitted"
    );
}

pub(super) fn emit_backoff_entered(delay: Duration, hinted: bool) {
    counter!("priority_admission_backoff_entered_total").increment(1);
    histogram!("priority_admission_backoff_delay").record(delay);
    tracing::debug!(
        target: "priority_admission::stats",
        delay_ms = delay.as_millis() as u64,
        hinted,
        "Backoff armed"
    );
}

pub(super) fn emit_rejection(reason: &'static str) {
    counter!("priority_admission_rejected_total", "reason" => reason).increment(1);
}
