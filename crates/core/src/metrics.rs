//! Metrics definitions for the donation services.
//!
//! This module defines all metrics used throughout the workspace.
//! Metrics are collected using the `metrics` crate and can be exported
//! to Prometheus via `metrics-exporter-prometheus`.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Instant;

use crate::models::TotalSource;

/// Initialize all metric descriptions.
/// Call this once at startup before any metrics are recorded.
pub fn init_metrics() {
    describe_counter!(
        "total_updates_total",
        "Number of running-total updates accepted, by source"
    );
    describe_counter!(
        "total_updates_discarded_total",
        "Number of historical scans discarded because an authoritative source arrived first"
    );
    describe_gauge!("running_total_ether", "Running donation total in ether");
    describe_histogram!(
        "historical_scan_duration_seconds",
        "Time taken by the historical transfer scan in seconds"
    );
    describe_counter!(
        "publications_total",
        "Donation record publications, by outcome"
    );
    describe_counter!(
        "duplicate_confirmations_total",
        "Confirmation notifications ignored because a publication was already attempted"
    );
    describe_counter!(
        "records_dropped_total",
        "Stored donation records dropped during aggregation, by reason"
    );
    describe_counter!(
        "outbound_retries_total",
        "Retried outbound calls to the ledger or content store"
    );
}

/// Record an accepted running-total update.
pub fn record_total_update(source: TotalSource, total_ether: f64) {
    counter!("total_updates_total", "source" => source.as_str()).increment(1);
    gauge!("running_total_ether").set(total_ether);
}

/// Record a historical scan that arrived too late to be applied.
pub fn record_total_update_discarded() {
    counter!("total_updates_discarded_total").increment(1);
}

/// Record a publication outcome ("published" or "failed").
pub fn record_publication(outcome: &'static str) {
    counter!("publications_total", "outcome" => outcome).increment(1);
}

/// Record an ignored duplicate confirmation.
pub fn record_duplicate_confirmation() {
    counter!("duplicate_confirmations_total").increment(1);
}

/// Record a dropped record.
///
/// # Arguments
/// * `reason` - "fetch" or "parse"
pub fn record_record_dropped(reason: &'static str) {
    counter!("records_dropped_total", "reason" => reason).increment(1);
}

/// Record a retried outbound call.
pub fn record_retry(operation: &str) {
    counter!("outbound_retries_total", "operation" => operation.to_string()).increment(1);
}

/// A timer that records the historical scan duration when dropped.
pub struct ScanTimer {
    start: Instant,
}

impl ScanTimer {
    /// Start a new scan timer.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for ScanTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ScanTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        histogram!("historical_scan_duration_seconds").record(duration);
    }
}
