//! Prometheus metrics for SIIRTO
//!
//! Process-wide exporter state. Counters a test or embedder wants to inspect
//! per forwarder live in [`ForwarderStats`](crate::forwarder::ForwarderStats).

use crate::error::{Result, SiirtoError};
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_histogram,
};
use std::sync::OnceLock;

/// Global metrics instance
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// All SIIRTO metrics
pub struct Metrics {
    /// Records delivered downstream in completed transactions
    pub records_forwarded: Counter,

    /// Cycles run (by outcome)
    pub cycles: CounterVec,

    /// Cycle errors (by kind)
    pub errors: CounterVec,

    /// Persisted resume position
    pub offset: Gauge,

    /// Items waiting in the intake queue
    pub intake_queue_size: Gauge,

    /// Push messages lost to the overflow policy (by reason)
    pub intake_dropped: CounterVec,

    /// Time from transaction creation to completion
    pub transaction_latency: Histogram,
}

impl Metrics {
    /// Initialize metrics (call once at startup)
    ///
    /// Returns error if metric registration fails.
    pub fn init() -> Result<&'static Metrics> {
        if let Some(metrics) = METRICS.get() {
            return Ok(metrics);
        }

        let metrics = Metrics {
            records_forwarded: register_counter!(
                "siirto_records_forwarded_total",
                "Total records delivered downstream"
            )
            .map_err(|e| SiirtoError::Metrics(format!("records_forwarded: {e}")))?,

            cycles: register_counter_vec!(
                "siirto_cycles_total",
                "Forwarding cycles by outcome",
                &["outcome"]
            )
            .map_err(|e| SiirtoError::Metrics(format!("cycles: {e}")))?,

            errors: register_counter_vec!(
                "siirto_errors_total",
                "Aborted cycles by error kind",
                &["kind"]
            )
            .map_err(|e| SiirtoError::Metrics(format!("errors: {e}")))?,

            offset: register_gauge!("siirto_offset", "Next sequence id to forward")
                .map_err(|e| SiirtoError::Metrics(format!("offset: {e}")))?,

            intake_queue_size: register_gauge!(
                "siirto_intake_queue_size",
                "Current number of messages in the intake queue"
            )
            .map_err(|e| SiirtoError::Metrics(format!("intake_queue_size: {e}")))?,

            intake_dropped: register_counter_vec!(
                "siirto_intake_dropped_total",
                "Push messages dropped or rejected by the intake queue",
                &["reason"]
            )
            .map_err(|e| SiirtoError::Metrics(format!("intake_dropped: {e}")))?,

            transaction_latency: register_histogram!(
                "siirto_transaction_latency_seconds",
                "Transaction latency from create to complete",
                vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
            )
            .map_err(|e| SiirtoError::Metrics(format!("transaction_latency: {e}")))?,
        };

        // Set the metrics (only succeeds once)
        let _ = METRICS.set(metrics);

        METRICS
            .get()
            .ok_or_else(|| SiirtoError::Metrics("Failed to initialize metrics".to_string()))
    }

    /// Get the global metrics instance
    ///
    /// Returns None if metrics haven't been initialized yet.
    pub fn get() -> Option<&'static Metrics> {
        METRICS.get()
    }

    pub fn record_cycle(&self, outcome: &str) {
        self.cycles.with_label_values(&[outcome]).inc();
    }

    pub fn record_error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }

    pub fn record_forwarded(&self, count: u64) {
        self.records_forwarded.inc_by(count as f64);
    }

    pub fn set_offset(&self, offset: u64) {
        self.offset.set(offset as f64);
    }

    pub fn set_intake_queue_size(&self, size: usize) {
        self.intake_queue_size.set(size as f64);
    }

    pub fn record_intake_dropped(&self, reason: &str, count: u64) {
        self.intake_dropped
            .with_label_values(&[reason])
            .inc_by(count as f64);
    }

    pub fn record_transaction_latency(&self, seconds: f64) {
        self.transaction_latency.observe(seconds);
    }
}

/// Gather all metrics and encode as Prometheus text format
///
/// Returns the metrics as a String, ready to be served via HTTP.
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_ok() {
        String::from_utf8(buffer).unwrap_or_default()
    } else {
        String::new()
    }
}

// Helpers below record only once `Metrics::init` has run, so library code and
// tests can call them unconditionally.

pub fn try_record_cycle(outcome: &str) {
    if let Some(m) = Metrics::get() {
        m.record_cycle(outcome);
    }
}

pub fn try_record_error(kind: &str) {
    if let Some(m) = Metrics::get() {
        m.record_error(kind);
    }
}

pub fn try_record_forwarded(count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_forwarded(count);
    }
}

pub fn try_set_offset(offset: u64) {
    if let Some(m) = Metrics::get() {
        m.set_offset(offset);
    }
}

pub fn try_set_intake_queue_size(size: usize) {
    if let Some(m) = Metrics::get() {
        m.set_intake_queue_size(size);
    }
}

pub fn try_record_intake_dropped(reason: &str, count: u64) {
    if let Some(m) = Metrics::get() {
        m.record_intake_dropped(reason, count);
    }
}

pub fn try_record_transaction_latency(seconds: f64) {
    if let Some(m) = Metrics::get() {
        m.record_transaction_latency(seconds);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_init_and_gather() {
        // Another test may have initialized already; init is idempotent
        let _ = Metrics::init();
        if let Some(metrics) = Metrics::get() {
            metrics.record_cycle("delivered");
            metrics.record_forwarded(3);
            metrics.set_offset(13);

            let text = gather();
            assert!(text.contains("siirto_cycles_total"));
            assert!(text.contains("siirto_records_forwarded_total"));
        }
    }

    #[test]
    fn test_try_helpers_never_panic() {
        try_record_cycle("idle");
        try_record_error("fetch");
        try_record_intake_dropped("overflow", 1);
        try_set_intake_queue_size(0);
        try_record_transaction_latency(0.01);
    }
}
