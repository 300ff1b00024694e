//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    CORRELATION_FAILURES_TOTAL, DELIVERIES_TOTAL, DISPATCHES_ABANDONED_TOTAL, DISPATCHES_TOTAL,
    GROUP_REGISTRATION_FAILURES_TOTAL, IDENTITY_FAILURES_TOTAL, JOINS_TOTAL,
    SCHEDULING_FAILURES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Helper struct for recording dispatch metrics
pub struct DispatchMetrics;

impl DispatchMetrics {
    pub fn record_scheduled(mode: &str) {
        DISPATCHES_TOTAL.with_label_values(&[mode]).inc();
    }

    pub fn record_abandoned() {
        DISPATCHES_ABANDONED_TOTAL.inc();
    }

    pub fn record_scheduling_failure() {
        SCHEDULING_FAILURES_TOTAL.inc();
    }

    pub fn record_correlation_failure() {
        CORRELATION_FAILURES_TOTAL.inc();
    }
}

/// Helper struct for recording per-target delivery outcomes
pub struct DeliveryMetrics;

impl DeliveryMetrics {
    pub fn record_delivered(mode: &str) {
        DELIVERIES_TOTAL.with_label_values(&[mode, "delivered"]).inc();
    }

    pub fn record_timeout(mode: &str) {
        DELIVERIES_TOTAL.with_label_values(&[mode, "timeout"]).inc();
    }

    pub fn record_error(mode: &str) {
        DELIVERIES_TOTAL.with_label_values(&[mode, "error"]).inc();
    }
}

/// Helper struct for recording membership metrics
pub struct MembershipMetrics;

impl MembershipMetrics {
    pub fn record_connected() {
        JOINS_TOTAL.with_label_values(&["connected"]).inc();
    }

    pub fn record_reconnected() {
        JOINS_TOTAL.with_label_values(&["reconnected"]).inc();
    }

    pub fn record_registration_failure() {
        GROUP_REGISTRATION_FAILURES_TOTAL.inc();
    }

    pub fn record_identity_failure() {
        IDENTITY_FAILURES_TOTAL.inc();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_contains_recorded_metrics() {
        DispatchMetrics::record_scheduled("token");
        DeliveryMetrics::record_timeout("token");
        MembershipMetrics::record_connected();

        let output = encode_metrics().unwrap();
        assert!(output.contains("relay_dispatches_total"));
        assert!(output.contains("relay_deliveries_total"));
        assert!(output.contains("relay_joins_total"));
    }
}
