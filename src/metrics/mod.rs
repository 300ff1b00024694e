//! Prometheus metrics for the relay.
//!
//! - Dispatch metrics (scheduled by mode, abandoned at the deadline, scheduling failures)
//! - Delivery metrics (per-target outcome)
//! - Membership metrics (joins, identity resolution and correlation failures)
//! - Transport gauges (live connections, groups)

mod helpers;

pub use helpers::{encode_metrics, DeliveryMetrics, DispatchMetrics, MembershipMetrics};

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "relay";

lazy_static! {
    // ============================================================================
    // Dispatch Metrics
    // ============================================================================

    /// Dispatches scheduled, by addressing mode
    pub static ref DISPATCHES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_dispatches_total", METRIC_PREFIX),
        "Total dispatches scheduled",
        &["mode"]
    ).unwrap();

    /// Dispatches cancelled by the deadline before reaching every target
    pub static ref DISPATCHES_ABANDONED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_dispatches_abandoned_total", METRIC_PREFIX),
        "Dispatches cancelled at the delivery deadline"
    ).unwrap();

    /// Dispatches that could not be scheduled at all
    pub static ref SCHEDULING_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_scheduling_failures_total", METRIC_PREFIX),
        "Dispatches that could not be scheduled"
    ).unwrap();

    // ============================================================================
    // Delivery Metrics
    // ============================================================================

    /// Per-target delivery outcomes
    pub static ref DELIVERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_deliveries_total", METRIC_PREFIX),
        "Per-target delivery attempts by outcome",
        &["mode", "outcome"]
    ).unwrap();

    // ============================================================================
    // Membership Metrics
    // ============================================================================

    /// Join operations by lifecycle event
    pub static ref JOINS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_joins_total", METRIC_PREFIX),
        "Connection joins by lifecycle event",
        &["event"]
    ).unwrap();

    /// Failed group registrations
    pub static ref GROUP_REGISTRATION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_group_registration_failures_total", METRIC_PREFIX),
        "Failed attempts to add a connection to a group"
    ).unwrap();

    /// Identity resolution failures
    pub static ref IDENTITY_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_identity_resolution_failures_total", METRIC_PREFIX),
        "Failed credential to identity resolutions"
    ).unwrap();

    /// Dispatch tasks started without a correlation id
    pub static ref CORRELATION_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_correlation_propagation_failures_total", METRIC_PREFIX),
        "Dispatch tasks that ran without a propagated correlation id"
    ).unwrap();

    // ============================================================================
    // Transport Metrics
    // ============================================================================

    /// Live connections on the in-process transport
    pub static ref CONNECTIONS_TOTAL: IntGauge = register_int_gauge!(
        format!("{}_connections_total", METRIC_PREFIX),
        "Number of live connections"
    ).unwrap();

    /// Groups with at least one member
    pub static ref GROUPS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_groups_active", METRIC_PREFIX),
        "Number of recipient groups with at least one member"
    ).unwrap();
}
