// src/core/metrics.rs

//! Defines and registers Prometheus metrics for server monitoring.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only once
//! globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, TextEncoder, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    // --- Gauges ---
    /// 1 while a controlling client is connected, 0 otherwise.
    pub static ref CLIENT_CONNECTED: Gauge =
        register_gauge!("llrpd_client_connected", "Whether a controlling client is currently connected (1 or 0).").unwrap();

    // --- Counters ---
    /// The total number of connection attempts accepted since startup.
    pub static ref CONNECTIONS_ACCEPTED_TOTAL: Counter =
        register_counter!("llrpd_connections_accepted_total", "Total number of accepted connection attempts.").unwrap();
    /// The total number of connection attempts denied because a client was already connected.
    pub static ref CONNECTIONS_DENIED_TOTAL: Counter =
        register_counter!("llrpd_connections_denied_total", "Total number of denied connection attempts.").unwrap();
    /// The total number of keepalive messages sent.
    pub static ref KEEPALIVES_SENT_TOTAL: Counter =
        register_counter!("llrpd_keepalives_sent_total", "Total number of keepalive messages sent.").unwrap();
    /// The total number of sessions aborted for a missing keepalive acknowledgment.
    pub static ref KEEPALIVE_TIMEOUTS_TOTAL: Counter =
        register_counter!("llrpd_keepalive_timeouts_total", "Total number of keepalive acknowledgment timeouts.").unwrap();
    /// The total number of messages delivered to the owning service.
    pub static ref MESSAGES_RECEIVED_TOTAL: Counter =
        register_counter!("llrpd_messages_received_total", "Total number of inbound messages delivered.").unwrap();
    /// The total number of error replies sent for malformed inbound messages, labeled by status.
    pub static ref ERROR_REPLIES_TOTAL: CounterVec =
        register_counter_vec!("llrpd_error_replies_total", "Total number of error replies sent, labeled by status code.", &["status"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
