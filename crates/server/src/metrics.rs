//! Prometheus metrics for the distribution side

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

pub static ACTIVE_SESSIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "devstream_active_sessions",
        "WebSocket sessions currently registered"
    )
    .expect("Failed to register active_sessions metric")
});

pub static BROADCAST_DELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_broadcast_delivered_total",
        "Payloads queued to WebSocket sessions by broadcast"
    )
    .expect("Failed to register broadcast_delivered metric")
});

pub static SESSIONS_PRUNED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_sessions_pruned_total",
        "Sessions removed after a failed write"
    )
    .expect("Failed to register sessions_pruned metric")
});

/// Admission rejections by reason ("missing_token", "invalid_token")
pub static ADMISSIONS_REJECTED: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "devstream_admissions_rejected_total",
        "WebSocket admissions refused by the authorizer",
        &["reason"]
    )
    .expect("Failed to register admissions_rejected metric")
});

/// Render every registered metric in the Prometheus text format
pub fn encode() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
