//! Prometheus metrics for the ingestion pipeline

use once_cell::sync::Lazy;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, IntCounter,
    IntCounterVec, IntGauge,
};

use crate::pipeline::PipelineState;

const LABEL_CLASS: &str = "class";

/// Messages received from the broker, including empty and undecodable ones
pub static MESSAGES_RECEIVED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_ingest_messages_received_total",
        "Total messages received from the broker"
    )
    .expect("Failed to register messages_received metric")
});

pub static MESSAGES_EMPTY: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_ingest_messages_empty_total",
        "Messages skipped because they carried no payload"
    )
    .expect("Failed to register messages_empty metric")
});

pub static MESSAGES_UNDECODABLE: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_ingest_messages_undecodable_total",
        "Messages whose payload failed to parse as JSON"
    )
    .expect("Failed to register messages_undecodable metric")
});

pub static DOCUMENTS_INSERTED: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_ingest_documents_inserted_total",
        "Documents persisted to the store"
    )
    .expect("Failed to register documents_inserted metric")
});

/// Dropped inserts by failure class ("store" or "unexpected")
pub static INSERT_FAILURES: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "devstream_ingest_insert_failures_total",
        "Documents dropped after a failed insert",
        &[LABEL_CLASS]
    )
    .expect("Failed to register insert_failures metric")
});

pub static PIPELINE_RESTARTS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "devstream_ingest_pipeline_restarts_total",
        "Pipeline restarts performed by the supervisor"
    )
    .expect("Failed to register pipeline_restarts metric")
});

static PIPELINE_STATE: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "devstream_ingest_pipeline_state",
        "Current pipeline state (0=initializing 1=running 2=draining 3=stopped 4=crashed)"
    )
    .expect("Failed to register pipeline_state metric")
});

pub fn set_pipeline_state(state: PipelineState) {
    let code = match state {
        PipelineState::Initializing => 0,
        PipelineState::Running => 1,
        PipelineState::Draining => 2,
        PipelineState::Stopped => 3,
        PipelineState::Crashed => 4,
    };
    PIPELINE_STATE.set(code);
}
