//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status
//! - Workflow lifecycle transitions
//! - Scheduler ticks
//! - Token-created scan progress

use crate::error::{RelayerError, RelayerResult};
use crate::events::WorkflowEvent;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, Encoder,
    GaugeVec, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tracing::info;

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "points_relayer_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).unwrap();

    pub static ref TX_SUBMITTED: CounterVec = register_counter_vec!(
        "points_relayer_transactions_submitted_total",
        "Total transactions submitted",
        &["chain_id"]
    ).unwrap();

    // Workflow metrics
    pub static ref WORKFLOW_EVENTS: CounterVec = register_counter_vec!(
        "points_relayer_workflow_events_total",
        "Workflow events by type",
        &["event_type"]
    ).unwrap();

    pub static ref INVOKE_TRANSITIONS: CounterVec = register_counter_vec!(
        "points_relayer_invoke_transitions_total",
        "Contract-invoke status transitions",
        &["chain_id", "to"]
    ).unwrap();

    pub static ref SYNC_TRANSITIONS: CounterVec = register_counter_vec!(
        "points_relayer_sync_transitions_total",
        "Token sync status transitions",
        &["to"]
    ).unwrap();

    pub static ref RETRIES_EXHAUSTED: CounterVec = register_counter_vec!(
        "points_relayer_retries_exhausted_total",
        "Failed contract-invoke workflows that hit the retry cutoff",
        &["chain_id"]
    ).unwrap();

    // Scheduler metrics
    pub static ref TICK_ADVANCES: CounterVec = register_counter_vec!(
        "points_relayer_tick_advances_total",
        "Per-id advancements by scheduler loop and outcome",
        &["loop", "outcome"]
    ).unwrap();

    pub static ref TICK_LATENCY: HistogramVec = register_histogram_vec!(
        "points_relayer_tick_latency_seconds",
        "Scheduler tick duration",
        &["loop"],
        vec![0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
    ).unwrap();

    pub static ref SCAN_WATERMARK: GaugeVec = register_gauge_vec!(
        "points_relayer_scan_watermark",
        "Last scanned height of the token-created event search",
        &["chain_id"]
    ).unwrap();

    pub static ref SETTLEMENT_BATCHES: CounterVec = register_counter_vec!(
        "points_relayer_settlement_batches_total",
        "Settlement batches handed to contract-invoke workflows",
        &["chain_id", "point_name"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "points_relayer_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "points_relayer_health_check_failure_total",
        "Total failed health checks",
        &[]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> RelayerResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| RelayerError::Config(format!("Cannot bind {}: {}", addr, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;
    String::from_utf8(buffer).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: &str, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain_id])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_tx_submitted(chain_id: &str) {
    TX_SUBMITTED.with_label_values(&[chain_id]).inc();
}

pub fn record_workflow_event(event: &WorkflowEvent) {
    WORKFLOW_EVENTS.with_label_values(&[event.name()]).inc();

    match event {
        WorkflowEvent::InvokeStatusChanged { chain_id, to, .. } => {
            INVOKE_TRANSITIONS
                .with_label_values(&[chain_id.as_str(), to.as_str()])
                .inc();
        }
        WorkflowEvent::SyncStatusChanged { to, .. } => {
            SYNC_TRANSITIONS.with_label_values(&[to.as_str()]).inc();
        }
        WorkflowEvent::InvokeCreated { .. } | WorkflowEvent::SyncCreated { .. } => {}
    }
}

pub fn record_retries_exhausted(chain_id: &str) {
    RETRIES_EXHAUSTED.with_label_values(&[chain_id]).inc();
}

pub fn record_tick(loop_name: &str, succeeded: usize, failed: usize, latency_secs: f64) {
    TICK_ADVANCES
        .with_label_values(&[loop_name, "ok"])
        .inc_by(succeeded as f64);
    TICK_ADVANCES
        .with_label_values(&[loop_name, "error"])
        .inc_by(failed as f64);
    TICK_LATENCY
        .with_label_values(&[loop_name])
        .observe(latency_secs);
}

pub fn record_scan_watermark(chain_id: &str, height: u64) {
    SCAN_WATERMARK
        .with_label_values(&[chain_id])
        .set(height as f64);
}

pub fn record_settlement_batch(chain_id: &str, point_name: &str) {
    SETTLEMENT_BATCHES
        .with_label_values(&[chain_id, point_name])
        .inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
