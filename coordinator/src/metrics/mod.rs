//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain connection status and block height
//! - Escrow events and submitted escrow calls
//! - Swap status transitions and retries

use crate::error::{SwapError, SwapResult};

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_int_gauge, CounterVec, Encoder, GaugeVec,
    IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use tracing::{error, info};

lazy_static! {
    // Chain metrics
    pub static ref CHAIN_CONNECTED: GaugeVec = register_gauge_vec!(
        "htlc_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain_id"]
    ).expect("metric registers once");

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "htlc_chain_block_height",
        "Latest observed block height per chain",
        &["chain_id"]
    ).expect("metric registers once");

    // Escrow metrics
    pub static ref ESCROW_EVENTS: CounterVec = register_counter_vec!(
        "htlc_escrow_events_total",
        "Finalized escrow events by type",
        &["chain_id", "event_type"]
    ).expect("metric registers once");

    pub static ref ESCROW_CALLS: CounterVec = register_counter_vec!(
        "htlc_escrow_calls_submitted_total",
        "Escrow calls submitted by this process",
        &["chain_id", "call"]
    ).expect("metric registers once");

    // Swap metrics
    pub static ref SWAP_TRANSITIONS: CounterVec = register_counter_vec!(
        "htlc_swap_transitions_total",
        "Swaps entering each status",
        &["status"]
    ).expect("metric registers once");

    pub static ref ACTIVE_SWAPS: IntGauge = register_int_gauge!(
        "htlc_active_swaps",
        "Swaps not yet finished"
    ).expect("metric registers once");

    pub static ref SWAP_RETRIES: CounterVec = register_counter_vec!(
        "htlc_swap_retries_total",
        "Swap steps rescheduled after a transient failure",
        &["error"]
    ).expect("metric registers once");

    // Health metrics
    pub static ref HEALTH_CHECKS: CounterVec = register_counter_vec!(
        "htlc_health_checks_total",
        "Health checks by result",
        &["result"]
    ).expect("metric registers once");
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SwapResult<()> {
        let app = Router::new().route("/metrics", get(metrics_handler));

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SwapError::Config(format!("cannot bind metrics port {}: {}", self.port, e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SwapError::Internal(format!("metrics server: {}", e)))?;

        Ok(())
    }
}

async fn metrics_handler() -> Result<String, StatusCode> {
    render().map_err(|e| {
        error!("Failed to encode metrics: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

/// Text exposition of every registered metric
pub fn render() -> SwapResult<String> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| SwapError::Internal(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| SwapError::Internal(e.to_string()))
}

// Helper functions to record metrics

pub fn record_chain_health(chain_id: u64, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[&chain_id.to_string()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_block_height(chain_id: u64, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[&chain_id.to_string()])
        .set(block_number as f64);
}

pub fn record_event(chain_id: u64, event_type: &str) {
    ESCROW_EVENTS
        .with_label_values(&[&chain_id.to_string(), event_type])
        .inc();
}

pub fn record_submission(chain_id: u64, call: &str) {
    ESCROW_CALLS
        .with_label_values(&[&chain_id.to_string(), call])
        .inc();
}

pub fn record_swap_status(status: &str) {
    SWAP_TRANSITIONS.with_label_values(&[status]).inc();
}

pub fn set_active_swaps(count: usize) {
    ACTIVE_SWAPS.set(count as i64);
}

pub fn record_retry(error_kind: &str) {
    SWAP_RETRIES.with_label_values(&[error_kind]).inc();
}

pub fn record_health_check(healthy: bool) {
    HEALTH_CHECKS
        .with_label_values(&[if healthy { "success" } else { "failure" }])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_includes_recorded_metrics() {
        record_event(4242, "htlc_locked");
        record_swap_status("locked_both");
        set_active_swaps(3);

        let text = render().unwrap();
        assert!(text.contains("htlc_escrow_events_total"));
        assert!(text.contains("chain_id=\"4242\""));
        assert!(text.contains("htlc_swap_transitions_total"));
        assert!(text.contains("htlc_active_swaps"));
    }
}
