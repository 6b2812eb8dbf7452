//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Chain health and observer progress
//! - Observed, rejected and rolled back events
//! - Signature collection rounds
//! - Destination action outcomes

use crate::asset::ChainKind;
use crate::error::{RelayerError, RelayerResult};

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
        "force_bridge_chain_connected",
        "Chain connection status (1=connected, 0=disconnected)",
        &["chain"]
    ).unwrap();

    pub static ref CHAIN_BLOCK_HEIGHT: GaugeVec = register_gauge_vec!(
        "force_bridge_observed_block_height",
        "Last block handled by the observer per chain",
        &["chain"]
    ).unwrap();

    // Event metrics
    pub static ref EVENTS_OBSERVED: CounterVec = register_counter_vec!(
        "force_bridge_events_observed_total",
        "Source events recorded by kind",
        &["chain", "kind"]
    ).unwrap();

    pub static ref EVENTS_REJECTED: CounterVec = register_counter_vec!(
        "force_bridge_events_rejected_total",
        "Events dropped by validation or policy",
        &["chain", "reason"]
    ).unwrap();

    pub static ref REORGS: CounterVec = register_counter_vec!(
        "force_bridge_reorg_rollbacks_total",
        "Fork rollbacks per chain",
        &["chain"]
    ).unwrap();

    // Multisig metrics
    pub static ref SIG_ROUNDS: CounterVec = register_counter_vec!(
        "force_bridge_signature_rounds_total",
        "Signature collection rounds",
        &["chain"]
    ).unwrap();

    pub static ref SIG_OUTCOMES: CounterVec = register_counter_vec!(
        "force_bridge_signature_outcomes_total",
        "Signature collection results",
        &["chain", "outcome"]
    ).unwrap();

    pub static ref SIGNER_LATENCY: HistogramVec = register_histogram_vec!(
        "force_bridge_signer_latency_seconds",
        "Signer round-trip latency",
        &["host"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
    ).unwrap();

    // Destination action metrics
    pub static ref ACTIONS: CounterVec = register_counter_vec!(
        "force_bridge_dest_actions_total",
        "Destination actions by outcome",
        &["chain", "outcome"]
    ).unwrap();

    // Supervisor metrics
    pub static ref TASK_FAILURES: CounterVec = register_counter_vec!(
        "force_bridge_task_failures_total",
        "Failed supervised task attempts",
        &["task"]
    ).unwrap();

    // Health metrics
    pub static ref HEALTH_CHECK_SUCCESS: CounterVec = register_counter_vec!(
        "force_bridge_health_check_success_total",
        "Total successful health checks",
        &[]
    ).unwrap();

    pub static ref HEALTH_CHECK_FAILURE: CounterVec = register_counter_vec!(
        "force_bridge_health_check_failure_total",
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
            .map_err(|e| RelayerError::Config(format!("bind {}: {}", addr, e)))?;
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

pub fn record_chain_health(chain: ChainKind, healthy: bool) {
    CHAIN_CONNECTED
        .with_label_values(&[chain.as_str()])
        .set(if healthy { 1.0 } else { 0.0 });
}

pub fn record_blocks_processed(chain: ChainKind, block_number: u64) {
    CHAIN_BLOCK_HEIGHT
        .with_label_values(&[chain.as_str()])
        .set(block_number as f64);
}

pub fn record_event(chain: ChainKind, kind: &str) {
    EVENTS_OBSERVED
        .with_label_values(&[chain.as_str(), kind])
        .inc();
}

pub fn record_rejected(chain: ChainKind, reason: &str) {
    EVENTS_REJECTED
        .with_label_values(&[chain.as_str(), reason])
        .inc();
}

pub fn record_reorg(chain: ChainKind) {
    REORGS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_signature_round(chain: ChainKind) {
    SIG_ROUNDS.with_label_values(&[chain.as_str()]).inc();
}

pub fn record_signature_outcome(chain: ChainKind, outcome: &str) {
    SIG_OUTCOMES
        .with_label_values(&[chain.as_str(), outcome])
        .inc();
}

pub fn record_signer_latency(host: &str, latency_secs: f64) {
    SIGNER_LATENCY
        .with_label_values(&[host])
        .observe(latency_secs);
}

pub fn record_action(chain: ChainKind, outcome: &str) {
    ACTIONS.with_label_values(&[chain.as_str(), outcome]).inc();
}

pub fn record_task_failure(task: &str) {
    TASK_FAILURES.with_label_values(&[task]).inc();
}

pub fn record_health_check() {
    HEALTH_CHECK_SUCCESS.with_label_values(&[]).inc();
}

pub fn record_health_check_failure() {
    HEALTH_CHECK_FAILURE.with_label_values(&[]).inc();
}
