// src/metrics.rs
// C13: Prometheus counters/gauges for the four rates called out in SPEC_FULL
// §6 (round completions, error rate, provider fallback, live WS connections),
// installed the way the teacher's `metrics::mod` wraps `PrometheusBuilder`
// behind a `/metrics` handler.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

pub fn init() {
    let handle = PrometheusBuilder::new().install_recorder().expect("failed to install Prometheus recorder");
    let _ = PROMETHEUS_HANDLE.set(handle);
    tracing::info!("metrics recorder installed");
}

pub async fn handler() -> impl IntoResponse {
    match PROMETHEUS_HANDLE.get() {
        Some(handle) => (StatusCode::OK, handle.render()),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics not initialized".to_string()),
    }
}

pub fn record_round_complete() {
    metrics::counter!("discussion_rounds_total").increment(1);
}

pub fn record_error(category: &str) {
    metrics::counter!("discussion_errors_total", "category" => category.to_string()).increment(1);
}

pub fn record_provider_fallback(provider: &str, model: &str) {
    metrics::counter!("provider_fallback_total", "provider" => provider.to_string(), "model" => model.to_string())
        .increment(1);
}

pub fn connection_opened(count: usize) {
    metrics::gauge!("ws_connections_active").set(count as f64);
}

pub fn connection_closed(count: usize) {
    metrics::gauge!("ws_connections_active").set(count as f64);
}
