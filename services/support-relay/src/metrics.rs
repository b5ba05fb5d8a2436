//! Prometheus metrics exposition
//!
//! Metrics emitted by the relay:
//!
//! - `relay_requests_total` (counter): labels `status`, `outcome`
//! - `relay_request_duration_seconds` (histogram): label `outcome`
//! - `relay_backend_errors_total` (counter): label `kind`, from the executor
//! - `relay_key_rotations_total` (counter): label `outcome`, from the key pool
//! - `relay_keys_exhausted` (gauge), from the key pool

use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram buckets from 5ms to 60s, the backend timeout ceiling.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

fn builder() -> PrometheusBuilder {
    PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("relay_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .expect("histogram buckets are non-empty")
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// Called once at startup before anything emits metrics.
pub fn install_recorder() -> PrometheusHandle {
    builder()
        .install_recorder()
        .expect("failed to install Prometheus recorder")
}

/// Record a completed ask request.
pub fn record_request(status: u16, outcome: &'static str, duration_secs: f64) {
    metrics::counter!("relay_requests_total", "status" => status.to_string(), "outcome" => outcome)
        .increment(1);
    metrics::histogram!("relay_request_duration_seconds", "outcome" => outcome)
        .record(duration_secs);
}
