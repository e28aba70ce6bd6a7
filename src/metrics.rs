//! Prometheus metrics

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{Error, Result};

/// Install the Prometheus recorder.
///
/// Returns the handle the metrics listener renders scrape responses from.
/// Call at most once per process.
pub fn init() -> Result<PrometheusHandle> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Internal(format!("failed to install Prometheus exporter: {e}")))?;

    tracing::info!("Prometheus metrics exporter installed");

    Ok(handle)
}

/// Record an auth decision on the application routes
pub fn record_auth_request(provider: &'static str, outcome: &'static str) {
    metrics::counter!("authgate_auth_requests_total",
        "provider" => provider,
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a proxy verification decision
pub fn record_verify(outcome: &'static str) {
    metrics::counter!("authgate_verify_total", "outcome" => outcome).increment(1);
}

/// Record a certificate hot-reload attempt
pub fn record_cert_reload(outcome: &'static str) {
    metrics::counter!("authgate_cert_reloads_total", "outcome" => outcome).increment(1);
}
