//! Metrics collection for grant-service.
//!
//! Counters are recorded through the `metrics` facade and rendered by the
//! Prometheus recorder installed in `init_metrics`.

use metrics::{counter, describe_counter};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use service_core::error::AppError;
use std::sync::OnceLock;

pub static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Later calls are no-ops.
pub fn init_metrics() -> Result<(), AppError> {
    if METRICS_HANDLE.get().is_some() {
        return Ok(());
    }

    let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
        AppError::ConfigError(anyhow::anyhow!("failed to install Prometheus recorder: {}", e))
    })?;
    let _ = METRICS_HANDLE.set(handle);

    describe_counter!(
        "grant_tokens_requested_total",
        "Verify tokens issued and mailed"
    );
    describe_counter!(
        "grant_tokens_verified_total",
        "Verify token redemptions by outcome"
    );
    describe_counter!(
        "grant_decisions_total",
        "Rule evaluator decisions on grant requests"
    );
    describe_counter!(
        "grant_provisioning_total",
        "Account provisioning attempts by host and outcome"
    );

    Ok(())
}

/// Get metrics output in Prometheus text format.
pub fn get_metrics() -> String {
    METRICS_HANDLE
        .get()
        .map(|handle| handle.render())
        .unwrap_or_else(|| "# Metrics recorder not initialized\n".to_string())
}

pub fn record_token_requested() {
    counter!("grant_tokens_requested_total").increment(1);
}

pub fn record_token_verified(outcome: &'static str) {
    counter!("grant_tokens_verified_total", "outcome" => outcome).increment(1);
}

pub fn record_decision(decision: &'static str) {
    counter!("grant_decisions_total", "decision" => decision).increment(1);
}

pub fn record_provisioning(host: &str, outcome: &'static str) {
    counter!(
        "grant_provisioning_total",
        "host" => host.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
