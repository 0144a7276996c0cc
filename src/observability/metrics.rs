//! Prometheus metrics for the proxy.
//!
//! Counters cover cache lookups and writes per tier, guardrail rejections,
//! breaker transitions, degradation, and upstream forwards. All recording
//! functions are no-ops when the `prometheus` feature is off, so call sites
//! stay unconditional.

#[cfg(feature = "prometheus")]
use std::sync::OnceLock;

#[cfg(feature = "prometheus")]
use metrics::{counter, gauge, histogram};
#[cfg(feature = "prometheus")]
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use thiserror::Error;

use crate::config::MetricsConfig;

#[cfg(feature = "prometheus")]
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Errors during metrics setup.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics setup failed: {0}")]
    Setup(String),
}

/// Install the Prometheus recorder.
#[cfg(feature = "prometheus")]
pub fn init_metrics(config: &MetricsConfig) -> Result<(), MetricsError> {
    if !config.enabled {
        return Ok(());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| MetricsError::Setup(e.to_string()))?;
    PROMETHEUS_HANDLE
        .set(handle)
        .map_err(|_| MetricsError::Setup("metrics already initialized".to_string()))?;
    Ok(())
}

/// Install the Prometheus recorder (no-op without the feature).
#[cfg(not(feature = "prometheus"))]
pub fn init_metrics(_config: &MetricsConfig) -> Result<(), MetricsError> {
    Ok(())
}

/// Handle for rendering `/metrics`.
#[cfg(feature = "prometheus")]
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROMETHEUS_HANDLE.get()
}

/// Record a cache lookup outcome. `tier` is `exact` or `template`; `outcome`
/// is `hit`, `miss`, `bypass` or `error`.
pub fn record_cache_lookup(tier: &str, outcome: &str) {
    #[cfg(feature = "prometheus")]
    counter!(
        "mnemo_cache_lookups_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = (tier, outcome);
}

/// Record a write-through outcome per tier.
pub fn record_cache_write(tier: &str, outcome: &str) {
    #[cfg(feature = "prometheus")]
    counter!(
        "mnemo_cache_writes_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = (tier, outcome);
}

/// Record a candidate dropped by a guardrail.
pub fn record_guardrail_rejection(reason: &str) {
    #[cfg(feature = "prometheus")]
    counter!(
        "mnemo_guardrail_rejections_total",
        "reason" => reason.to_string(),
    )
    .increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = reason;
}

/// Record the composite score of an admitted template hit.
pub fn record_hit_score(score: f64) {
    #[cfg(feature = "prometheus")]
    histogram!("mnemo_template_hit_score").record(score);
    #[cfg(not(feature = "prometheus"))]
    let _ = score;
}

/// Record a request served under a degradation mode.
pub fn record_degraded_request(mode: &str) {
    #[cfg(feature = "prometheus")]
    counter!(
        "mnemo_degraded_requests_total",
        "mode" => mode.to_string(),
    )
    .increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = mode;
}

/// Record a breaker state as a gauge (closed 0, half-open 1, open 2).
pub fn record_breaker_state(dependency: &str, state: &str) {
    #[cfg(feature = "prometheus")]
    {
        let value = match state {
            "open" => 2.0,
            "half_open" => 1.0,
            _ => 0.0,
        };
        gauge!(
            "mnemo_breaker_state",
            "dependency" => dependency.to_string(),
        )
        .set(value);
    }
    #[cfg(not(feature = "prometheus"))]
    let _ = (dependency, state);
}

/// Record an upstream forward.
pub fn record_upstream_forward(provider: &str, outcome: &str) {
    #[cfg(feature = "prometheus")]
    counter!(
        "mnemo_upstream_forwards_total",
        "provider" => provider.to_string(),
        "outcome" => outcome.to_string(),
    )
    .increment(1);
    #[cfg(not(feature = "prometheus"))]
    let _ = (provider, outcome);
}

/// Record a completed deterministic replay.
pub fn record_replay(chunks: usize) {
    #[cfg(feature = "prometheus")]
    histogram!("mnemo_replay_chunks").record(chunks as f64);
    #[cfg(not(feature = "prometheus"))]
    let _ = chunks;
}

/// Record an expired-entry sweep.
pub fn record_sweep_deleted(count: u64) {
    #[cfg(feature = "prometheus")]
    counter!("mnemo_sweep_deleted_total").increment(count);
    #[cfg(not(feature = "prometheus"))]
    let _ = count;
}
