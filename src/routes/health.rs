//! Health endpoint: per-dependency status and the active degradation mode.

use axum::{Json, extract::State, response::IntoResponse};
use serde::Serialize;

use crate::{observability::metrics, resilience::CircuitState, state::AppState};

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    /// "healthy", "degraded" or "passthrough".
    pub status: &'static str,
    pub version: &'static str,
    pub degradation: &'static str,
    pub dependencies: DependencyStatus,
}

#[derive(Debug, Serialize)]
pub struct DependencyStatus {
    pub hot_tier: ComponentStatus,
    pub index_tier: ComponentStatus,
    pub embedder: ComponentStatus,
    pub provider: ComponentStatus,
}

#[derive(Debug, Serialize)]
pub struct ComponentStatus {
    pub healthy: bool,
    pub breaker: CircuitState,
}

/// `GET /health`
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let breakers = state.engine.breakers();
    let degradation = breakers.degradation();

    let hot_probe = state.engine.probe_hot().await;
    let index_probe = state.engine.probe_index().await;

    for breaker in [
        &breakers.hot,
        &breakers.indexed,
        &breakers.embedder,
        &breakers.provider,
    ] {
        metrics::record_breaker_state(breaker.dependency(), breaker.state().as_str());
    }

    let status = if !degradation.is_degraded() && hot_probe && index_probe {
        "healthy"
    } else if degradation == crate::resilience::DegradationMode::Passthrough {
        "passthrough"
    } else {
        "degraded"
    };

    Json(HealthStatus {
        status,
        version: env!("CARGO_PKG_VERSION"),
        degradation: degradation.as_str(),
        dependencies: DependencyStatus {
            hot_tier: ComponentStatus {
                healthy: hot_probe,
                breaker: breakers.hot.state(),
            },
            index_tier: ComponentStatus {
                healthy: index_probe,
                breaker: breakers.indexed.state(),
            },
            embedder: ComponentStatus {
                healthy: breakers.embedder.is_up(),
                breaker: breakers.embedder.state(),
            },
            provider: ComponentStatus {
                healthy: breakers.provider.is_up(),
                breaker: breakers.provider.state(),
            },
        },
    })
}
