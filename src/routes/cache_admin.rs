//! Operational cache endpoints: stats, clear, golden promotion.

use axum::{Json, extract::State, response::IntoResponse};
use http::StatusCode;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::AppState;

/// `GET /v1/cache/stats`
pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.stats().await)
}

#[derive(Debug, Default, Deserialize)]
pub struct ClearRequest {
    /// Tenant to clear; both tiers are cleared entirely when absent.
    #[serde(default)]
    pub tenant: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ClearResponse {
    pub cleared: bool,
    pub index_entries_deleted: u64,
}

/// `POST /v1/cache/clear`
///
/// The body is optional; an empty body clears everything.
pub async fn clear(State(state): State<AppState>, body: bytes::Bytes) -> impl IntoResponse {
    let request: ClearRequest = if body.is_empty() {
        ClearRequest::default()
    } else {
        serde_json::from_slice(&body).unwrap_or_default()
    };
    let (hot_ok, deleted) = state.engine.clear(request.tenant.as_deref()).await;
    tracing::info!(
        tenant = request.tenant.as_deref().unwrap_or("<all>"),
        deleted,
        hot_ok,
        "cache cleared"
    );
    Json(ClearResponse {
        cleared: hot_ok,
        index_entries_deleted: deleted,
    })
}

#[derive(Debug, Deserialize)]
pub struct GoldenRequest {
    pub entry_id: Uuid,
    pub golden: bool,
}

#[derive(Debug, Serialize)]
pub struct GoldenResponse {
    pub updated: bool,
}

/// `POST /v1/cache/golden` — pin or unpin an entry. Pinned entries are
/// exempt from TTL expiry and the sweep job.
pub async fn golden(
    State(state): State<AppState>,
    Json(request): Json<GoldenRequest>,
) -> impl IntoResponse {
    match state.engine.set_golden(request.entry_id, request.golden).await {
        Ok(updated) => {
            if updated {
                tracing::info!(entry_id = %request.entry_id, golden = request.golden, "golden flag updated");
            }
            (StatusCode::OK, Json(GoldenResponse { updated })).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "golden update failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(GoldenResponse { updated: false }),
            )
                .into_response()
        }
    }
}
