//! Router assembly.

mod cache_admin;
mod chat;
mod error;
mod headers;
mod health;

use axum::{
    Router,
    routing::{get, post},
};
pub use error::ApiError;
pub use headers::{apply_provenance, directives_from, tenant_from};
use tower_http::{
    cors::CorsLayer, limit::RequestBodyLimitLayer, request_id::MakeRequestUuid, trace::TraceLayer,
};

use crate::state::AppState;

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.server.body_limit_bytes;

    let router = Router::new()
        .route("/v1/chat/completions", post(chat::chat_completions))
        .route("/v1/cache/stats", get(cache_admin::stats))
        .route("/v1/cache/clear", post(cache_admin::clear))
        .route("/v1/cache/golden", post(cache_admin::golden))
        .route("/health", get(health::health_check));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(metrics_endpoint));

    router
        .layer(TraceLayer::new_for_http())
        .layer(tower_http::request_id::SetRequestIdLayer::x_request_id(
            MakeRequestUuid,
        ))
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(body_limit))
        .with_state(state)
}

#[cfg(feature = "prometheus")]
async fn metrics_endpoint() -> axum::response::Response {
    use axum::response::IntoResponse;

    match crate::observability::metrics::prometheus_handle() {
        Some(handle) => handle.render().into_response(),
        None => (
            http::StatusCode::NOT_FOUND,
            "metrics recorder not installed",
        )
            .into_response(),
    }
}
