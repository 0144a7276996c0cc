//! API error envelope.
//!
//! Errors render as the OpenAI-style `{"error": {...}}` body. The cache
//! path never produces one of these: cache failures degrade and continue.

use axum::{
    Json,
    response::{IntoResponse, Response},
};
use http::StatusCode;
use serde_json::json;
use thiserror::Error;

use crate::providers::ProviderError;

#[derive(Debug, Error)]
pub enum ApiError {
    /// Malformed or invalid request body. Never cached.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No upstream serves the requested model.
    #[error("no provider configured for model '{0}'")]
    NoRoute(String),

    /// The provider breaker is open.
    #[error("upstream provider unavailable")]
    UpstreamUnavailable,

    /// Transport-level failure reaching the provider.
    #[error("upstream request failed: {0}")]
    UpstreamTransport(String),

    /// A cached replay could not be prepared.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<ProviderError> for ApiError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NoRoute(model) => ApiError::NoRoute(model),
            ProviderError::CircuitOpen => ApiError::UpstreamUnavailable,
            ProviderError::Request(e) => ApiError::UpstreamTransport(e.to_string()),
        }
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NoRoute(_) => StatusCode::NOT_FOUND,
            ApiError::UpstreamUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request_error",
            ApiError::NoRoute(_) => "invalid_request_error",
            ApiError::UpstreamUnavailable | ApiError::UpstreamTransport(_) => "upstream_error",
            ApiError::Internal(_) => "server_error",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_request_maps_to_400() {
        let response = ApiError::InvalidRequest("messages must not be empty".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn provider_errors_map_to_gateway_statuses() {
        let response: Response = ApiError::from(ProviderError::NoRoute("x".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        let response: Response = ApiError::from(ProviderError::CircuitOpen).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
