//! Upstream providers.
//!
//! Every upstream speaks the OpenAI chat-completions wire format; requests
//! are dispatched to the first configured upstream whose model patterns
//! match, and whatever the provider returns — success or error — is what
//! the client sees. Vendor wire-format conversion is out of scope.

pub mod open_ai;

use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use http::StatusCode;
use regex::Regex;
use serde_json::Value;
use thiserror::Error;

use crate::{
    config::{ConfigError, ProvidersConfig},
    observability::metrics,
    resilience::CircuitBreaker,
};

/// Errors reaching an upstream. Provider-returned HTTP errors are NOT here:
/// they pass through verbatim as an [`UpstreamReply`] with the original
/// status.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("no provider is configured for model '{0}'")]
    NoRoute(String),

    #[error("provider circuit breaker is open")]
    CircuitOpen,
}

/// What came back from upstream.
pub enum UpstreamReply {
    /// Buffered JSON response (success or provider error, verbatim).
    Json { status: StatusCode, body: Bytes },
    /// Streaming SSE body.
    Stream {
        status: StatusCode,
        body: BoxStream<'static, Result<Bytes, std::io::Error>>,
    },
}

impl UpstreamReply {
    pub fn status(&self) -> StatusCode {
        match self {
            UpstreamReply::Json { status, .. } => *status,
            UpstreamReply::Stream { status, .. } => *status,
        }
    }
}

/// A single upstream.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Forward a chat completion request. `raw` is the request body exactly
    /// as received.
    async fn chat_completion(&self, raw: &Value, stream: bool)
    -> Result<UpstreamReply, ProviderError>;
}

struct Route {
    patterns: Vec<Regex>,
    provider: Arc<dyn Provider>,
}

/// Model-pattern dispatch across configured upstreams.
pub struct ProviderRegistry {
    routes: Vec<Route>,
    fallback: Option<Arc<dyn Provider>>,
    breaker: Arc<CircuitBreaker>,
}

impl ProviderRegistry {
    pub fn from_config(
        config: &ProvidersConfig,
        breaker: Arc<CircuitBreaker>,
    ) -> Result<Self, ConfigError> {
        let mut routes = Vec::new();
        for upstream in &config.upstreams {
            let patterns = upstream
                .model_patterns
                .iter()
                .map(|p| Regex::new(p))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| ConfigError::Validation(e.to_string()))?;
            routes.push(Route {
                patterns,
                provider: Arc::new(open_ai::OpenAiUpstream::from_config(upstream)),
            });
        }

        let fallback: Option<Arc<dyn Provider>> = if config.test_fallback {
            #[cfg(feature = "provider-test")]
            {
                Some(Arc::new(test::TestProvider::new()))
            }
            #[cfg(not(feature = "provider-test"))]
            {
                tracing::warn!(
                    "providers.test_fallback is set but the 'provider-test' feature is not \
                     compiled; requests without a matching upstream will fail"
                );
                None
            }
        } else {
            None
        };

        Ok(Self {
            routes,
            fallback,
            breaker,
        })
    }

    /// Build a registry around a single provider. Test support.
    pub fn single(provider: Arc<dyn Provider>, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            routes: Vec::new(),
            fallback: Some(provider),
            breaker,
        }
    }

    fn route(&self, model: &str) -> Option<Arc<dyn Provider>> {
        for route in &self.routes {
            if route.patterns.iter().any(|p| p.is_match(model)) {
                return Some(Arc::clone(&route.provider));
            }
        }
        self.fallback.clone()
    }

    /// Forward a request to the provider serving `model`, under the provider
    /// circuit breaker. Transport failures and 5xx responses feed the
    /// breaker; everything the provider returns still passes through.
    pub async fn forward(
        &self,
        model: &str,
        raw: &Value,
        stream: bool,
    ) -> Result<UpstreamReply, ProviderError> {
        let provider = self
            .route(model)
            .ok_or_else(|| ProviderError::NoRoute(model.to_string()))?;

        if self.breaker.try_acquire().is_err() {
            metrics::record_upstream_forward(provider.name(), "circuit_open");
            return Err(ProviderError::CircuitOpen);
        }

        let start = Instant::now();
        match provider.chat_completion(raw, stream).await {
            Ok(reply) => {
                if reply.status().is_server_error() {
                    self.breaker.record_failure(start.elapsed());
                    metrics::record_upstream_forward(provider.name(), "server_error");
                } else {
                    self.breaker.record_success(start.elapsed());
                    metrics::record_upstream_forward(provider.name(), "ok");
                }
                Ok(reply)
            }
            Err(e) => {
                self.breaker.record_failure(start.elapsed());
                metrics::record_upstream_forward(provider.name(), "transport_error");
                Err(e)
            }
        }
    }
}
