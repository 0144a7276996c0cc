//! OpenAI-compatible upstream forwarder.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use serde_json::Value;

use super::{Provider, ProviderError, UpstreamReply};
use crate::config::UpstreamConfig;

pub struct OpenAiUpstream {
    name: String,
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl OpenAiUpstream {
    pub fn from_config(config: &UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok());
        Self {
            name: config.name.clone(),
            client,
            endpoint: format!(
                "{}/chat/completions",
                config.base_url.trim_end_matches('/')
            ),
            api_key,
        }
    }
}

#[async_trait]
impl Provider for OpenAiUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat_completion(
        &self,
        raw: &Value,
        stream: bool,
    ) -> Result<UpstreamReply, ProviderError> {
        let mut builder = self.client.post(&self.endpoint).json(raw);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder.send().await?;
        let status = response.status();

        if stream && status.is_success() {
            let body = response
                .bytes_stream()
                .map_err(std::io::Error::other)
                .boxed();
            Ok(UpstreamReply::Stream { status, body })
        } else {
            // Error bodies are buffered even for streaming requests so they
            // pass through verbatim with their status.
            let body = response.bytes().await?;
            Ok(UpstreamReply::Json { status, body })
        }
    }
}
