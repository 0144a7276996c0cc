use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Upstream provider configuration.
///
/// Requests are dispatched to the first upstream whose `model_patterns`
/// matches the request's model name. Wire-format conversion for non-OpenAI
/// vendors is out of scope; every upstream speaks the OpenAI chat schema.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
    /// Ordered list of upstreams; first pattern match wins.
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,

    /// Fall back to the in-process test provider when no pattern matches.
    /// Requires the `provider-test` feature; useful for local development.
    #[serde(default)]
    pub test_fallback: bool,
}

impl ProvidersConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        for upstream in &self.upstreams {
            upstream.validate()?;
        }
        Ok(())
    }
}

/// A single OpenAI-compatible upstream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpstreamConfig {
    /// Display name, used in logs and provenance.
    pub name: String,

    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// Environment variable holding the API key. Optional for keyless
    /// gateways.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Model-name regexes this upstream serves, e.g. `["^gpt-", "^o[134]"]`.
    pub model_patterns: Vec<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_upstream_timeout")]
    pub timeout_secs: u64,
}

impl UpstreamConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Validation("provider name must not be empty".into()));
        }
        if self.base_url.is_empty() {
            return Err(ConfigError::Validation(format!(
                "provider '{}' base_url must not be empty",
                self.name
            )));
        }
        if self.model_patterns.is_empty() {
            return Err(ConfigError::Validation(format!(
                "provider '{}' must declare at least one model pattern",
                self.name
            )));
        }
        for pattern in &self.model_patterns {
            regex::Regex::new(pattern).map_err(|e| {
                ConfigError::Validation(format!(
                    "provider '{}' pattern '{}' is not a valid regex: {}",
                    self.name, pattern, e
                ))
            })?;
        }
        Ok(())
    }
}

fn default_upstream_timeout() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_pattern_rejected() {
        let config = ProvidersConfig {
            upstreams: vec![UpstreamConfig {
                name: "openai".to_string(),
                base_url: "https://api.openai.com/v1".to_string(),
                api_key_env: None,
                model_patterns: vec!["(".to_string()],
                timeout_secs: 60,
            }],
            test_fallback: false,
        };
        assert!(config.validate().is_err());
    }
}
