use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Template (approximate) matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TemplateCacheConfig {
    /// Whether template matching is attempted at all. Exact matching is
    /// unaffected.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Composite score admission threshold.
    #[serde(default = "default_threshold")]
    pub similarity_threshold: f64,

    /// Maximum SimHash Hamming distance for the candidate window.
    #[serde(default = "default_max_hamming")]
    pub max_hamming: u32,

    /// Number of ANN neighbours fetched by embedding distance in addition to
    /// the Hamming window.
    #[serde(default = "default_ann_top_k")]
    pub ann_top_k: u32,

    /// Maximum candidates fetched from the indexed tier per lookup.
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: u32,

    /// Default model compatibility policy; overridable per request via the
    /// `x-model-compat` header.
    #[serde(default)]
    pub model_compat: ModelCompatPolicy,

    /// Environment variable holding the keyed-digest secret. When unset, the
    /// raw-prompt digest is a plain SHA-256.
    #[serde(default)]
    pub digest_secret_env: Option<String>,

    /// Embedder configuration.
    #[serde(default)]
    pub embedding: EmbeddingConfig,
}

impl Default for TemplateCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            similarity_threshold: default_threshold(),
            max_hamming: default_max_hamming(),
            ann_top_k: default_ann_top_k(),
            candidate_limit: default_candidate_limit(),
            model_compat: ModelCompatPolicy::default(),
            digest_secret_env: None,
            embedding: EmbeddingConfig::default(),
        }
    }
}

impl TemplateCacheConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(ConfigError::Validation(
                "template.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        if self.max_hamming > 64 {
            return Err(ConfigError::Validation(
                "template.max_hamming must be at most 64".into(),
            ));
        }
        self.embedding.validate()
    }
}

fn default_enabled() -> bool {
    true
}

fn default_threshold() -> f64 {
    0.87
}

fn default_max_hamming() -> u32 {
    6
}

fn default_ann_top_k() -> u32 {
    8
}

fn default_candidate_limit() -> u32 {
    100
}

/// Model compatibility policy for template hits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelCompatPolicy {
    /// Exact model string equality.
    #[default]
    Strict,
    /// Equality after stripping date/version suffixes.
    Family,
    /// Any model matches.
    Any,
}

impl ModelCompatPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "strict" => Some(Self::Strict),
            "family" => Some(Self::Family),
            "any" => Some(Self::Any),
            _ => None,
        }
    }
}

/// Embedder configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum EmbeddingConfig {
    /// OpenAI-compatible `/v1/embeddings` endpoint.
    Openai(OpenAiEmbeddingConfig),

    /// Deterministic in-process embedder. Dev and tests only: it hashes
    /// character n-grams rather than running a real model, so similarity is
    /// lexical, not semantic.
    Hashed(HashedEmbeddingConfig),
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        EmbeddingConfig::Hashed(HashedEmbeddingConfig::default())
    }
}

impl EmbeddingConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        let dimensions = self.dimensions();
        if dimensions == 0 {
            return Err(ConfigError::Validation(
                "template.embedding dimensions must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn dimensions(&self) -> usize {
        match self {
            EmbeddingConfig::Openai(c) => c.dimensions,
            EmbeddingConfig::Hashed(c) => c.dimensions,
        }
    }
}

/// OpenAI-compatible embedding endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OpenAiEmbeddingConfig {
    /// Base URL, e.g. `https://api.openai.com/v1`.
    pub base_url: String,

    /// Embedding model name.
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Vector dimensionality. Must match what the endpoint returns.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,

    /// Environment variable holding the API key.
    #[serde(default)]
    pub api_key_env: Option<String>,

    /// Request timeout in seconds.
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

/// In-process hashed embedder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HashedEmbeddingConfig {
    /// Vector dimensionality.
    #[serde(default = "default_dimensions")]
    pub dimensions: usize,
}

impl Default for HashedEmbeddingConfig {
    fn default() -> Self {
        Self {
            dimensions: default_dimensions(),
        }
    }
}

fn default_embedding_model() -> String {
    "text-embedding-3-small".to_string()
}

fn default_dimensions() -> usize {
    384
}

fn default_embed_timeout() -> u64 {
    2
}
