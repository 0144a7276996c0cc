use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// Hot (exact-match) tier configuration.
///
/// The hot tier stores compressed response blobs keyed by `(tenant,
/// exact_key)`. The in-memory variant is suitable for single-node
/// deployments; Redis is required for multi-node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum HotTierConfig {
    /// In-memory store with approximate-LFU eviction.
    Memory(MemoryHotTierConfig),

    /// Redis-backed store.
    Redis(RedisHotTierConfig),
}

impl Default for HotTierConfig {
    fn default() -> Self {
        HotTierConfig::Memory(MemoryHotTierConfig::default())
    }
}

impl HotTierConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            HotTierConfig::Memory(c) => c.validate(),
            HotTierConfig::Redis(c) => c.validate(),
        }
    }
}

/// In-memory hot tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MemoryHotTierConfig {
    /// Maximum number of entries before eviction kicks in.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Number of random entries sampled per eviction round. Larger samples
    /// approximate true LFU more closely at higher cost.
    #[serde(default = "default_eviction_sample")]
    pub eviction_sample_size: usize,
}

impl Default for MemoryHotTierConfig {
    fn default() -> Self {
        Self {
            max_entries: default_max_entries(),
            eviction_sample_size: default_eviction_sample(),
        }
    }
}

impl MemoryHotTierConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::Validation(
                "hot_tier.max_entries must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Redis hot tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RedisHotTierConfig {
    /// Redis connection URL: `redis://[user:password@]host:port[/db]`.
    pub url: String,

    /// Key prefix for all cache keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Per-command timeout in seconds.
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

impl RedisHotTierConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation("hot_tier.url must not be empty".into()));
        }
        Ok(())
    }
}

fn default_max_entries() -> usize {
    100_000
}

fn default_eviction_sample() -> usize {
    16
}

fn default_key_prefix() -> String {
    "mn:".to_string()
}

fn default_command_timeout() -> u64 {
    5
}

/// Indexed (template-match) tier configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum IndexTierConfig {
    /// In-memory index. Dev and tests only; lost on restart.
    #[default]
    Memory,

    /// Postgres with the pgvector extension.
    #[cfg(feature = "database-postgres")]
    Postgres(PostgresIndexConfig),
}

impl IndexTierConfig {
    pub(super) fn validate(&self) -> Result<(), ConfigError> {
        match self {
            IndexTierConfig::Memory => Ok(()),
            #[cfg(feature = "database-postgres")]
            IndexTierConfig::Postgres(c) => c.validate(),
        }
    }
}

/// Postgres indexed tier configuration.
#[cfg(feature = "database-postgres")]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PostgresIndexConfig {
    /// Connection URL.
    pub url: String,

    /// Table name for cache entries.
    #[serde(default = "default_table_name")]
    pub table_name: String,

    /// Maximum connections in the pool.
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Per-statement timeout in seconds.
    #[serde(default = "default_statement_timeout")]
    pub statement_timeout_secs: u64,

    /// IVFFlat cluster count for the embedding index.
    #[serde(default = "default_ivf_lists")]
    pub ivf_lists: u32,
}

#[cfg(feature = "database-postgres")]
impl PostgresIndexConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.url.is_empty() {
            return Err(ConfigError::Validation("index_tier.url must not be empty".into()));
        }
        Ok(())
    }
}

#[cfg(feature = "database-postgres")]
fn default_table_name() -> String {
    "cache_entries".to_string()
}

#[cfg(feature = "database-postgres")]
fn default_max_connections() -> u32 {
    10
}

#[cfg(feature = "database-postgres")]
fn default_statement_timeout() -> u64 {
    10
}

#[cfg(feature = "database-postgres")]
fn default_ivf_lists() -> u32 {
    100
}

/// Entry TTL settings.
///
/// TTLs are keyed by model family (the model name with date/version suffixes
/// stripped), falling back to `default_secs`. Golden entries never expire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TtlConfig {
    /// Default TTL in seconds.
    #[serde(default = "default_ttl")]
    pub default_secs: u64,

    /// Per-model-family overrides, e.g. `{ "gpt-4" = 7200 }`.
    #[serde(default)]
    pub per_family: HashMap<String, u64>,
}

impl Default for TtlConfig {
    fn default() -> Self {
        Self {
            default_secs: default_ttl(),
            per_family: HashMap::new(),
        }
    }
}

impl TtlConfig {
    /// Resolve the TTL for a model family.
    pub fn for_family(&self, family: &str) -> Duration {
        let secs = self.per_family.get(family).copied().unwrap_or(self.default_secs);
        Duration::from_secs(secs)
    }
}

fn default_ttl() -> u64 {
    86_400 // 24 hours
}

/// Expired-entry sweep job configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SweepConfig {
    /// Whether the sweep job runs at all.
    #[serde(default = "default_sweep_enabled")]
    pub enabled: bool,

    /// Seconds between sweep runs.
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,

    /// Maximum rows deleted per run.
    #[serde(default = "default_sweep_batch")]
    pub batch_size: u32,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            enabled: default_sweep_enabled(),
            interval_secs: default_sweep_interval(),
            batch_size: default_sweep_batch(),
        }
    }
}

fn default_sweep_enabled() -> bool {
    true
}

fn default_sweep_interval() -> u64 {
    300
}

fn default_sweep_batch() -> u32 {
    1000
}
