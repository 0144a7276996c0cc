use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Circuit breaker settings for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerSettings {
    /// Sliding window size in sampled calls.
    #[serde(default = "default_window")]
    pub window_size: usize,

    /// Minimum sampled calls before the failure rate is evaluated.
    #[serde(default = "default_min_calls")]
    pub min_calls: usize,

    /// Failure rate (0..1) over the window that opens the circuit.
    pub failure_rate_threshold: f64,

    /// Calls slower than this count as slow.
    #[serde(default = "default_slow_call_secs")]
    pub slow_call_secs: f64,

    /// Slow-call rate (0..1) over the window that opens the circuit.
    #[serde(default = "default_slow_rate")]
    pub slow_rate_threshold: f64,

    /// Seconds the circuit stays open before probing.
    pub open_wait_secs: u64,

    /// Trial calls permitted while half-open.
    #[serde(default = "default_half_open_trials")]
    pub half_open_trials: u32,
}

impl BreakerSettings {
    fn new(failure_rate_threshold: f64, open_wait_secs: u64) -> Self {
        Self {
            window_size: default_window(),
            min_calls: default_min_calls(),
            failure_rate_threshold,
            slow_call_secs: default_slow_call_secs(),
            slow_rate_threshold: default_slow_rate(),
            open_wait_secs,
            half_open_trials: default_half_open_trials(),
        }
    }

    pub fn open_wait(&self) -> Duration {
        Duration::from_secs(self.open_wait_secs)
    }
}

/// Per-dependency circuit breaker configuration and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Hot tier breaker (50% failure rate, 10 s open wait).
    #[serde(default = "default_hot")]
    pub hot: BreakerSettings,

    /// Indexed tier breaker (50% failure rate, 30 s open wait).
    #[serde(default = "default_indexed")]
    pub indexed: BreakerSettings,

    /// Embedder breaker (50% failure rate, 30 s open wait).
    #[serde(default = "default_embedder")]
    pub embedder: BreakerSettings,

    /// Upstream provider breaker (80% failure rate, 60 s open wait).
    #[serde(default = "default_provider")]
    pub provider: BreakerSettings,

    /// Hot tier command timeout in seconds.
    #[serde(default = "default_hot_timeout")]
    pub hot_timeout_secs: u64,

    /// Indexed tier statement timeout in seconds.
    #[serde(default = "default_indexed_timeout")]
    pub indexed_timeout_secs: u64,

    /// Embedder call timeout in seconds.
    #[serde(default = "default_embedder_timeout")]
    pub embedder_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            hot: default_hot(),
            indexed: default_indexed(),
            embedder: default_embedder(),
            provider: default_provider(),
            hot_timeout_secs: default_hot_timeout(),
            indexed_timeout_secs: default_indexed_timeout(),
            embedder_timeout_secs: default_embedder_timeout(),
        }
    }
}

impl ResilienceConfig {
    pub fn hot_timeout(&self) -> Duration {
        Duration::from_secs(self.hot_timeout_secs)
    }

    pub fn indexed_timeout(&self) -> Duration {
        Duration::from_secs(self.indexed_timeout_secs)
    }

    pub fn embedder_timeout(&self) -> Duration {
        Duration::from_secs(self.embedder_timeout_secs)
    }
}

fn default_hot() -> BreakerSettings {
    BreakerSettings::new(0.5, 10)
}

fn default_indexed() -> BreakerSettings {
    BreakerSettings::new(0.5, 30)
}

fn default_embedder() -> BreakerSettings {
    BreakerSettings::new(0.5, 30)
}

fn default_provider() -> BreakerSettings {
    BreakerSettings::new(0.8, 60)
}

fn default_window() -> usize {
    50
}

fn default_min_calls() -> usize {
    10
}

fn default_slow_call_secs() -> f64 {
    2.0
}

fn default_slow_rate() -> f64 {
    0.5
}

fn default_half_open_trials() -> u32 {
    5
}

fn default_hot_timeout() -> u64 {
    5
}

fn default_indexed_timeout() -> u64 {
    10
}

fn default_embedder_timeout() -> u64 {
    2
}
