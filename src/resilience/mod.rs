//! Per-dependency circuit breakers and degradation mode selection.

mod breaker;

use std::sync::Arc;

pub use breaker::{CircuitBreaker, CircuitOpenError, CircuitState};
use serde::Serialize;

use crate::config::ResilienceConfig;

/// Operating mode derived from breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DegradationMode {
    /// All dependencies up.
    Full,
    /// Indexed tier down: exact lookups only.
    ExactOnly,
    /// Hot tier down: template lookups only.
    TemplateOnly,
    /// Embedder down: template scoring without the semantic component, with
    /// a raised admission threshold.
    TemplateWithoutSemantic,
    /// Both tiers down: forward everything upstream, cache nothing.
    Passthrough,
}

impl DegradationMode {
    /// Resolve the mode from dependency availability.
    pub fn resolve(hot_up: bool, indexed_up: bool, embedder_up: bool) -> Self {
        match (hot_up, indexed_up) {
            (true, true) if embedder_up => DegradationMode::Full,
            // Embedder down with both tiers up: exact matching is intact and
            // template matching falls back to structural scoring, the same
            // degradation the hot-tier-down row of the matrix prescribes.
            (true, true) => DegradationMode::TemplateWithoutSemantic,
            (true, false) => DegradationMode::ExactOnly,
            (false, true) if embedder_up => DegradationMode::TemplateOnly,
            (false, true) => DegradationMode::TemplateWithoutSemantic,
            (false, false) => DegradationMode::Passthrough,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationMode::Full => "full",
            DegradationMode::ExactOnly => "exact-only",
            DegradationMode::TemplateOnly => "template-only",
            DegradationMode::TemplateWithoutSemantic => "template-without-semantic",
            DegradationMode::Passthrough => "passthrough",
        }
    }

    pub fn is_degraded(&self) -> bool {
        *self != DegradationMode::Full
    }
}

/// The process-wide set of breakers, one per external dependency.
pub struct BreakerRegistry {
    pub hot: Arc<CircuitBreaker>,
    pub indexed: Arc<CircuitBreaker>,
    pub embedder: Arc<CircuitBreaker>,
    pub provider: Arc<CircuitBreaker>,
}

impl BreakerRegistry {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self {
            hot: Arc::new(CircuitBreaker::new("hot_tier", config.hot.clone())),
            indexed: Arc::new(CircuitBreaker::new("index_tier", config.indexed.clone())),
            embedder: Arc::new(CircuitBreaker::new("embedder", config.embedder.clone())),
            provider: Arc::new(CircuitBreaker::new("provider", config.provider.clone())),
        }
    }

    /// Degradation mode from current breaker states.
    pub fn degradation(&self) -> DegradationMode {
        DegradationMode::resolve(
            self.hot.is_up(),
            self.indexed.is_up(),
            self.embedder.is_up(),
        )
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case(true, true, true, DegradationMode::Full)]
    #[case(true, false, true, DegradationMode::ExactOnly)]
    #[case(true, false, false, DegradationMode::ExactOnly)]
    #[case(false, true, true, DegradationMode::TemplateOnly)]
    #[case(false, true, false, DegradationMode::TemplateWithoutSemantic)]
    #[case(false, false, true, DegradationMode::Passthrough)]
    #[case(false, false, false, DegradationMode::Passthrough)]
    fn degradation_matrix(
        #[case] hot: bool,
        #[case] indexed: bool,
        #[case] embedder: bool,
        #[case] expected: DegradationMode,
    ) {
        assert_eq!(DegradationMode::resolve(hot, indexed, embedder), expected);
    }

    #[test]
    fn registry_starts_full() {
        let registry = BreakerRegistry::new(&ResilienceConfig::default());
        assert_eq!(registry.degradation(), DegradationMode::Full);
        assert!(!registry.degradation().is_degraded());
    }
}
