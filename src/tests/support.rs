//! Shared fixtures for the end-to-end tests.

use std::sync::Arc;

use serde_json::{Value, json};

#[cfg(feature = "provider-test")]
use crate::{
    config::ProxyConfig,
    providers::{Provider, ProviderRegistry, test::TestProvider},
    state::AppState,
};
use crate::{
    cache::{CacheEngine, MemoryHotStore, index::memory::MemoryIndexStore},
    config::{MemoryHotTierConfig, ResilienceConfig, TemplateCacheConfig, TtlConfig},
    embedding::{Embedder, EmbeddingError, HashedEmbedder, l2_normalize},
    resilience::BreakerRegistry,
};

/// Embedder double with hand-placed vectors per substring, falling back to
/// the lexical hashed embedder. Lets tests dictate semantic similarity the
/// way a real embedding model would see it (e.g. two different article URLs
/// are far apart even though the text barely differs).
pub struct StubEmbedder {
    routes: Vec<(String, Vec<f32>)>,
    fallback: HashedEmbedder,
    dimensions: usize,
}

impl StubEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            routes: Vec::new(),
            fallback: HashedEmbedder::new(dimensions),
            dimensions,
        }
    }

    /// Texts containing `needle` embed to `vector` (normalized here).
    pub fn map(mut self, needle: &str, mut vector: Vec<f32>) -> Self {
        assert_eq!(vector.len(), self.dimensions);
        l2_normalize(&mut vector);
        self.routes.push((needle.to_string(), vector));
        self
    }
}

#[async_trait::async_trait]
impl Embedder for StubEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        for (needle, vector) in &self.routes {
            if text.contains(needle.as_str()) {
                return Ok(vector.clone());
            }
        }
        self.fallback.embed(text).await
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Embedder that always fails, for degradation tests.
pub struct FailingEmbedder;

#[async_trait::async_trait]
impl Embedder for FailingEmbedder {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
        Err(EmbeddingError::EmptyResponse)
    }

    fn dimensions(&self) -> usize {
        4
    }
}

/// Build an engine over fresh in-memory tiers.
pub fn engine_with(embedder: Arc<dyn Embedder>, ttl: TtlConfig) -> Arc<CacheEngine> {
    engine_with_stores(
        Arc::new(MemoryHotStore::new(&MemoryHotTierConfig::default())),
        Arc::new(MemoryIndexStore::new()),
        embedder,
        ttl,
    )
}

/// Build an engine over caller-supplied tiers, so tests can share stores
/// between engines or inject failing ones.
pub fn engine_with_stores(
    hot: Arc<dyn crate::cache::HotStore>,
    index: Arc<dyn crate::cache::index::IndexStore>,
    embedder: Arc<dyn Embedder>,
    ttl: TtlConfig,
) -> Arc<CacheEngine> {
    let breakers = Arc::new(BreakerRegistry::new(&ResilienceConfig::default()));
    Arc::new(CacheEngine::new(
        hot,
        index,
        embedder,
        breakers,
        TemplateCacheConfig::default(),
        ttl,
        &ResilienceConfig::default(),
    ))
}

/// Hot store whose every operation fails, standing in for a dead Redis.
pub struct FailingHotStore;

#[async_trait::async_trait]
impl crate::cache::HotStore for FailingHotStore {
    async fn get(&self, _: &str, _: &str) -> crate::cache::CacheResult<Option<Vec<u8>>> {
        Err(crate::cache::CacheError::Connection("hot tier down".into()))
    }

    async fn set(
        &self,
        _: &str,
        _: &str,
        _: &[u8],
        _: std::time::Duration,
    ) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Connection("hot tier down".into()))
    }

    async fn delete(&self, _: &str, _: &str) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Connection("hot tier down".into()))
    }

    async fn clear(&self, _: Option<&str>) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Connection("hot tier down".into()))
    }

    async fn entry_count(&self) -> crate::cache::CacheResult<u64> {
        Err(crate::cache::CacheError::Connection("hot tier down".into()))
    }

    async fn ping(&self) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Connection("hot tier down".into()))
    }
}

/// Index store whose every operation fails, standing in for a dead database.
pub struct FailingIndexStore;

#[async_trait::async_trait]
impl crate::cache::index::IndexStore for FailingIndexStore {
    async fn insert(
        &self,
        _: crate::cache::index::NewCacheEntry,
    ) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn fetch_candidates(
        &self,
        _: crate::cache::index::CandidateQuery<'_>,
    ) -> crate::cache::CacheResult<Vec<crate::cache::index::Candidate>> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn record_hit(&self, _: uuid::Uuid) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn record_hit_by_exact(&self, _: &str, _: &str) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn set_golden(
        &self,
        _: uuid::Uuid,
        _: bool,
        _: Option<chrono::DateTime<chrono::Utc>>,
    ) -> crate::cache::CacheResult<bool> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn delete_expired(&self, _: u32) -> crate::cache::CacheResult<u64> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn clear(&self, _: Option<&str>) -> crate::cache::CacheResult<u64> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn stats(&self) -> crate::cache::CacheResult<crate::cache::index::IndexStats> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }

    async fn ping(&self) -> crate::cache::CacheResult<()> {
        Err(crate::cache::CacheError::Database("index tier down".into()))
    }
}

/// Full app state around an engine and a single test provider.
#[cfg(feature = "provider-test")]
pub fn state_with(engine: Arc<CacheEngine>, provider: Arc<TestProvider>) -> AppState {
    let breakers = BreakerRegistry::new(&ResilienceConfig::default());
    let registry = Arc::new(ProviderRegistry::single(
        provider as Arc<dyn Provider>,
        breakers.provider,
    ));
    AppState {
        engine,
        providers: registry,
        config: Arc::new(ProxyConfig::default()),
    }
}

/// Minimal chat request body.
pub fn chat_request(model: &str, content: &str) -> Value {
    json!({
        "model": model,
        "messages": [{"role": "user", "content": content}],
    })
}

/// Poll until `check` returns true or the timeout elapses.
pub async fn wait_until<F>(what: &str, mut check: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
