//! The indexed (template-match) tier.
//!
//! A persistent table of cache entries searchable three ways: by unique
//! `(tenant, exact_key)`, by SimHash Hamming window, and by approximate
//! nearest neighbour over the embedding. Implementations: Postgres with
//! pgvector for production, an in-memory store for dev and tests.

pub mod memory;
#[cfg(feature = "database-postgres")]
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::error::CacheResult;
use crate::fingerprint::{RequestMode, TemperatureBucket};

/// A persisted cache entry as read back from the index. The embedding is
/// write-only: it is stored and indexed but never rehydrated, similarity is
/// computed store-side.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub id: Uuid,
    pub tenant: String,
    pub exact_key: String,
    pub simhash: i64,
    /// Masked prompt template.
    pub canonical_prompt: String,
    pub raw_prompt_hmac: String,
    pub request_blob: serde_json::Value,
    pub response_blob: serde_json::Value,
    pub model: String,
    pub temperature_bucket: TemperatureBucket,
    pub mode: RequestMode,
    pub tool_schema_hash: String,
    pub hit_count: i64,
    pub last_hit_at: Option<DateTime<Utc>>,
    pub is_golden: bool,
    pub pii_present: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whether the entry has passed its expiry. Golden entries never expire.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        !self.is_golden && self.expires_at.is_some_and(|exp| exp < now)
    }

    /// Age in whole seconds at `now`.
    pub fn age_seconds(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds().max(0)
    }
}

/// A new entry to persist.
#[derive(Debug, Clone)]
pub struct NewCacheEntry {
    pub tenant: String,
    pub exact_key: String,
    pub simhash: i64,
    pub embedding: Vec<f32>,
    pub canonical_prompt: String,
    pub raw_prompt_hmac: String,
    pub request_blob: serde_json::Value,
    pub response_blob: serde_json::Value,
    pub model: String,
    pub temperature_bucket: TemperatureBucket,
    pub mode: RequestMode,
    pub tool_schema_hash: String,
    pub pii_present: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A candidate returned from the index with its distances to the request.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub entry: CacheEntry,
    /// SimHash Hamming distance to the request.
    pub hamming: u32,
    /// Cosine similarity to the request embedding, when one was supplied.
    pub cosine_similarity: Option<f64>,
}

/// Model restriction for candidate retrieval; guardrails re-check afterwards.
#[derive(Debug, Clone, Copy)]
pub enum ModelFilter<'a> {
    /// Exact model string.
    Exact(&'a str),
    /// Model family prefix (family is a prefix of the full model name).
    FamilyPrefix(&'a str),
    /// No restriction.
    Any,
}

/// Parameters for a candidate fetch.
#[derive(Debug, Clone)]
pub struct CandidateQuery<'a> {
    pub tenant: &'a str,
    pub mode: RequestMode,
    pub model_filter: ModelFilter<'a>,
    pub simhash: i64,
    pub max_hamming: u32,
    /// Request embedding for the ANN leg; None skips it.
    pub embedding: Option<&'a [f32]>,
    pub ann_top_k: u32,
    /// Overall candidate cap.
    pub limit: u32,
}

/// Aggregate counters for the stats endpoint.
#[derive(Debug, Clone, Default)]
pub struct IndexStats {
    pub entries: u64,
    pub golden_entries: u64,
}

/// The indexed tier contract.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert an entry. Best effort: a duplicate `(tenant, exact_key)` is
    /// ignored silently.
    async fn insert(&self, entry: NewCacheEntry) -> CacheResult<()>;

    /// Fetch candidates: the Hamming window (ordered by distance, then
    /// hit count) unioned with up to `ann_top_k` nearest neighbours by
    /// embedding cosine distance. Expired entries are excluded.
    async fn fetch_candidates(&self, query: CandidateQuery<'_>) -> CacheResult<Vec<Candidate>>;

    /// Bump `hit_count` and `last_hit_at`. Losing an update under failure is
    /// acceptable.
    async fn record_hit(&self, id: Uuid) -> CacheResult<()>;

    /// Same as [`record_hit`](Self::record_hit), addressed by the unique
    /// `(tenant, exact_key)` pair. Used for hot-tier hits, where the row id
    /// is not at hand.
    async fn record_hit_by_exact(&self, tenant: &str, exact_key: &str) -> CacheResult<()>;

    /// Pin or unpin an entry. Pinning nulls `expires_at`; unpinning restores
    /// the supplied expiry. Returns false when the entry does not exist.
    async fn set_golden(
        &self,
        id: Uuid,
        golden: bool,
        restored_expiry: Option<DateTime<Utc>>,
    ) -> CacheResult<bool>;

    /// Hard-delete expired non-golden rows, up to `batch` of them. Returns
    /// the number deleted.
    async fn delete_expired(&self, batch: u32) -> CacheResult<u64>;

    /// Delete all entries for a tenant, or everything when None. Returns the
    /// number deleted.
    async fn clear(&self, tenant: Option<&str>) -> CacheResult<u64>;

    /// Aggregate counters.
    async fn stats(&self) -> CacheResult<IndexStats>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> CacheResult<()>;
}
