//! The two-tier cache engine.
//!
//! # Lookup
//!
//! Exact first: a compressed envelope keyed by `(tenant, exact_key)` in the
//! hot tier, served with score 1.0. Template second: hybrid candidate
//! retrieval from the indexed tier (SimHash Hamming window unioned with ANN
//! cosine neighbours), guardrails, composite scoring, threshold admission.
//!
//! # Write-through
//!
//! Best effort and asynchronous: the client response is never blocked on
//! cache writes, duplicate exact keys are ignored silently, and failures
//! only feed the breakers and counters.
//!
//! Every store and embedder round-trip is wrapped in its dependency's
//! circuit breaker and timeout; an open breaker degrades the lookup rather
//! than failing the request.

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    compress,
    error::CacheError,
    index::{CandidateQuery, IndexStats, IndexStore, ModelFilter, NewCacheEntry},
    scorer::{self, GuardContext, ScoreInputs},
    traits::HotStore,
};
use crate::{
    api_types::{CreateChatCompletionPayload, ResponseFormat},
    canonical::{self, CanonicalRequest},
    config::{ModelCompatPolicy, ResilienceConfig, TemplateCacheConfig, TtlConfig},
    embedding::Embedder,
    fingerprint::Fingerprint,
    observability::metrics,
    resilience::{BreakerRegistry, CircuitBreaker, DegradationMode},
};

/// Which tiers a request may consult, from the `x-cache-mode` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LookupTiers {
    ExactOnly,
    TemplateOnly,
    #[default]
    Both,
}

impl LookupTiers {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "exact" => Some(LookupTiers::ExactOnly),
            "template" => Some(LookupTiers::TemplateOnly),
            "both" => Some(LookupTiers::Both),
            _ => None,
        }
    }

    fn permits_exact(&self) -> bool {
        matches!(self, LookupTiers::ExactOnly | LookupTiers::Both)
    }

    fn permits_template(&self) -> bool {
        matches!(self, LookupTiers::TemplateOnly | LookupTiers::Both)
    }
}

/// Per-request cache controls parsed from `x-cache-*` headers.
#[derive(Debug, Clone)]
pub struct CacheDirectives {
    /// `x-cache-bypass`: skip lookup, force a miss.
    pub bypass: bool,
    /// `x-cache-store`: false skips write-through for this response.
    pub store: bool,
    /// `x-cache-mode`: restrict lookup tiers.
    pub tiers: LookupTiers,
    /// `x-model-compat`: override the model guardrail policy.
    pub model_compat: Option<ModelCompatPolicy>,
    /// `x-cache-experiment`: opaque tag for downstream analysis.
    pub experiment: Option<String>,
}

impl Default for CacheDirectives {
    fn default() -> Self {
        Self {
            bypass: false,
            store: true,
            tiers: LookupTiers::Both,
            model_compat: None,
            experiment: None,
        }
    }
}

/// How a hit was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Template,
}

impl MatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchKind::Exact => "exact",
            MatchKind::Template => "template",
        }
    }
}

/// Provenance stamped on every response.
#[derive(Debug, Clone)]
pub struct Provenance {
    pub hit: bool,
    pub match_kind: Option<MatchKind>,
    pub score: f64,
    pub entry_id: Option<Uuid>,
    pub source_model: Option<String>,
    pub age_seconds: i64,
    pub degradation: DegradationMode,
}

impl Provenance {
    fn miss(degradation: DegradationMode) -> Self {
        Self {
            hit: false,
            match_kind: None,
            score: 0.0,
            entry_id: None,
            source_model: None,
            age_seconds: 0,
            degradation,
        }
    }
}

/// A served cache hit.
#[derive(Debug, Clone)]
pub struct CacheHit {
    /// The full non-streaming response blob.
    pub response: Value,
    /// Seed source for deterministic replay: the entry's exact key.
    pub replay_key: String,
    pub provenance: Provenance,
}

/// Outcome of a lookup.
#[derive(Debug)]
pub enum LookupOutcome {
    Hit(Box<CacheHit>),
    Miss { degradation: DegradationMode },
}

/// Everything derived from one request, computed once and shared between
/// lookup and write-through.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub tenant: String,
    pub model: String,
    pub canonical: CanonicalRequest,
    pub fingerprint: Fingerprint,
    /// Filled lazily by the lookup path; reused by write-through.
    pub embedding: Option<Vec<f32>>,
    /// The request's JSON schema when in JSON_SCHEMA mode.
    pub json_schema: Option<Value>,
    pub raw_request: Value,
}

/// Envelope stored in the hot tier: the response plus enough metadata for
/// provenance and replay seeding.
#[derive(Debug, Serialize, Deserialize)]
struct HotEnvelope {
    exact_key: String,
    model: String,
    cached_at: i64,
    response: Value,
}

/// Running counters for the stats endpoint.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub exact_hits: AtomicU64,
    pub template_hits: AtomicU64,
    pub misses: AtomicU64,
    pub bypasses: AtomicU64,
    pub write_errors: AtomicU64,
}

/// Snapshot of engine state for `/v1/cache/stats`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub exact_hits: u64,
    pub template_hits: u64,
    pub misses: u64,
    pub bypasses: u64,
    pub write_errors: u64,
    pub hot_entries: Option<u64>,
    pub index_entries: Option<u64>,
    pub golden_entries: Option<u64>,
    pub degradation: DegradationMode,
}

pub struct CacheEngine {
    hot: Arc<dyn HotStore>,
    index: Arc<dyn IndexStore>,
    embedder: Arc<dyn Embedder>,
    breakers: Arc<BreakerRegistry>,
    template: TemplateCacheConfig,
    ttl: TtlConfig,
    hot_timeout: Duration,
    indexed_timeout: Duration,
    embedder_timeout: Duration,
    digest_secret: Option<Vec<u8>>,
    counters: EngineCounters,
    /// Tracks fire-and-forget write-through and hit-stat tasks so shutdown
    /// can drain them instead of dropping in-flight cache writes.
    tasks: TaskTracker,
}

impl CacheEngine {
    pub fn new(
        hot: Arc<dyn HotStore>,
        index: Arc<dyn IndexStore>,
        embedder: Arc<dyn Embedder>,
        breakers: Arc<BreakerRegistry>,
        template: TemplateCacheConfig,
        ttl: TtlConfig,
        resilience: &ResilienceConfig,
    ) -> Self {
        let digest_secret = template
            .digest_secret_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .map(String::into_bytes);
        Self {
            hot,
            index,
            embedder,
            breakers,
            template,
            ttl,
            hot_timeout: resilience.hot_timeout(),
            indexed_timeout: resilience.indexed_timeout(),
            embedder_timeout: resilience.embedder_timeout(),
            digest_secret,
            counters: EngineCounters::default(),
            tasks: TaskTracker::new(),
        }
    }

    /// Canonicalize and fingerprint a request. Pure CPU; no suspension.
    pub fn prepare(
        &self,
        tenant: String,
        raw: Value,
        payload: &CreateChatCompletionPayload,
    ) -> RequestContext {
        let canonical = canonical::canonicalize(&raw, payload, self.digest_secret.as_deref());
        let fingerprint = Fingerprint::derive(payload, &canonical);
        let json_schema = match &payload.response_format {
            Some(ResponseFormat::JsonSchema { json_schema }) => json_schema.schema.clone(),
            _ => None,
        };
        RequestContext {
            tenant,
            model: payload.model.clone(),
            canonical,
            fingerprint,
            embedding: None,
            json_schema,
            raw_request: raw,
        }
    }

    /// Look up a cached response: exact tier, then template tier.
    pub async fn lookup(
        &self,
        ctx: &mut RequestContext,
        directives: &CacheDirectives,
    ) -> LookupOutcome {
        let degradation = self.breakers.degradation();

        if directives.bypass {
            self.counters.bypasses.fetch_add(1, Ordering::Relaxed);
            metrics::record_cache_lookup("exact", "bypass");
            return LookupOutcome::Miss { degradation };
        }

        if directives.tiers.permits_exact()
            && let Some(hit) = self.lookup_exact(ctx, degradation).await
        {
            self.counters.exact_hits.fetch_add(1, Ordering::Relaxed);
            return LookupOutcome::Hit(Box::new(hit));
        }

        if directives.tiers.permits_template()
            && self.template.enabled
            && let Some(hit) = self.lookup_template(ctx, directives, degradation).await
        {
            self.counters.template_hits.fetch_add(1, Ordering::Relaxed);
            return LookupOutcome::Hit(Box::new(hit));
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        LookupOutcome::Miss { degradation }
    }

    async fn lookup_exact(
        &self,
        ctx: &RequestContext,
        degradation: DegradationMode,
    ) -> Option<CacheHit> {
        let blob = guarded(
            &self.breakers.hot,
            self.hot_timeout,
            self.hot.get(&ctx.tenant, &ctx.canonical.exact_key),
        )
        .await;

        let blob = match blob {
            Ok(Some(blob)) => blob,
            Ok(None) => {
                metrics::record_cache_lookup("exact", "miss");
                return None;
            }
            Err(e) => {
                metrics::record_cache_lookup("exact", "error");
                debug!(error = %e, "hot tier lookup failed, continuing to template tier");
                return None;
            }
        };

        let envelope: HotEnvelope = match compress::decompress(&blob)
            .and_then(|bytes| {
                serde_json::from_slice(&bytes)
                    .map_err(|e| CacheError::Deserialization(e.to_string()))
            }) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "corrupt hot tier envelope, dropping entry");
                let _ = self
                    .hot
                    .delete(&ctx.tenant, &ctx.canonical.exact_key)
                    .await;
                return None;
            }
        };

        metrics::record_cache_lookup("exact", "hit");
        let age_seconds = (Utc::now().timestamp() - envelope.cached_at).max(0);

        // Fire-and-forget hit-stat update on the indexed row.
        self.spawn_hit_stats_by_exact(ctx.tenant.clone(), envelope.exact_key.clone());

        Some(CacheHit {
            response: envelope.response,
            replay_key: envelope.exact_key,
            provenance: Provenance {
                hit: true,
                match_kind: Some(MatchKind::Exact),
                score: 1.0,
                entry_id: None,
                source_model: Some(envelope.model),
                age_seconds,
                degradation,
            },
        })
    }

    async fn lookup_template(
        &self,
        ctx: &mut RequestContext,
        directives: &CacheDirectives,
        degradation: DegradationMode,
    ) -> Option<CacheHit> {
        if ctx.embedding.is_none() {
            ctx.embedding = self.embed(&ctx.canonical.prompt_text).await;
        }

        let compat = directives.model_compat.unwrap_or(self.template.model_compat);
        let model_filter = match compat {
            ModelCompatPolicy::Strict => ModelFilter::Exact(&ctx.model),
            ModelCompatPolicy::Family => ModelFilter::FamilyPrefix(&ctx.fingerprint.model_family),
            ModelCompatPolicy::Any => ModelFilter::Any,
        };

        let query = CandidateQuery {
            tenant: &ctx.tenant,
            mode: ctx.fingerprint.mode,
            model_filter,
            simhash: ctx.fingerprint.simhash,
            max_hamming: self.template.max_hamming,
            embedding: ctx.embedding.as_deref(),
            ann_top_k: self.template.ann_top_k,
            limit: self.template.candidate_limit,
        };

        let candidates = match guarded(
            &self.breakers.indexed,
            self.indexed_timeout,
            self.index.fetch_candidates(query),
        )
        .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                metrics::record_cache_lookup("template", "error");
                debug!(error = %e, "indexed tier candidate fetch failed");
                return None;
            }
        };

        let now = Utc::now();
        let guard_ctx = GuardContext {
            mode: ctx.fingerprint.mode,
            tool_schema_hash: &ctx.fingerprint.tool_schema_hash,
            model: &ctx.model,
            model_family: &ctx.fingerprint.model_family,
            compat,
            json_schema: ctx.json_schema.as_ref(),
        };
        let inputs = ScoreInputs {
            temperature_bucket: ctx.fingerprint.temperature_bucket,
            top_p: ctx.fingerprint.top_p,
        };

        let threshold = if ctx.embedding.is_some() {
            self.template.similarity_threshold
        } else {
            self.template.similarity_threshold + scorer::DEGRADED_THRESHOLD_PENALTY
        };

        let mut best: Option<(f64, super::index::Candidate)> = None;
        for candidate in candidates {
            if let Err(rejection) = scorer::enforce_guardrails(&guard_ctx, &candidate, now) {
                metrics::record_guardrail_rejection(rejection.as_str());
                continue;
            }
            let score = scorer::score_candidate(&inputs, &candidate, now);
            if score.composite < threshold {
                continue;
            }
            let replace = match &best {
                None => true,
                Some((best_score, best_candidate)) => {
                    // Tie-break: higher recency, then higher hit count.
                    score.composite > *best_score
                        || (score.composite == *best_score
                            && (candidate.entry.created_at > best_candidate.entry.created_at
                                || (candidate.entry.created_at == best_candidate.entry.created_at
                                    && candidate.entry.hit_count > best_candidate.entry.hit_count)))
                }
            };
            if replace {
                best = Some((score.composite, candidate));
            }
        }

        let (score, candidate) = match best {
            Some(found) => found,
            None => {
                metrics::record_cache_lookup("template", "miss");
                return None;
            }
        };

        metrics::record_cache_lookup("template", "hit");
        metrics::record_hit_score(score);
        debug!(
            entry_id = %candidate.entry.id,
            score,
            hamming = candidate.hamming,
            experiment = directives.experiment.as_deref().unwrap_or(""),
            "template cache hit"
        );

        self.spawn_hit_stats(candidate.entry.id);

        let entry = candidate.entry;
        Some(CacheHit {
            response: entry.response_blob.clone(),
            replay_key: entry.exact_key.clone(),
            provenance: Provenance {
                hit: true,
                match_kind: Some(MatchKind::Template),
                score,
                entry_id: Some(entry.id),
                source_model: Some(entry.model.clone()),
                age_seconds: entry.age_seconds(now),
                degradation,
            },
        })
    }

    /// Embed the raw prompt, breaker- and timeout-guarded. None on any
    /// failure: the template path then scores without the semantic
    /// component.
    async fn embed(&self, prompt: &str) -> Option<Vec<f32>> {
        match guarded(
            &self.breakers.embedder,
            self.embedder_timeout,
            self.embedder.embed(prompt),
        )
        .await
        {
            Ok(embedding) => Some(embedding),
            Err(e) => {
                debug!(error = %e, "embedding unavailable, falling back to structural scoring");
                None
            }
        }
    }

    /// Provenance for a pure miss.
    pub fn miss_provenance(&self) -> Provenance {
        Provenance::miss(self.breakers.degradation())
    }

    /// Queue write-through of an upstream response. Returns immediately; the
    /// client must never wait on cache writes. The task is tracked so
    /// [`drain`](Self::drain) can wait for it at shutdown.
    pub fn spawn_write_through(self: &Arc<Self>, ctx: RequestContext, response: Value) {
        let engine = Arc::clone(self);
        self.tasks.spawn(async move {
            engine.write_through(ctx, response).await;
        });
    }

    /// Write an upstream response through both tiers. This is what the
    /// spawned write-through task runs; tests drive it directly to await the
    /// writes deterministically.
    pub async fn write_through(&self, mut ctx: RequestContext, response: Value) {
        if ctx.embedding.is_none() {
            ctx.embedding = self.embed(&ctx.canonical.prompt_text).await;
        }
        let embedding = match ctx.embedding.clone() {
            Some(embedding) => embedding,
            None => {
                // An entry without an embedding would be unreachable through
                // the ANN leg and unscoreable semantically; skip the indexed
                // tier but keep the exact tier write.
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_write("template", "skipped_no_embedding");
                self.write_hot(&ctx, &response).await;
                return;
            }
        };

        let ttl = self.ttl.for_family(&ctx.fingerprint.model_family);
        let entry = NewCacheEntry {
            tenant: ctx.tenant.clone(),
            exact_key: ctx.canonical.exact_key.clone(),
            simhash: ctx.fingerprint.simhash,
            embedding,
            canonical_prompt: ctx.canonical.masked_prompt.clone(),
            raw_prompt_hmac: ctx.canonical.raw_digest.clone(),
            request_blob: ctx.raw_request.clone(),
            response_blob: response.clone(),
            model: ctx.model.clone(),
            temperature_bucket: ctx.fingerprint.temperature_bucket,
            mode: ctx.fingerprint.mode,
            tool_schema_hash: ctx.fingerprint.tool_schema_hash.clone(),
            pii_present: ctx.canonical.pii_present,
            expires_at: Some(Utc::now() + chrono::Duration::from_std(ttl).unwrap_or_default()),
        };

        match guarded(
            &self.breakers.indexed,
            self.indexed_timeout,
            self.index.insert(entry),
        )
        .await
        {
            Ok(()) => metrics::record_cache_write("template", "success"),
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_write("template", "error");
                warn!(error = %e, "indexed tier write-through failed");
            }
        }

        self.write_hot(&ctx, &response).await;
    }

    async fn write_hot(&self, ctx: &RequestContext, response: &Value) {
        let envelope = HotEnvelope {
            exact_key: ctx.canonical.exact_key.clone(),
            model: ctx.model.clone(),
            cached_at: Utc::now().timestamp(),
            response: response.clone(),
        };
        let bytes = match serde_json::to_vec(&envelope)
            .map_err(|e| CacheError::Serialization(e.to_string()))
            .and_then(|bytes| compress::compress(&bytes))
        {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode hot tier envelope");
                return;
            }
        };

        let ttl = self.ttl.for_family(&ctx.fingerprint.model_family);
        match guarded(
            &self.breakers.hot,
            self.hot_timeout,
            self.hot
                .set(&ctx.tenant, &ctx.canonical.exact_key, &bytes, ttl),
        )
        .await
        {
            Ok(()) => metrics::record_cache_write("exact", "success"),
            Err(e) => {
                self.counters.write_errors.fetch_add(1, Ordering::Relaxed);
                metrics::record_cache_write("exact", "error");
                warn!(error = %e, "hot tier write-through failed");
            }
        }
    }

    fn spawn_hit_stats(&self, id: Uuid) {
        let index = Arc::clone(&self.index);
        self.tasks.spawn(async move {
            if let Err(e) = index.record_hit(id).await {
                debug!(error = %e, entry_id = %id, "hit-stat update failed");
            }
        });
    }

    fn spawn_hit_stats_by_exact(&self, tenant: String, exact_key: String) {
        let index = Arc::clone(&self.index);
        self.tasks.spawn(async move {
            if let Err(e) = index.record_hit_by_exact(&tenant, &exact_key).await {
                debug!(error = %e, "hit-stat update failed");
            }
        });
    }

    /// Wait for all in-flight write-through and hit-stat tasks to finish.
    /// Called once at shutdown, after the HTTP server has stopped accepting
    /// requests.
    pub async fn drain(&self) {
        self.tasks.close();
        self.tasks.wait().await;
    }

    /// Clear both tiers for a tenant (or everything).
    pub async fn clear(&self, tenant: Option<&str>) -> (bool, u64) {
        let hot_ok = self.hot.clear(tenant).await.is_ok();
        let deleted = self.index.clear(tenant).await.unwrap_or(0);
        (hot_ok, deleted)
    }

    /// Pin or unpin an entry. Unpinning restores a fresh default TTL.
    pub async fn set_golden(&self, id: Uuid, golden: bool) -> Result<bool, CacheError> {
        let restored = (!golden).then(|| {
            Utc::now()
                + chrono::Duration::from_std(self.ttl.for_family("")).unwrap_or_default()
        });
        self.index.set_golden(id, golden, restored).await
    }

    /// Stats snapshot. Store round-trips are best effort.
    pub async fn stats(&self) -> EngineStats {
        let hot_entries = self.hot.entry_count().await.ok();
        let index_stats: Option<IndexStats> = self.index.stats().await.ok();
        EngineStats {
            exact_hits: self.counters.exact_hits.load(Ordering::Relaxed),
            template_hits: self.counters.template_hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            bypasses: self.counters.bypasses.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            hot_entries,
            index_entries: index_stats.as_ref().map(|s| s.entries),
            golden_entries: index_stats.map(|s| s.golden_entries),
            degradation: self.breakers.degradation(),
        }
    }

    /// Health probes for the health endpoint.
    pub async fn probe_hot(&self) -> bool {
        self.hot.ping().await.is_ok()
    }

    pub async fn probe_index(&self) -> bool {
        self.index.ping().await.is_ok()
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }
}

/// Run a dependency call under its breaker and timeout. Rejection by an open
/// breaker and timeout expiry both surface as [`CacheError`]s; outcomes feed
/// the breaker's sliding window.
async fn guarded<T, E>(
    breaker: &CircuitBreaker,
    timeout: Duration,
    fut: impl std::future::Future<Output = Result<T, E>>,
) -> Result<T, CacheError>
where
    E: Into<CacheError>,
{
    if breaker.try_acquire().is_err() {
        return Err(CacheError::Connection(format!(
            "circuit breaker '{}' is open",
            breaker.dependency()
        )));
    }

    let start = Instant::now();
    match tokio::time::timeout(timeout, fut).await {
        Ok(Ok(value)) => {
            breaker.record_success(start.elapsed());
            Ok(value)
        }
        Ok(Err(e)) => {
            breaker.record_failure(start.elapsed());
            Err(e.into())
        }
        Err(_) => {
            breaker.record_failure(start.elapsed());
            Err(CacheError::Timeout)
        }
    }
}

/// Embedder calls return [`crate::embedding::EmbeddingError`]; adapt them to
/// the guarded helper's error type.
impl From<crate::embedding::EmbeddingError> for CacheError {
    fn from(e: crate::embedding::EmbeddingError) -> Self {
        CacheError::Connection(e.to_string())
    }
}
