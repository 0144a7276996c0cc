//! Engine-level scenarios: the literal S1–S5 flows plus TTL and degradation
//! properties, driven through prepare/lookup/write-through directly so the
//! write path can be awaited deterministically.

use std::sync::Arc;

use serde_json::{Value, json};

use super::support::{
    FailingEmbedder, FailingHotStore, FailingIndexStore, StubEmbedder, chat_request,
    engine_with, engine_with_stores,
};
use crate::{
    cache::{CacheDirectives, LookupOutcome, MatchKind, MemoryHotStore, index::memory::MemoryIndexStore},
    config::{MemoryHotTierConfig, ModelCompatPolicy, TtlConfig},
    embedding::Embedder,
};

fn completion(model: &str, content: &str) -> Value {
    json!({
        "id": "chatcmpl-cached",
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
    })
}

fn payload_of(raw: &Value) -> crate::api_types::CreateChatCompletionPayload {
    serde_json::from_value(raw.clone()).unwrap()
}

async fn cache_request(
    engine: &Arc<crate::cache::CacheEngine>,
    raw: &Value,
    response_content: &str,
) {
    let payload = payload_of(raw);
    let ctx = engine.prepare("default".into(), raw.clone(), &payload);
    engine
        .write_through(ctx, completion(&payload.model, response_content))
        .await;
}

async fn lookup(
    engine: &Arc<crate::cache::CacheEngine>,
    raw: &Value,
    directives: &CacheDirectives,
) -> LookupOutcome {
    let payload = payload_of(raw);
    let mut ctx = engine.prepare("default".into(), raw.clone(), &payload);
    engine.lookup(&mut ctx, directives).await
}

#[tokio::test]
async fn s1_exact_replay_scores_one() {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));
    let engine = engine_with(embedder, TtlConfig::default());
    let raw = chat_request("gpt-4", "What is 2+2?");

    // First sight: miss.
    let miss = lookup(&engine, &raw, &CacheDirectives::default()).await;
    assert!(matches!(miss, LookupOutcome::Miss { .. }));

    cache_request(&engine, &raw, "4").await;

    // Second sight: exact hit, score exactly 1.0.
    match lookup(&engine, &raw, &CacheDirectives::default()).await {
        LookupOutcome::Hit(hit) => {
            assert_eq!(hit.provenance.match_kind, Some(MatchKind::Exact));
            assert_eq!(hit.provenance.score, 1.0);
            assert_eq!(hit.response["choices"][0]["message"]["content"], "4");
        }
        LookupOutcome::Miss { .. } => panic!("expected exact hit"),
    }
}

#[tokio::test]
async fn s2_url_variance_misses_on_semantic_distance() {
    // Two article URLs mask to the same template, but a real embedding model
    // sees different documents; the stub encodes that.
    let embedder: Arc<dyn Embedder> = Arc::new(
        StubEmbedder::new(4)
            .map("article-123", vec![1.0, 0.0, 0.0, 0.0])
            .map("article-456", vec![0.2, 0.98, 0.0, 0.0]),
    );
    let engine = engine_with(embedder, TtlConfig::default());

    let cached = chat_request("gpt-4", "Summarize https://example.com/article-123");
    cache_request(&engine, &cached, "Article 123 is about caching.").await;

    let request = chat_request("gpt-4", "Summarize https://example.com/article-456");
    let outcome = lookup(&engine, &request, &CacheDirectives::default()).await;
    assert!(
        matches!(outcome, LookupOutcome::Miss { .. }),
        "different article must not be served from cache"
    );
}

#[tokio::test]
async fn s3_paraphrase_hits_through_ann_leg() {
    let embedder: Arc<dyn Embedder> = Arc::new(
        StubEmbedder::new(4)
            .map("capital of France", vec![1.0, 0.0, 0.0, 0.0])
            .map("France's capital", vec![0.98, 0.199, 0.0, 0.0]),
    );
    let engine = engine_with(embedder, TtlConfig::default());

    let cached = chat_request("gpt-4", "What's the capital of France?");
    cache_request(&engine, &cached, "Paris.").await;

    let paraphrase = chat_request("gpt-4", "Tell me France's capital city");
    match lookup(&engine, &paraphrase, &CacheDirectives::default()).await {
        LookupOutcome::Hit(hit) => {
            assert_eq!(hit.provenance.match_kind, Some(MatchKind::Template));
            assert!(hit.provenance.score >= 0.87, "score {}", hit.provenance.score);
            assert_eq!(hit.response["choices"][0]["message"]["content"], "Paris.");
        }
        LookupOutcome::Miss { .. } => panic!("expected template hit for paraphrase"),
    }
}

#[tokio::test]
async fn s4_mode_guard_blocks_json_object_request() {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));
    let engine = engine_with(embedder, TtlConfig::default());

    let text_request = chat_request("gpt-4", "Return the user list");
    cache_request(&engine, &text_request, "alice, bob").await;

    let mut json_request = text_request.clone();
    json_request["response_format"] = json!({"type": "json_object"});
    let outcome = lookup(&engine, &json_request, &CacheDirectives::default()).await;
    assert!(matches!(outcome, LookupOutcome::Miss { .. }));
}

#[tokio::test]
async fn s5_tool_schema_guard_blocks_extended_toolset() {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));
    let engine = engine_with(embedder, TtlConfig::default());

    let weather_tool = json!({"type": "function", "function": {"name": "get_weather"}});
    let email_tool = json!({"type": "function", "function": {"name": "send_email"}});

    let mut cached = chat_request("gpt-4", "What's the weather in Paris?");
    cached["tools"] = json!([weather_tool]);
    cache_request(&engine, &cached, "Sunny.").await;

    let mut request = chat_request("gpt-4", "What's the weather in Paris?");
    request["tools"] = json!([weather_tool, email_tool]);
    let outcome = lookup(&engine, &request, &CacheDirectives::default()).await;
    assert!(matches!(outcome, LookupOutcome::Miss { .. }));
}

#[tokio::test]
async fn expired_entries_are_never_served() {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));
    let ttl = TtlConfig {
        default_secs: 1,
        per_family: Default::default(),
    };
    let engine = engine_with(embedder, ttl);

    let raw = chat_request("gpt-4", "Ephemeral answer please");
    cache_request(&engine, &raw, "short-lived").await;

    // Live immediately after the write.
    assert!(matches!(
        lookup(&engine, &raw, &CacheDirectives::default()).await,
        LookupOutcome::Hit(_)
    ));

    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let outcome = lookup(&engine, &raw, &CacheDirectives::default()).await;
    assert!(
        matches!(outcome, LookupOutcome::Miss { .. }),
        "expired entry must not be returned"
    );
}

#[tokio::test]
async fn bypass_header_forces_miss() {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));
    let engine = engine_with(embedder, TtlConfig::default());

    let raw = chat_request("gpt-4", "What is 2+2?");
    cache_request(&engine, &raw, "4").await;

    let directives = CacheDirectives {
        bypass: true,
        ..CacheDirectives::default()
    };
    assert!(matches!(
        lookup(&engine, &raw, &directives).await,
        LookupOutcome::Miss { .. }
    ));
}

#[tokio::test]
async fn model_compat_family_overrides_strict_default() {
    let embedder: Arc<dyn Embedder> = Arc::new(
        StubEmbedder::new(4).map("capital", vec![1.0, 0.0, 0.0, 0.0]),
    );
    let engine = engine_with(embedder, TtlConfig::default());

    let cached = chat_request("gpt-4-0613", "What's the capital of France?");
    cache_request(&engine, &cached, "Paris.").await;

    let request = chat_request("gpt-4-2024-05-13", "What's the capital of France?");

    // Default strict policy: different model string, miss.
    assert!(matches!(
        lookup(&engine, &request, &CacheDirectives::default()).await,
        LookupOutcome::Miss { .. }
    ));

    // Family override: both are gpt-4, hit.
    let directives = CacheDirectives {
        model_compat: Some(ModelCompatPolicy::Family),
        ..CacheDirectives::default()
    };
    assert!(matches!(
        lookup(&engine, &request, &directives).await,
        LookupOutcome::Hit(_)
    ));
}

#[tokio::test]
async fn hot_tier_down_still_serves_template_hits() {
    let index = Arc::new(MemoryIndexStore::new());
    let embedder: Arc<dyn Embedder> =
        Arc::new(StubEmbedder::new(4).map("capital", vec![1.0, 0.0, 0.0, 0.0]));

    // Seed through a healthy engine sharing the index store.
    let healthy = engine_with_stores(
        Arc::new(MemoryHotStore::new(&MemoryHotTierConfig::default())),
        index.clone(),
        Arc::clone(&embedder),
        TtlConfig::default(),
    );
    let raw = chat_request("gpt-4", "What's the capital of France?");
    cache_request(&healthy, &raw, "Paris.").await;

    // Same index, dead hot tier: the exact leg fails, the template leg hits.
    let degraded = engine_with_stores(
        Arc::new(FailingHotStore),
        index,
        embedder,
        TtlConfig::default(),
    );
    match lookup(&degraded, &raw, &CacheDirectives::default()).await {
        LookupOutcome::Hit(hit) => {
            assert_eq!(hit.provenance.match_kind, Some(MatchKind::Template));
        }
        LookupOutcome::Miss { .. } => panic!("template hit should survive hot tier outage"),
    }
}

#[tokio::test]
async fn index_tier_down_still_serves_exact_hits() {
    let hot = Arc::new(MemoryHotStore::new(&MemoryHotTierConfig::default()));
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));

    let healthy = engine_with_stores(
        hot.clone(),
        Arc::new(MemoryIndexStore::new()),
        Arc::clone(&embedder),
        TtlConfig::default(),
    );
    let raw = chat_request("gpt-4", "What is 2+2?");
    cache_request(&healthy, &raw, "4").await;

    let degraded = engine_with_stores(
        hot,
        Arc::new(FailingIndexStore),
        embedder,
        TtlConfig::default(),
    );
    match lookup(&degraded, &raw, &CacheDirectives::default()).await {
        LookupOutcome::Hit(hit) => {
            assert_eq!(hit.provenance.match_kind, Some(MatchKind::Exact));
        }
        LookupOutcome::Miss { .. } => panic!("exact hit should survive index tier outage"),
    }
}

#[tokio::test]
async fn embedder_down_degrades_to_structural_scoring() {
    let index = Arc::new(MemoryIndexStore::new());
    let hot = Arc::new(MemoryHotStore::new(&MemoryHotTierConfig::default()));

    // Seed with a working embedder.
    let healthy = engine_with_stores(
        hot.clone(),
        index.clone(),
        Arc::new(StubEmbedder::new(4)) as Arc<dyn Embedder>,
        TtlConfig::default(),
    );
    let raw = chat_request("gpt-4", "Summarize the weekly report for the platform team");
    cache_request(&healthy, &raw, "All green.").await;

    // Embedder dead, prompt differs by one masked number: identical
    // template, structural scoring admits it at the raised threshold.
    let degraded = engine_with_stores(
        hot,
        index,
        Arc::new(FailingEmbedder) as Arc<dyn Embedder>,
        TtlConfig::default(),
    );
    let directives = CacheDirectives {
        tiers: crate::cache::LookupTiers::TemplateOnly,
        ..CacheDirectives::default()
    };
    match lookup(&degraded, &raw, &directives).await {
        LookupOutcome::Hit(hit) => {
            assert_eq!(hit.provenance.match_kind, Some(MatchKind::Template));
        }
        LookupOutcome::Miss { .. } => panic!("structural template hit should survive embedder outage"),
    }
}

#[tokio::test]
async fn write_through_ignores_duplicate_concurrent_misses() {
    let embedder: Arc<dyn Embedder> = Arc::new(StubEmbedder::new(4));
    let engine = engine_with(embedder, TtlConfig::default());
    let raw = chat_request("gpt-4", "What is 2+2?");

    // Two concurrent misses both write through; the duplicate insert is
    // silently ignored and both writes encode the same key.
    cache_request(&engine, &raw, "4").await;
    cache_request(&engine, &raw, "4").await;

    let stats = engine.stats().await;
    assert_eq!(stats.index_entries, Some(1));
}
