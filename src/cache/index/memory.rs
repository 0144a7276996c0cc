//! In-memory indexed tier for dev and tests.
//!
//! Linear scans stand in for the SQL indexes; semantics (uniqueness, expiry
//! filtering, hybrid candidate retrieval, golden pinning) match the Postgres
//! implementation.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use super::{
    CacheEntry, Candidate, CandidateQuery, IndexStats, IndexStore, ModelFilter, NewCacheEntry,
};
use crate::{
    cache::error::CacheResult,
    embedding::cosine_similarity,
    fingerprint::hamming,
};

struct StoredEntry {
    entry: CacheEntry,
    embedding: Vec<f32>,
}

#[derive(Default)]
pub struct MemoryIndexStore {
    entries: RwLock<Vec<StoredEntry>>,
}

impl MemoryIndexStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn matches_model(filter: ModelFilter<'_>, model: &str) -> bool {
        match filter {
            ModelFilter::Exact(m) => model == m,
            ModelFilter::FamilyPrefix(prefix) => model.starts_with(prefix),
            ModelFilter::Any => true,
        }
    }
}

#[async_trait]
impl IndexStore for MemoryIndexStore {
    async fn insert(&self, new: NewCacheEntry) -> CacheResult<()> {
        let mut entries = self.entries.write();
        let duplicate = entries
            .iter()
            .any(|stored| stored.entry.tenant == new.tenant && stored.entry.exact_key == new.exact_key);
        if duplicate {
            return Ok(());
        }
        entries.push(StoredEntry {
            entry: CacheEntry {
                id: Uuid::new_v4(),
                tenant: new.tenant,
                exact_key: new.exact_key,
                simhash: new.simhash,
                canonical_prompt: new.canonical_prompt,
                raw_prompt_hmac: new.raw_prompt_hmac,
                request_blob: new.request_blob,
                response_blob: new.response_blob,
                model: new.model,
                temperature_bucket: new.temperature_bucket,
                mode: new.mode,
                tool_schema_hash: new.tool_schema_hash,
                hit_count: 0,
                last_hit_at: None,
                is_golden: false,
                pii_present: new.pii_present,
                created_at: Utc::now(),
                expires_at: new.expires_at,
            },
            embedding: new.embedding,
        });
        Ok(())
    }

    async fn fetch_candidates(&self, query: CandidateQuery<'_>) -> CacheResult<Vec<Candidate>> {
        let now = Utc::now();
        let entries = self.entries.read();

        let eligible: Vec<&StoredEntry> = entries
            .iter()
            .filter(|stored| {
                let e = &stored.entry;
                e.tenant == query.tenant
                    && e.mode == query.mode
                    && Self::matches_model(query.model_filter, &e.model)
                    && !e.is_expired(now)
            })
            .collect();

        let mut window: Vec<Candidate> = eligible
            .iter()
            .filter_map(|stored| {
                let distance = hamming(stored.entry.simhash, query.simhash);
                (distance <= query.max_hamming).then(|| Candidate {
                    entry: stored.entry.clone(),
                    hamming: distance,
                    cosine_similarity: query
                        .embedding
                        .map(|emb| cosine_similarity(emb, &stored.embedding)),
                })
            })
            .collect();
        window.sort_by(|a, b| {
            a.hamming
                .cmp(&b.hamming)
                .then(b.entry.hit_count.cmp(&a.entry.hit_count))
        });

        // A saturated Hamming window must not starve the ANN leg: cap the
        // window so its neighbours survive the overall candidate limit.
        let window_cap = if query.embedding.is_some() {
            query.limit.saturating_sub(query.ann_top_k) as usize
        } else {
            query.limit as usize
        };
        window.truncate(window_cap);

        if let Some(embedding) = query.embedding {
            let mut neighbours: Vec<Candidate> = eligible
                .iter()
                .filter(|stored| !window.iter().any(|c| c.entry.id == stored.entry.id))
                .map(|stored| Candidate {
                    entry: stored.entry.clone(),
                    hamming: hamming(stored.entry.simhash, query.simhash),
                    cosine_similarity: Some(cosine_similarity(embedding, &stored.embedding)),
                })
                .collect();
            neighbours.sort_by(|a, b| {
                b.cosine_similarity
                    .partial_cmp(&a.cosine_similarity)
                    .unwrap_or(std::cmp::Ordering::Equal)
            });
            window.extend(neighbours.into_iter().take(query.ann_top_k as usize));
        }

        window.truncate(query.limit as usize);
        Ok(window)
    }

    async fn record_hit(&self, id: Uuid) -> CacheResult<()> {
        let mut entries = self.entries.write();
        if let Some(stored) = entries.iter_mut().find(|s| s.entry.id == id) {
            stored.entry.hit_count += 1;
            stored.entry.last_hit_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn record_hit_by_exact(&self, tenant: &str, exact_key: &str) -> CacheResult<()> {
        let mut entries = self.entries.write();
        if let Some(stored) = entries
            .iter_mut()
            .find(|s| s.entry.tenant == tenant && s.entry.exact_key == exact_key)
        {
            stored.entry.hit_count += 1;
            stored.entry.last_hit_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn set_golden(
        &self,
        id: Uuid,
        golden: bool,
        restored_expiry: Option<DateTime<Utc>>,
    ) -> CacheResult<bool> {
        let mut entries = self.entries.write();
        match entries.iter_mut().find(|s| s.entry.id == id) {
            Some(stored) => {
                stored.entry.is_golden = golden;
                stored.entry.expires_at = if golden { None } else { restored_expiry };
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_expired(&self, batch: u32) -> CacheResult<u64> {
        let now = Utc::now();
        let mut entries = self.entries.write();
        let before = entries.len();
        let mut remaining = batch as usize;
        entries.retain(|stored| {
            if remaining > 0 && stored.entry.is_expired(now) {
                remaining -= 1;
                false
            } else {
                true
            }
        });
        Ok((before - entries.len()) as u64)
    }

    async fn clear(&self, tenant: Option<&str>) -> CacheResult<u64> {
        let mut entries = self.entries.write();
        let before = entries.len();
        match tenant {
            Some(tenant) => entries.retain(|stored| stored.entry.tenant != tenant),
            None => entries.clear(),
        }
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self) -> CacheResult<IndexStats> {
        let entries = self.entries.read();
        Ok(IndexStats {
            entries: entries.len() as u64,
            golden_entries: entries.iter().filter(|s| s.entry.is_golden).count() as u64,
        })
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::fingerprint::RequestMode;

    fn new_entry(tenant: &str, exact_key: &str, simhash: i64, model: &str) -> NewCacheEntry {
        NewCacheEntry {
            tenant: tenant.to_string(),
            exact_key: exact_key.to_string(),
            simhash,
            embedding: vec![1.0, 0.0],
            canonical_prompt: "user: {URL}".to_string(),
            raw_prompt_hmac: "digest".to_string(),
            request_blob: serde_json::json!({}),
            response_blob: serde_json::json!({}),
            model: model.to_string(),
            temperature_bucket: crate::fingerprint::TemperatureBucket::Default,
            mode: RequestMode::Text,
            tool_schema_hash: "none".to_string(),
            pii_present: false,
            expires_at: Some(Utc::now() + Duration::hours(1)),
        }
    }

    fn query<'a>(tenant: &'a str, simhash: i64, embedding: Option<&'a [f32]>) -> CandidateQuery<'a> {
        CandidateQuery {
            tenant,
            mode: RequestMode::Text,
            model_filter: ModelFilter::Any,
            simhash,
            max_hamming: 6,
            embedding,
            ann_top_k: 8,
            limit: 100,
        }
    }

    #[tokio::test]
    async fn duplicate_exact_key_ignored_silently() {
        let store = MemoryIndexStore::new();
        store.insert(new_entry("t", "k", 0, "gpt-4")).await.unwrap();
        store.insert(new_entry("t", "k", 99, "gpt-4")).await.unwrap();
        assert_eq!(store.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn window_candidates_sorted_by_hamming() {
        let store = MemoryIndexStore::new();
        store.insert(new_entry("t", "a", 0b0111, "gpt-4")).await.unwrap();
        store.insert(new_entry("t", "b", 0b0001, "gpt-4")).await.unwrap();
        let candidates = store.fetch_candidates(query("t", 0, None)).await.unwrap();
        assert_eq!(candidates.len(), 2);
        assert!(candidates[0].hamming <= candidates[1].hamming);
    }

    #[tokio::test]
    async fn ann_leg_reaches_beyond_hamming_window() {
        let store = MemoryIndexStore::new();
        // Far in Hamming space but present via the ANN leg.
        store.insert(new_entry("t", "far", !0i64, "gpt-4")).await.unwrap();
        let embedding = [1.0f32, 0.0];
        let candidates = store
            .fetch_candidates(query("t", 0, Some(&embedding)))
            .await
            .unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].hamming > 6);
        assert!(candidates[0].cosine_similarity.unwrap() > 0.99);
    }

    #[tokio::test]
    async fn full_hamming_window_does_not_starve_ann_leg() {
        let store = MemoryIndexStore::new();
        // Six entries inside the Hamming window — more than the window's
        // share of a limit of 6 with top_k 2 — all semantically unrelated
        // to the query embedding.
        for i in 0..6i64 {
            let mut near = new_entry("t", &format!("near-{i}"), i & 1, "gpt-4");
            near.embedding = vec![0.0, 1.0];
            store.insert(near).await.unwrap();
        }
        // One entry far outside the window but semantically aligned.
        let mut far = new_entry("t", "far", !0i64, "gpt-4");
        far.embedding = vec![1.0, 0.0];
        store.insert(far).await.unwrap();

        let embedding = [1.0f32, 0.0];
        let candidates = store
            .fetch_candidates(CandidateQuery {
                tenant: "t",
                mode: RequestMode::Text,
                model_filter: ModelFilter::Any,
                simhash: 0,
                max_hamming: 6,
                embedding: Some(&embedding),
                ann_top_k: 2,
                limit: 6,
            })
            .await
            .unwrap();

        assert!(candidates.len() <= 6);
        assert!(
            candidates.iter().any(|c| c.entry.exact_key == "far"),
            "ANN neighbour must survive a saturated Hamming window"
        );
    }

    #[tokio::test]
    async fn expired_entries_not_returned() {
        let store = MemoryIndexStore::new();
        let mut entry = new_entry("t", "k", 0, "gpt-4");
        entry.expires_at = Some(Utc::now() - Duration::seconds(5));
        store.insert(entry).await.unwrap();
        let candidates = store.fetch_candidates(query("t", 0, None)).await.unwrap();
        assert!(candidates.is_empty());
    }

    #[tokio::test]
    async fn golden_pin_survives_expiry_and_sweep() {
        let store = MemoryIndexStore::new();
        let mut entry = new_entry("t", "k", 0, "gpt-4");
        entry.expires_at = Some(Utc::now() - Duration::seconds(5));
        store.insert(entry).await.unwrap();

        let id = {
            let entries = store.entries.read();
            entries[0].entry.id
        };
        assert!(store.set_golden(id, true, None).await.unwrap());

        assert_eq!(store.delete_expired(100).await.unwrap(), 0);
        let candidates = store.fetch_candidates(query("t", 0, None)).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].entry.is_golden);
    }

    #[tokio::test]
    async fn sweep_deletes_expired_rows() {
        let store = MemoryIndexStore::new();
        let mut entry = new_entry("t", "dead", 0, "gpt-4");
        entry.expires_at = Some(Utc::now() - Duration::seconds(5));
        store.insert(entry).await.unwrap();
        store.insert(new_entry("t", "live", 0, "gpt-4")).await.unwrap();

        assert_eq!(store.delete_expired(100).await.unwrap(), 1);
        assert_eq!(store.stats().await.unwrap().entries, 1);
    }

    #[tokio::test]
    async fn model_filter_variants() {
        let store = MemoryIndexStore::new();
        store.insert(new_entry("t", "a", 0, "gpt-4-0613")).await.unwrap();

        let mut q = query("t", 0, None);
        q.model_filter = ModelFilter::Exact("gpt-4");
        assert!(store.fetch_candidates(q.clone()).await.unwrap().is_empty());

        q.model_filter = ModelFilter::FamilyPrefix("gpt-4");
        assert_eq!(store.fetch_candidates(q.clone()).await.unwrap().len(), 1);

        q.model_filter = ModelFilter::Any;
        assert_eq!(store.fetch_candidates(q).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn record_hit_bumps_counters() {
        let store = MemoryIndexStore::new();
        store.insert(new_entry("t", "k", 0, "gpt-4")).await.unwrap();
        let id = {
            let entries = store.entries.read();
            entries[0].entry.id
        };
        store.record_hit(id).await.unwrap();
        store.record_hit(id).await.unwrap();
        let entries = store.entries.read();
        assert_eq!(entries[0].entry.hit_count, 2);
        assert!(entries[0].entry.last_hit_at.is_some());
    }
}
