//! In-memory hot tier with approximate-LFU eviction.
//!
//! # Multi-Node Deployments
//!
//! This store is per-process. Nodes do not see each other's entries, so use
//! the Redis hot tier for anything beyond a single node.
//!
//! Eviction is approximate-LFU in the Redis style: when the store is full, a
//! random sample of entries is drawn and the least-frequently-used member of
//! the sample is evicted, repeating until under capacity. Expired entries are
//! dropped first.

use std::{
    sync::atomic::{AtomicU32, Ordering},
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;

use super::{error::CacheResult, traits::HotStore};
use crate::config::MemoryHotTierConfig;

struct HotEntry {
    data: Vec<u8>,
    expires_at: Option<Instant>,
    uses: AtomicU32,
}

impl HotEntry {
    fn new(data: Vec<u8>, expires_at: Option<Instant>) -> Self {
        Self {
            data,
            expires_at,
            uses: AtomicU32::new(1),
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|exp| Instant::now() > exp)
    }
}

pub struct MemoryHotStore {
    data: DashMap<String, HotEntry>,
    max_entries: usize,
    sample_size: usize,
}

impl MemoryHotStore {
    pub fn new(config: &MemoryHotTierConfig) -> Self {
        Self {
            data: DashMap::new(),
            max_entries: config.max_entries,
            sample_size: config.eviction_sample_size.max(1),
        }
    }

    fn composite_key(tenant: &str, exact_key: &str) -> String {
        format!("{tenant}\u{1}{exact_key}")
    }

    fn evict_if_needed(&self) {
        if self.data.len() < self.max_entries {
            return;
        }

        self.data.retain(|_, entry| !entry.is_expired());

        while self.data.len() >= self.max_entries {
            // Sample and kick the least-used entry. DashMap iteration order
            // varies by shard and hash, which is random enough for sampling.
            let victim = self
                .data
                .iter()
                .take(self.sample_size)
                .min_by_key(|entry| entry.uses.load(Ordering::Relaxed))
                .map(|entry| entry.key().clone());

            match victim {
                Some(key) => {
                    self.data.remove(&key);
                }
                None => break,
            }
        }
    }
}

#[async_trait]
impl HotStore for MemoryHotStore {
    async fn get(&self, tenant: &str, exact_key: &str) -> CacheResult<Option<Vec<u8>>> {
        let key = Self::composite_key(tenant, exact_key);
        if let Some(entry) = self.data.get(&key) {
            if entry.is_expired() {
                drop(entry);
                self.data.remove(&key);
                return Ok(None);
            }
            entry.uses.fetch_add(1, Ordering::Relaxed);
            Ok(Some(entry.data.clone()))
        } else {
            Ok(None)
        }
    }

    async fn set(
        &self,
        tenant: &str,
        exact_key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> CacheResult<()> {
        self.evict_if_needed();

        let expires_at = if ttl.is_zero() {
            None
        } else {
            Some(Instant::now() + ttl)
        };
        self.data.insert(
            Self::composite_key(tenant, exact_key),
            HotEntry::new(value.to_vec(), expires_at),
        );
        Ok(())
    }

    async fn delete(&self, tenant: &str, exact_key: &str) -> CacheResult<()> {
        self.data.remove(&Self::composite_key(tenant, exact_key));
        Ok(())
    }

    async fn clear(&self, tenant: Option<&str>) -> CacheResult<()> {
        match tenant {
            Some(tenant) => {
                let prefix = format!("{tenant}\u{1}");
                self.data.retain(|key, _| !key.starts_with(&prefix));
            }
            None => self.data.clear(),
        }
        Ok(())
    }

    async fn entry_count(&self) -> CacheResult<u64> {
        Ok(self.data.len() as u64)
    }

    async fn ping(&self) -> CacheResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max_entries: usize) -> MemoryHotStore {
        MemoryHotStore::new(&MemoryHotTierConfig {
            max_entries,
            eviction_sample_size: 16,
        })
    }

    #[tokio::test]
    async fn set_get_roundtrip() {
        let store = store(10);
        store
            .set("t1", "k1", b"value", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("t1", "k1").await.unwrap(), Some(b"value".to_vec()));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = store(10);
        store
            .set("t1", "k1", b"value", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("t2", "k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_read_as_absent() {
        let store = store(10);
        store
            .set("t1", "k1", b"value", Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.get("t1", "k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clear_by_tenant_spares_others() {
        let store = store(10);
        store.set("a", "k", b"1", Duration::from_secs(60)).await.unwrap();
        store.set("b", "k", b"2", Duration::from_secs(60)).await.unwrap();
        store.clear(Some("a")).await.unwrap();
        assert_eq!(store.get("a", "k").await.unwrap(), None);
        assert_eq!(store.get("b", "k").await.unwrap(), Some(b"2".to_vec()));
    }

    #[tokio::test]
    async fn eviction_prefers_cold_entries() {
        let store = store(4);
        for i in 0..4 {
            store
                .set("t", &format!("k{i}"), b"v", Duration::from_secs(60))
                .await
                .unwrap();
        }
        // Heat up k0..k2; k3 stays cold.
        for _ in 0..5 {
            for i in 0..3 {
                store.get("t", &format!("k{i}")).await.unwrap();
            }
        }
        store.set("t", "k4", b"v", Duration::from_secs(60)).await.unwrap();

        assert!(store.entry_count().await.unwrap() <= 4);
        // The hot entries survived.
        for i in 0..3 {
            assert!(store.get("t", &format!("k{i}")).await.unwrap().is_some());
        }
    }
}
