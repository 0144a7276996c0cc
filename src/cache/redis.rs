//! Redis-backed hot tier.
//!
//! Entries live under `{prefix}resp:{tenant}:{exact_key}` with native Redis
//! TTLs, so expiry needs no sweeping of our own. Eviction under memory
//! pressure is delegated to Redis (`maxmemory-policy allkeys-lfu` is the
//! intended pairing).

use std::time::Duration;

use async_trait::async_trait;
use redis::{AsyncCommands, aio::MultiplexedConnection};

use super::{error::CacheResult, traits::HotStore};
use crate::config::RedisHotTierConfig;

pub struct RedisHotStore {
    client: redis::Client,
    key_prefix: String,
    command_timeout: Duration,
}

impl RedisHotStore {
    pub fn from_config(config: &RedisHotTierConfig) -> CacheResult<Self> {
        let client = redis::Client::open(config.url.as_str())?;
        Ok(Self {
            client,
            key_prefix: config.key_prefix.clone(),
            command_timeout: Duration::from_secs(config.command_timeout_secs),
        })
    }

    fn entry_key(&self, tenant: &str, exact_key: &str) -> String {
        format!("{}resp:{}:{}", self.key_prefix, tenant, exact_key)
    }

    async fn connection(&self) -> CacheResult<MultiplexedConnection> {
        let conn = tokio::time::timeout(
            self.command_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| super::error::CacheError::Timeout)??;
        Ok(conn)
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> CacheResult<T> {
        tokio::time::timeout(self.command_timeout, fut)
            .await
            .map_err(|_| super::error::CacheError::Timeout)?
            .map_err(Into::into)
    }
}

#[async_trait]
impl HotStore for RedisHotStore {
    async fn get(&self, tenant: &str, exact_key: &str) -> CacheResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        let key = self.entry_key(tenant, exact_key);
        self.with_timeout(conn.get::<_, Option<Vec<u8>>>(key)).await
    }

    async fn set(
        &self,
        tenant: &str,
        exact_key: &str,
        value: &[u8],
        ttl: Duration,
    ) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let key = self.entry_key(tenant, exact_key);
        if ttl.is_zero() {
            self.with_timeout(conn.set::<_, _, ()>(key, value)).await
        } else {
            self.with_timeout(conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1)))
                .await
        }
    }

    async fn delete(&self, tenant: &str, exact_key: &str) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let key = self.entry_key(tenant, exact_key);
        self.with_timeout(conn.del::<_, ()>(key)).await
    }

    async fn clear(&self, tenant: Option<&str>) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        let pattern = match tenant {
            Some(tenant) => format!("{}resp:{}:*", self.key_prefix, tenant),
            None => format!("{}resp:*", self.key_prefix),
        };

        // SCAN in batches rather than KEYS, to stay incremental on a shared
        // instance.
        let mut cursor: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .with_timeout(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query_async(&mut conn),
                )
                .await?;
            if !keys.is_empty() {
                self.with_timeout(conn.del::<_, ()>(keys)).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    async fn entry_count(&self) -> CacheResult<u64> {
        let mut conn = self.connection().await?;
        let pattern = format!("{}resp:*", self.key_prefix);
        let mut cursor: u64 = 0;
        let mut count: u64 = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = self
                .with_timeout(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(500)
                        .query_async(&mut conn),
                )
                .await?;
            count += keys.len() as u64;
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(count)
    }

    async fn ping(&self) -> CacheResult<()> {
        let mut conn = self.connection().await?;
        self.with_timeout(redis::cmd("PING").query_async::<()>(&mut conn))
            .await
    }
}
