use std::time::Duration;

use async_trait::async_trait;

use super::error::CacheResult;

/// The hot (exact-match) tier: a `(tenant, exact_key) → blob` mapping with
/// per-entry TTL. Values are stored compressed; compression happens in the
/// engine so implementations stay pure byte maps.
#[async_trait]
pub trait HotStore: Send + Sync {
    /// Fetch a blob. Expired entries read as absent.
    async fn get(&self, tenant: &str, exact_key: &str) -> CacheResult<Option<Vec<u8>>>;

    /// Store a blob with a TTL.
    async fn set(&self, tenant: &str, exact_key: &str, value: &[u8], ttl: Duration)
    -> CacheResult<()>;

    /// Remove a single entry.
    async fn delete(&self, tenant: &str, exact_key: &str) -> CacheResult<()>;

    /// Remove all entries for a tenant, or everything when `tenant` is None.
    async fn clear(&self, tenant: Option<&str>) -> CacheResult<()>;

    /// Approximate number of live entries, where the backend can say.
    async fn entry_count(&self) -> CacheResult<u64>;

    /// Liveness probe for health reporting.
    async fn ping(&self) -> CacheResult<()>;
}
