//! TTL sweep worker.
//!
//! Periodically hard-deletes expired, non-golden rows from the indexed
//! tier. The hot tier expires natively and needs no sweeping. Lookup
//! correctness does not depend on this job — expired rows are filtered at
//! query time — it only reclaims storage.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{cache::index::IndexStore, config::SweepConfig, observability::metrics};

/// Run the sweep loop until cancelled.
pub async fn run_ttl_sweeper(
    index: Arc<dyn IndexStore>,
    config: SweepConfig,
    shutdown: CancellationToken,
) {
    if !config.enabled {
        info!("ttl sweeper disabled by configuration");
        return;
    }

    let interval = std::time::Duration::from_secs(config.interval_secs.max(1));
    info!(
        interval_secs = config.interval_secs,
        batch_size = config.batch_size,
        "starting ttl sweeper"
    );

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("ttl sweeper stopping");
                return;
            }
            _ = tokio::time::sleep(interval) => {}
        }

        match index.delete_expired(config.batch_size).await {
            Ok(0) => debug!("ttl sweep: nothing expired"),
            Ok(deleted) => {
                metrics::record_sweep_deleted(deleted);
                info!(deleted, "ttl sweep removed expired entries");
            }
            Err(e) => warn!(error = %e, "ttl sweep failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::{
        cache::index::{NewCacheEntry, memory::MemoryIndexStore},
        fingerprint::{RequestMode, TemperatureBucket},
    };

    fn expired_entry(key: &str) -> NewCacheEntry {
        NewCacheEntry {
            tenant: "t".to_string(),
            exact_key: key.to_string(),
            simhash: 0,
            embedding: vec![1.0, 0.0],
            canonical_prompt: String::new(),
            raw_prompt_hmac: String::new(),
            request_blob: serde_json::json!({}),
            response_blob: serde_json::json!({}),
            model: "gpt-4".to_string(),
            temperature_bucket: TemperatureBucket::Default,
            mode: RequestMode::Text,
            tool_schema_hash: "none".to_string(),
            pii_present: false,
            expires_at: Some(Utc::now() - Duration::seconds(10)),
        }
    }

    #[tokio::test]
    async fn sweeper_deletes_and_stops_on_cancel() {
        let index = Arc::new(MemoryIndexStore::new());
        index.insert(expired_entry("a")).await.unwrap();
        index.insert(expired_entry("b")).await.unwrap();

        let token = CancellationToken::new();
        let config = SweepConfig {
            enabled: true,
            interval_secs: 1,
            batch_size: 100,
        };

        let handle = tokio::spawn(run_ttl_sweeper(
            index.clone() as Arc<dyn IndexStore>,
            config,
            token.clone(),
        ));

        tokio::time::sleep(std::time::Duration::from_millis(1500)).await;
        assert_eq!(index.stats().await.unwrap().entries, 0);

        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("sweeper should stop promptly")
            .unwrap();
    }

    #[tokio::test]
    async fn disabled_sweeper_returns_immediately() {
        let index = Arc::new(MemoryIndexStore::new());
        let config = SweepConfig {
            enabled: false,
            interval_secs: 1,
            batch_size: 100,
        };
        // Completes without needing cancellation.
        run_ttl_sweeper(index as Arc<dyn IndexStore>, config, CancellationToken::new()).await;
    }
}
