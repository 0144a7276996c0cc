//! mnemo: an OpenAI-compatible semantic caching proxy.
//!
//! Serves semantically equivalent prior answers instead of re-invoking the
//! upstream model: exact SHA-256 matching in a hot tier, template matching
//! via SimHash + embedding retrieval in an indexed tier, deterministic SSE
//! replay for streaming hits.

use std::{path::PathBuf, sync::Arc};

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod api_types;
mod cache;
mod canonical;
mod config;
mod embedding;
mod fingerprint;
mod jobs;
mod observability;
mod providers;
mod replay;
mod resilience;
mod routes;
mod state;
#[cfg(test)]
mod tests;
mod validation;

use cache::{CacheEngine, HotStore, MemoryHotStore, index::IndexStore};
use config::{HotTierConfig, IndexTierConfig, ProxyConfig};
use providers::ProviderRegistry;
use resilience::BreakerRegistry;
use state::AppState;

#[derive(Debug, Parser)]
#[command(name = "mnemo", version, about = "OpenAI-compatible semantic caching proxy")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the configured listen port.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => match ProxyConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("failed to load config: {e}");
                std::process::exit(1);
            }
        },
        None => ProxyConfig::default(),
    };
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    observability::init_tracing(&config.observability.logging);
    if let Err(e) = observability::metrics::init_metrics(&config.observability.metrics) {
        error!(error = %e, "metrics init failed, continuing without metrics");
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "fatal error");
        std::process::exit(1);
    }
}

async fn run(config: ProxyConfig) -> Result<(), Box<dyn std::error::Error>> {
    let config = Arc::new(config);
    let breakers = Arc::new(BreakerRegistry::new(&config.resilience));

    let hot: Arc<dyn HotStore> = match &config.hot_tier {
        HotTierConfig::Memory(memory) => {
            info!("hot tier: in-memory");
            Arc::new(MemoryHotStore::new(memory))
        }
        #[cfg(feature = "redis")]
        HotTierConfig::Redis(redis) => {
            info!(url = %redis.url, "hot tier: redis");
            Arc::new(cache::RedisHotStore::from_config(redis)?)
        }
        #[cfg(not(feature = "redis"))]
        HotTierConfig::Redis(_) => {
            return Err("config selects a redis hot tier but the 'redis' feature is not compiled"
                .into());
        }
    };

    let embedder: Arc<dyn embedding::Embedder> =
        embedding::build_embedder(&config.template.embedding).into();
    let dimensions = embedder.dimensions();

    let index: Arc<dyn IndexStore> = match &config.index_tier {
        IndexTierConfig::Memory => {
            info!("index tier: in-memory");
            Arc::new(cache::index::memory::MemoryIndexStore::new())
        }
        #[cfg(feature = "database-postgres")]
        IndexTierConfig::Postgres(postgres) => {
            info!(table = %postgres.table_name, "index tier: postgres + pgvector");
            Arc::new(cache::index::postgres::PostgresIndexStore::connect(postgres, dimensions).await?)
        }
    };

    let engine = Arc::new(CacheEngine::new(
        Arc::clone(&hot),
        Arc::clone(&index),
        embedder,
        Arc::clone(&breakers),
        config.template.clone(),
        config.ttl.clone(),
        &config.resilience,
    ));

    let registry = Arc::new(ProviderRegistry::from_config(
        &config.providers,
        Arc::clone(&breakers.provider),
    )?);

    let shutdown = CancellationToken::new();
    let sweeper = tokio::spawn(jobs::run_ttl_sweeper(
        Arc::clone(&index),
        config.sweep.clone(),
        shutdown.clone(),
    ));

    let state = AppState {
        engine: Arc::clone(&engine),
        providers: registry,
        config: Arc::clone(&config),
    };
    let app = routes::router(state);

    let addr = config.server.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Graceful shutdown drains in two steps: axum has stopped accepting and
    // finished in-flight requests above; now wait for the background work
    // those requests queued (write-throughs, hit stats) before exiting, so
    // responses already sent to clients still get their cache entries.
    shutdown.cancel();
    engine.drain().await;
    let _ = sweeper.await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve on SIGINT or SIGTERM and cancel background work.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("shutdown signal received");
    token.cancel();
}
