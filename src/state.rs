//! Shared application state.
//!
//! Stores, breakers and providers are constructed once in `main` and
//! injected here; nothing in the request path reaches for ambient
//! singletons.

use std::sync::Arc;

use crate::{cache::CacheEngine, config::ProxyConfig, providers::ProviderRegistry};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<CacheEngine>,
    pub providers: Arc<ProviderRegistry>,
    pub config: Arc<ProxyConfig>,
}
