//! Cache control headers: parsing the `x-cache-*` request headers and
//! stamping the `x-cache-*` response headers.

use axum::response::Response;
use http::{HeaderMap, HeaderValue};

use crate::{
    cache::{CacheDirectives, LookupTiers, Provenance},
    config::ModelCompatPolicy,
};

pub const TENANT_HEADER: &str = "x-tenant-id";
pub const DEFAULT_TENANT: &str = "default";

/// Tenant from `x-tenant-id`, defaulting when absent or unreadable.
pub fn tenant_from(headers: &HeaderMap) -> String {
    headers
        .get(TENANT_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_TENANT)
        .to_string()
}

/// Parse the cache directive headers. Unrecognized values fall back to the
/// defaults rather than erroring; cache controls must never fail a request.
pub fn directives_from(headers: &HeaderMap) -> CacheDirectives {
    let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

    CacheDirectives {
        bypass: header("x-cache-bypass") == Some("true"),
        store: header("x-cache-store") != Some("false"),
        tiers: header("x-cache-mode")
            .and_then(LookupTiers::parse)
            .unwrap_or_default(),
        model_compat: header("x-model-compat").and_then(ModelCompatPolicy::parse),
        experiment: header("x-cache-experiment").map(str::to_string),
    }
}

/// Stamp provenance onto a response.
pub fn apply_provenance(response: &mut Response, provenance: &Provenance) {
    let headers = response.headers_mut();
    let set = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(name, value);
        }
    };

    set(headers, "x-cache-hit", provenance.hit.to_string());
    set(
        headers,
        "x-cache-match",
        provenance
            .match_kind
            .map(|m| m.as_str().to_string())
            .unwrap_or_else(|| "none".to_string()),
    );
    set(headers, "x-cache-score", format!("{:.3}", provenance.score));
    if let Some(id) = provenance.entry_id {
        set(headers, "x-cache-provenance", id.to_string());
    }
    if let Some(model) = &provenance.source_model {
        set(headers, "x-cache-source-model", model.clone());
    }
    if provenance.hit {
        set(headers, "x-cache-age", provenance.age_seconds.to_string());
    }
    set(
        headers,
        "x-cache-degraded",
        provenance.degradation.is_degraded().to_string(),
    );
    if provenance.degradation.is_degraded() {
        set(
            headers,
            "x-cache-degraded-reason",
            provenance.degradation.as_str().to_string(),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_headers() {
        let directives = directives_from(&HeaderMap::new());
        assert!(!directives.bypass);
        assert!(directives.store);
        assert_eq!(directives.tiers, LookupTiers::Both);
        assert!(directives.model_compat.is_none());
    }

    #[test]
    fn parses_all_directive_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-cache-bypass", HeaderValue::from_static("true"));
        headers.insert("x-cache-store", HeaderValue::from_static("false"));
        headers.insert("x-cache-mode", HeaderValue::from_static("exact"));
        headers.insert("x-model-compat", HeaderValue::from_static("family"));
        headers.insert("x-cache-experiment", HeaderValue::from_static("exp-42"));

        let directives = directives_from(&headers);
        assert!(directives.bypass);
        assert!(!directives.store);
        assert_eq!(directives.tiers, LookupTiers::ExactOnly);
        assert_eq!(directives.model_compat, Some(ModelCompatPolicy::Family));
        assert_eq!(directives.experiment.as_deref(), Some("exp-42"));
    }

    #[test]
    fn unknown_values_fall_back_to_defaults() {
        let mut headers = HeaderMap::new();
        headers.insert("x-cache-mode", HeaderValue::from_static("everything"));
        headers.insert("x-model-compat", HeaderValue::from_static("loose"));
        let directives = directives_from(&headers);
        assert_eq!(directives.tiers, LookupTiers::Both);
        assert!(directives.model_compat.is_none());
    }

    #[test]
    fn tenant_defaults_when_missing() {
        assert_eq!(tenant_from(&HeaderMap::new()), "default");
        let mut headers = HeaderMap::new();
        headers.insert(TENANT_HEADER, HeaderValue::from_static("acme"));
        assert_eq!(tenant_from(&headers), "acme");
    }
}
