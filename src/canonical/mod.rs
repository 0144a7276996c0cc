//! Request canonicalization: stable JSON form, exact key, prompt text,
//! template form and raw-prompt digest.

mod json;
mod mask;

use hmac::{Hmac, Mac};
pub use json::{canonicalize_value, exact_key, to_canonical_json};
pub use mask::{MaskOutcome, mask_prompt};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::api_types::CreateChatCompletionPayload;

/// Everything derived from a request body by canonicalization.
#[derive(Debug, Clone)]
pub struct CanonicalRequest {
    /// Deterministic serialization used for hashing.
    pub canonical_json: String,
    /// SHA-256 of `canonical_json`, lowercase hex.
    pub exact_key: String,
    /// Role-tagged concatenation of all message contents.
    pub prompt_text: String,
    /// Template form of `prompt_text`.
    pub masked_prompt: String,
    /// Digest of the raw prompt for dedup tracking without disclosure.
    pub raw_digest: String,
    /// True if masking matched an email, phone or card pattern.
    pub pii_present: bool,
}

/// Canonicalize a request.
///
/// `raw` is the request body as received (the canonical form is computed from
/// it, so fields the typed payload does not model still participate in the
/// exact key). `digest_secret`, when present, switches the raw-prompt digest
/// from a plain SHA-256 to a keyed HMAC-SHA256.
pub fn canonicalize(
    raw: &Value,
    payload: &CreateChatCompletionPayload,
    digest_secret: Option<&[u8]>,
) -> CanonicalRequest {
    let canonical_json = to_canonical_json(raw);
    let exact_key = exact_key(&canonical_json);
    let prompt_text = extract_prompt(payload);
    let MaskOutcome { masked, pii_present } = mask_prompt(&prompt_text);
    let raw_digest = prompt_digest(&prompt_text, digest_secret);

    CanonicalRequest {
        canonical_json,
        exact_key,
        prompt_text,
        masked_prompt: masked,
        raw_digest,
        pii_present,
    }
}

/// Concatenate all messages as `"<role>: <content>"` joined by newlines,
/// system messages included, order preserved.
pub fn extract_prompt(payload: &CreateChatCompletionPayload) -> String {
    payload
        .messages
        .iter()
        .map(|message| {
            let content = message
                .content
                .as_ref()
                .map(|c| c.as_text())
                .unwrap_or_default();
            format!("{}: {}", message.role, content)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Digest of the raw prompt: keyed HMAC-SHA256 when a secret is configured,
/// plain SHA-256 otherwise. Lowercase hex.
pub fn prompt_digest(prompt: &str, secret: Option<&[u8]>) -> String {
    match secret {
        Some(key) => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key)
                .expect("hmac accepts any key length");
            mac.update(prompt.as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        None => {
            let mut hasher = Sha256::new();
            hasher.update(prompt.as_bytes());
            hex::encode(hasher.finalize())
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn payload(messages: serde_json::Value) -> CreateChatCompletionPayload {
        serde_json::from_value(json!({"model": "gpt-4", "messages": messages})).unwrap()
    }

    #[test]
    fn prompt_extraction_is_role_tagged_and_ordered() {
        let payload = payload(json!([
            {"role": "system", "content": "You are terse."},
            {"role": "user", "content": "What is 2+2?"},
        ]));
        assert_eq!(
            extract_prompt(&payload),
            "system: You are terse.\nuser: What is 2+2?"
        );
    }

    #[test]
    fn canonicalize_produces_stable_exact_key() {
        let raw = json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]});
        let p = payload(json!([{"role": "user", "content": "hi"}]));
        let a = canonicalize(&raw, &p, None);
        let b = canonicalize(&raw, &p, None);
        assert_eq!(a.exact_key, b.exact_key);
        assert_eq!(a.exact_key.len(), 64);
    }

    #[test]
    fn keyed_and_plain_digests_differ() {
        let plain = prompt_digest("user: hello", None);
        let keyed = prompt_digest("user: hello", Some(b"secret"));
        assert_ne!(plain, keyed);
        assert_eq!(plain.len(), 64);
        assert_eq!(keyed.len(), 64);
    }

    #[test]
    fn masked_prompt_and_pii_flag_populated() {
        let raw = json!({
            "model": "gpt-4",
            "messages": [{"role": "user", "content": "Email bob@example.com the report"}],
        });
        let p = payload(json!([
            {"role": "user", "content": "Email bob@example.com the report"},
        ]));
        let canonical = canonicalize(&raw, &p, None);
        assert!(canonical.masked_prompt.contains("{EMAIL}"));
        assert!(canonical.pii_present);
    }
}
