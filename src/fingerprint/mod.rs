//! Request fingerprinting: SimHash, request mode, temperature bucket, model
//! family and tool-schema identity.

mod simhash;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
pub use simhash::{hamming, simhash};

use crate::{
    api_types::{CreateChatCompletionPayload, ResponseFormat},
    canonical::{CanonicalRequest, canonicalize_value, to_canonical_json},
};

/// Sentinel tool-schema hash for requests without tools.
pub const NO_TOOLS: &str = "none";

/// Request mode. Cached entries only ever match requests of the same mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestMode {
    Text,
    JsonObject,
    JsonSchema,
    Tools,
    Function,
}

impl RequestMode {
    /// Detect the mode of a request. Priority: JSON_SCHEMA > JSON_OBJECT >
    /// TOOLS > FUNCTION > TEXT.
    pub fn detect(payload: &CreateChatCompletionPayload) -> Self {
        match &payload.response_format {
            Some(ResponseFormat::JsonSchema { .. }) => return RequestMode::JsonSchema,
            Some(ResponseFormat::JsonObject) => return RequestMode::JsonObject,
            _ => {}
        }
        if payload.tools.as_ref().is_some_and(|t| !t.is_empty()) {
            return RequestMode::Tools;
        }
        if payload.functions.as_ref().is_some_and(|f| !f.is_empty()) {
            return RequestMode::Function;
        }
        RequestMode::Text
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestMode::Text => "text",
            RequestMode::JsonObject => "json_object",
            RequestMode::JsonSchema => "json_schema",
            RequestMode::Tools => "tools",
            RequestMode::Function => "function",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "text" => Some(RequestMode::Text),
            "json_object" => Some(RequestMode::JsonObject),
            "json_schema" => Some(RequestMode::JsonSchema),
            "tools" => Some(RequestMode::Tools),
            "function" => Some(RequestMode::Function),
            _ => None,
        }
    }
}

/// Temperature bucket, ordered from coldest to hottest. Adjacency in this
/// order drives the parameter-closeness score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemperatureBucket {
    Zero,
    Low,
    Medium,
    High,
    Default,
    VeryHigh,
}

impl TemperatureBucket {
    /// Bucket a temperature. `None` means the documented default of 1.0.
    pub fn from_temperature(temperature: Option<f64>) -> Self {
        let t = temperature.unwrap_or(1.0);
        if t < 0.01 {
            TemperatureBucket::Zero
        } else if t < 0.3 {
            TemperatureBucket::Low
        } else if t < 0.7 {
            TemperatureBucket::Medium
        } else if t < 0.9 {
            TemperatureBucket::High
        } else if (t - 1.0).abs() < 0.01 {
            TemperatureBucket::Default
        } else {
            TemperatureBucket::VeryHigh
        }
    }

    /// Position in the ordered bucket list.
    pub fn ordinal(&self) -> u8 {
        match self {
            TemperatureBucket::Zero => 0,
            TemperatureBucket::Low => 1,
            TemperatureBucket::Medium => 2,
            TemperatureBucket::High => 3,
            TemperatureBucket::Default => 4,
            TemperatureBucket::VeryHigh => 5,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TemperatureBucket::Zero => "zero",
            TemperatureBucket::Low => "low",
            TemperatureBucket::Medium => "medium",
            TemperatureBucket::High => "high",
            TemperatureBucket::Default => "default",
            TemperatureBucket::VeryHigh => "very_high",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "zero" => Some(TemperatureBucket::Zero),
            "low" => Some(TemperatureBucket::Low),
            "medium" => Some(TemperatureBucket::Medium),
            "high" => Some(TemperatureBucket::High),
            "default" => Some(TemperatureBucket::Default),
            "very_high" => Some(TemperatureBucket::VeryHigh),
            _ => None,
        }
    }
}

static MODEL_SUFFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"-(\d{4}(-\d{2}){0,2}|\d{8}|v\d+(\.\d+)*|preview|latest|beta)$")
        .expect("static model-suffix regex")
});

/// Derive the model family by stripping trailing date and version suffixes.
///
/// `gpt-4-2024-05-13`, `gpt-4-0613` and `gpt-4-preview` all map to `gpt-4`.
pub fn model_family(model: &str) -> String {
    let mut family = model;
    loop {
        match MODEL_SUFFIX.find(family) {
            Some(m) if m.start() > 0 => family = &family[..m.start()],
            _ => break,
        }
    }
    family.to_string()
}

/// Hash the tool schemas of a request.
///
/// Each active tool definition is canonicalized (keys sorted, nulls
/// dropped), the list is sorted by tool name, and the serialized list is
/// hashed. Requests without tools get the `"none"` sentinel.
pub fn tool_schema_hash(payload: &CreateChatCompletionPayload) -> String {
    let mut named: Vec<(String, serde_json::Value)> = Vec::new();

    if let Some(tools) = payload.tools.as_ref().filter(|t| !t.is_empty()) {
        for tool in tools {
            let value = serde_json::to_value(tool).unwrap_or_default();
            named.push((tool.function.name.clone(), canonicalize_value(&value)));
        }
    } else if let Some(functions) = payload.functions.as_ref().filter(|f| !f.is_empty()) {
        for function in functions {
            let value = serde_json::to_value(function).unwrap_or_default();
            named.push((function.name.clone(), canonicalize_value(&value)));
        }
    } else {
        return NO_TOOLS.to_string();
    }

    named.sort_by(|a, b| a.0.cmp(&b.0));
    let list: Vec<serde_json::Value> = named.into_iter().map(|(_, v)| v).collect();
    let serialized = to_canonical_json(&serde_json::Value::Array(list));

    let mut hasher = Sha256::new();
    hasher.update(serialized.as_bytes());
    hex::encode(hasher.finalize())
}

/// The derived fingerprint of a request. The embedding is produced
/// separately because it requires an embedder round-trip.
#[derive(Debug, Clone)]
pub struct Fingerprint {
    pub simhash: i64,
    pub mode: RequestMode,
    pub temperature_bucket: TemperatureBucket,
    pub model_family: String,
    pub tool_schema_hash: String,
    pub top_p: Option<f64>,
}

impl Fingerprint {
    /// Assemble the CPU-only parts of the fingerprint.
    pub fn derive(payload: &CreateChatCompletionPayload, canonical: &CanonicalRequest) -> Self {
        Self {
            simhash: simhash(&canonical.masked_prompt),
            mode: RequestMode::detect(payload),
            temperature_bucket: TemperatureBucket::from_temperature(payload.temperature),
            model_family: model_family(&payload.model),
            tool_schema_hash: tool_schema_hash(payload),
            top_p: payload.top_p,
        }
    }
}
