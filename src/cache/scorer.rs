//! Candidate guardrails and composite scoring.
//!
//! Guardrails are hard gates: a candidate failing any of them is dropped
//! before scoring. Scoring then combines semantic, structural, parameter and
//! recency components into one composite compared against the admission
//! threshold.
//!
//! The semantic component dominates (weight 0.6) deliberately: a
//! structurally identical masked template with a different concrete URL or
//! ID is the principal false-positive risk, and only the embedding can tell
//! those apart.

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::index::Candidate;
use crate::{
    api_types::ChatCompletionResponse,
    config::ModelCompatPolicy,
    fingerprint::{RequestMode, TemperatureBucket, model_family},
    validation,
};

const SEMANTIC_WEIGHT: f64 = 0.6;
const STRUCTURAL_WEIGHT: f64 = 0.2;
const PARAM_WEIGHT: f64 = 0.1;
const RECENCY_WEIGHT: f64 = 0.1;

/// Recency half-life-ish constant: e-folding time of one week, in hours.
const RECENCY_SCALE_HOURS: f64 = 168.0;

/// Threshold increase applied when scoring without the semantic component.
pub const DEGRADED_THRESHOLD_PENALTY: f64 = 0.05;

/// Why a candidate was dropped before scoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardrailRejection {
    ModeMismatch,
    ToolSchemaMismatch,
    ModelMismatch,
    SchemaValidationFailed,
    Expired,
}

impl GuardrailRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuardrailRejection::ModeMismatch => "mode_mismatch",
            GuardrailRejection::ToolSchemaMismatch => "tool_schema_mismatch",
            GuardrailRejection::ModelMismatch => "model_mismatch",
            GuardrailRejection::SchemaValidationFailed => "schema_validation_failed",
            GuardrailRejection::Expired => "expired",
        }
    }
}

/// Request-side facts the guardrails compare against.
#[derive(Debug, Clone)]
pub struct GuardContext<'a> {
    pub mode: RequestMode,
    pub tool_schema_hash: &'a str,
    pub model: &'a str,
    pub model_family: &'a str,
    pub compat: ModelCompatPolicy,
    /// The request's JSON schema when mode is JSON_SCHEMA.
    pub json_schema: Option<&'a Value>,
}

/// Enforce all guardrails against a candidate. All must pass.
pub fn enforce_guardrails(
    ctx: &GuardContext<'_>,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> Result<(), GuardrailRejection> {
    let entry = &candidate.entry;

    if entry.mode != ctx.mode {
        return Err(GuardrailRejection::ModeMismatch);
    }

    if entry.tool_schema_hash != ctx.tool_schema_hash {
        return Err(GuardrailRejection::ToolSchemaMismatch);
    }

    let model_ok = match ctx.compat {
        ModelCompatPolicy::Strict => entry.model == ctx.model,
        ModelCompatPolicy::Family => model_family(&entry.model) == ctx.model_family,
        ModelCompatPolicy::Any => true,
    };
    if !model_ok {
        return Err(GuardrailRejection::ModelMismatch);
    }

    if ctx.mode == RequestMode::JsonSchema {
        let schema = ctx.json_schema.ok_or(GuardrailRejection::SchemaValidationFailed)?;
        let content = cached_content(&entry.response_blob)
            .ok_or(GuardrailRejection::SchemaValidationFailed)?;
        if !validation::check_content(schema, &content).is_valid() {
            return Err(GuardrailRejection::SchemaValidationFailed);
        }
    }

    // Defense in depth against stale index rows.
    if entry.is_expired(now) {
        return Err(GuardrailRejection::Expired);
    }

    Ok(())
}

fn cached_content(response_blob: &Value) -> Option<String> {
    let response: ChatCompletionResponse = serde_json::from_value(response_blob.clone()).ok()?;
    response.first_content().map(str::to_string)
}

/// Component scores and their weighted combination.
#[derive(Debug, Clone, Copy)]
pub struct ScoreBreakdown {
    pub semantic: Option<f64>,
    pub structural: f64,
    pub param: f64,
    pub recency: f64,
    pub composite: f64,
}

/// Request-side parameters for scoring.
#[derive(Debug, Clone, Copy)]
pub struct ScoreInputs {
    pub temperature_bucket: TemperatureBucket,
    pub top_p: Option<f64>,
}

/// Score a candidate.
///
/// When the candidate carries no cosine similarity (embedder degraded), the
/// remaining weights are renormalized: structural 0.5, param 0.25,
/// recency 0.25. Callers raise the admission threshold by
/// [`DEGRADED_THRESHOLD_PENALTY`] in that case.
pub fn score_candidate(
    inputs: &ScoreInputs,
    candidate: &Candidate,
    now: DateTime<Utc>,
) -> ScoreBreakdown {
    let entry = &candidate.entry;

    let structural = 1.0 - f64::from(candidate.hamming) / 64.0;
    let semantic = candidate.cosine_similarity.map(|cos| (cos + 1.0) / 2.0);

    let candidate_top_p = entry.request_blob.get("top_p").and_then(Value::as_f64);
    let param = (temperature_closeness(inputs.temperature_bucket, entry.temperature_bucket)
        + top_p_closeness(inputs.top_p, candidate_top_p))
        / 2.0;

    let age_hours = entry.age_seconds(now) as f64 / 3600.0;
    let recency = (-age_hours / RECENCY_SCALE_HOURS).exp();

    let composite = match semantic {
        Some(semantic) => {
            SEMANTIC_WEIGHT * semantic
                + STRUCTURAL_WEIGHT * structural
                + PARAM_WEIGHT * param
                + RECENCY_WEIGHT * recency
        }
        None => {
            let total = STRUCTURAL_WEIGHT + PARAM_WEIGHT + RECENCY_WEIGHT;
            (STRUCTURAL_WEIGHT * structural + PARAM_WEIGHT * param + RECENCY_WEIGHT * recency)
                / total
        }
    };

    ScoreBreakdown {
        semantic,
        structural,
        param,
        recency,
        composite,
    }
}

/// 1.0 for equal buckets, 0.5 for adjacent buckets in the ordered list,
/// 0.0 otherwise.
pub fn temperature_closeness(a: TemperatureBucket, b: TemperatureBucket) -> f64 {
    let distance = (i16::from(a.ordinal()) - i16::from(b.ordinal())).abs();
    match distance {
        0 => 1.0,
        1 => 0.5,
        _ => 0.0,
    }
}

/// 1.0 when both are at the default, 1.0 when within 1e-2 of each other,
/// 0.8 otherwise.
pub fn top_p_closeness(a: Option<f64>, b: Option<f64>) -> f64 {
    let a = a.unwrap_or(1.0);
    let b = b.unwrap_or(1.0);
    let both_default = (a - 1.0).abs() < 1e-9 && (b - 1.0).abs() < 1e-9;
    if both_default || (a - b).abs() <= 1e-2 {
        1.0
    } else {
        0.8
    }
}
