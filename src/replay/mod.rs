//! Streaming of cached and live responses.
//!
//! Cached hits replay as a deterministic SSE sequence: the chunk texts, the
//! frame payloads and the planned delays are all a pure function of the
//! cache entry key (§ deterministic replay). Misses stream through from the
//! upstream provider while a capture buffer reassembles the full response
//! for write-through.

mod chunker;
pub mod passthrough;

pub use chunker::{ChunkPlan, plan_chunks, replay_seed};
use serde_json::Value;
use thiserror::Error;

use crate::api_types::{ChatCompletionChunk, ChatCompletionResponse, ChunkChoice, Delta};

/// Default inter-chunk delay for cached-hit replay: half the live pacing of
/// roughly 50 ms.
pub const HIT_DELAY_MEAN_MS: f64 = 25.0;

/// Errors preparing a replay.
#[derive(Debug, Error)]
pub enum ReplayError {
    #[error("cached response is not a chat completion: {0}")]
    MalformedResponse(String),
}

/// A fully planned SSE replay: the `data:` payloads in order, each paired
/// with the delay to sleep before emitting it. The trailing `[DONE]` frame
/// is included as its literal payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayPlan {
    pub frames: Vec<String>,
    pub delays_ms: Vec<u64>,
}

/// Plan the deterministic replay of a cached response.
///
/// Frame payloads mirror the upstream chunk schema: the cached response's
/// id, created and model are carried over (never re-stamped, so replays are
/// byte-identical), the first delta carries the role, and the final delta
/// carries the finish reason before `[DONE]`.
pub fn plan_replay(response: &Value, replay_key: &str) -> Result<ReplayPlan, ReplayError> {
    let parsed: ChatCompletionResponse = serde_json::from_value(response.clone())
        .map_err(|e| ReplayError::MalformedResponse(e.to_string()))?;

    let choice = parsed
        .choices
        .first()
        .ok_or_else(|| ReplayError::MalformedResponse("response has no choices".to_string()))?;
    let content = choice.message.content.clone().unwrap_or_default();
    let role = choice.message.role.clone();
    let finish_reason = choice.finish_reason.clone().unwrap_or_else(|| "stop".to_string());

    let chunk_plan = plan_chunks(replay_key, &content, HIT_DELAY_MEAN_MS);

    let mut frames = Vec::with_capacity(chunk_plan.chunks.len() + 2);
    let mut delays_ms = Vec::with_capacity(chunk_plan.chunks.len() + 2);

    for (i, chunk) in chunk_plan.chunks.iter().enumerate() {
        let delta = Delta {
            role: (i == 0).then(|| role.clone()),
            content: Some(chunk.clone()),
            tool_calls: None,
        };
        frames.push(frame_payload(&parsed, delta, None)?);
        delays_ms.push(chunk_plan.delays_ms[i]);
    }

    // Terminal delta with the finish reason, then the [DONE] marker.
    let closing = Delta {
        // An empty response still announces the role once.
        role: chunk_plan.chunks.is_empty().then(|| role.clone()),
        content: None,
        tool_calls: None,
    };
    frames.push(frame_payload(&parsed, closing, Some(finish_reason))?);
    delays_ms.push(0);
    frames.push("[DONE]".to_string());
    delays_ms.push(0);

    Ok(ReplayPlan { frames, delays_ms })
}

fn frame_payload(
    response: &ChatCompletionResponse,
    delta: Delta,
    finish_reason: Option<String>,
) -> Result<String, ReplayError> {
    let chunk = ChatCompletionChunk {
        id: response.id.clone(),
        object: "chat.completion.chunk".to_string(),
        created: response.created,
        model: response.model.clone(),
        choices: vec![ChunkChoice {
            index: 0,
            delta,
            finish_reason,
        }],
    };
    serde_json::to_string(&chunk).map_err(|e| ReplayError::MalformedResponse(e.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn cached_response(content: &str) -> Value {
        json!({
            "id": "chatcmpl-abc123",
            "object": "chat.completion",
            "created": 1_700_000_000,
            "model": "gpt-4",
            "choices": [{
                "index": 0,
                "message": {"role": "assistant", "content": content},
                "finish_reason": "stop",
            }],
            "usage": {"prompt_tokens": 5, "completion_tokens": 10, "total_tokens": 15},
        })
    }

    #[test]
    fn two_replays_are_byte_identical() {
        let response = cached_response(&"code flows like water finding its path ".repeat(10));
        let a = plan_replay(&response, "entry-key").unwrap();
        let b = plan_replay(&response, "entry-key").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn frames_reconstruct_content() {
        let content = "Silent keys at night\nlogic blooms in the buffer\ntests go green at dawn";
        let response = cached_response(content);
        let plan = plan_replay(&response, "k").unwrap();

        let mut reassembled = String::new();
        for frame in &plan.frames {
            if frame == "[DONE]" {
                continue;
            }
            let chunk: ChatCompletionChunk = serde_json::from_str(frame).unwrap();
            if let Some(text) = &chunk.choices[0].delta.content {
                reassembled.push_str(text);
            }
        }
        assert_eq!(reassembled, content);
    }

    #[test]
    fn first_frame_carries_role_and_last_carries_finish() {
        let response = cached_response("one two three");
        let plan = plan_replay(&response, "k").unwrap();

        let first: ChatCompletionChunk = serde_json::from_str(&plan.frames[0]).unwrap();
        assert_eq!(first.choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(first.object, "chat.completion.chunk");

        let last_payload = &plan.frames[plan.frames.len() - 2];
        let last: ChatCompletionChunk = serde_json::from_str(last_payload).unwrap();
        assert_eq!(last.choices[0].finish_reason.as_deref(), Some("stop"));
        assert!(last.choices[0].delta.content.is_none());

        assert_eq!(plan.frames.last().map(String::as_str), Some("[DONE]"));
    }

    #[test]
    fn replay_preserves_cached_id_and_created() {
        let response = cached_response("hello world");
        let plan = plan_replay(&response, "k").unwrap();
        let first: ChatCompletionChunk = serde_json::from_str(&plan.frames[0]).unwrap();
        assert_eq!(first.id, "chatcmpl-abc123");
        assert_eq!(first.created, 1_700_000_000);
        assert_eq!(first.model, "gpt-4");
    }

    #[test]
    fn different_entries_chunk_differently() {
        let response = cached_response(&"word ".repeat(120));
        let a = plan_replay(&response, "entry-a").unwrap();
        let b = plan_replay(&response, "entry-b").unwrap();
        assert_ne!(a.frames, b.frames);
    }

    #[test]
    fn malformed_response_is_an_error() {
        let result = plan_replay(&json!({"not": "a completion"}), "k");
        assert!(matches!(result, Err(ReplayError::MalformedResponse(_))));
    }
}
