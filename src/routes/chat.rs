//! `POST /v1/chat/completions`: the cache-or-forward request path.
//!
//! Control flow: canonicalize → fingerprint → two-tier lookup → on hit,
//! serve the cached response (deterministic SSE replay when streaming) —
//! on miss, forward upstream, pass the reply through verbatim, and
//! write-through successful responses in the background.

use axum::{
    Json,
    body::Body,
    extract::State,
    response::{IntoResponse, Response},
};
use http::{HeaderMap, StatusCode, header};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::debug;
use validator::Validate;

use super::{
    error::ApiError,
    headers::{apply_provenance, directives_from, tenant_from},
};
use crate::{
    api_types::CreateChatCompletionPayload,
    cache::{CacheHit, LookupOutcome},
    observability::metrics,
    providers::UpstreamReply,
    replay::{self, passthrough::CaptureStream},
    state::AppState,
};

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(raw): Json<Value>,
) -> Result<Response, ApiError> {
    let payload: CreateChatCompletionPayload =
        serde_json::from_value(raw.clone()).map_err(|e| ApiError::InvalidRequest(e.to_string()))?;
    payload
        .validate()
        .map_err(|e| ApiError::InvalidRequest(e.to_string()))?;

    let tenant = tenant_from(&headers);
    let directives = directives_from(&headers);
    if let Some(tag) = &directives.experiment {
        debug!(experiment = %tag, "cache experiment tagged request");
    }

    let mut ctx = state.engine.prepare(tenant, raw.clone(), &payload);

    match state.engine.lookup(&mut ctx, &directives).await {
        LookupOutcome::Hit(hit) => {
            if hit.provenance.degradation.is_degraded() {
                metrics::record_degraded_request(hit.provenance.degradation.as_str());
            }
            if payload.stream {
                serve_replay(*hit)
            } else {
                Ok(serve_buffered_hit(*hit))
            }
        }
        LookupOutcome::Miss { degradation } => {
            if degradation.is_degraded() {
                metrics::record_degraded_request(degradation.as_str());
            }
            let reply = state
                .providers
                .forward(&payload.model, &raw, payload.stream)
                .await?;
            let provenance = state.engine.miss_provenance();

            match reply {
                UpstreamReply::Json { status, body } => {
                    // Write through successful responses only; provider
                    // errors pass through verbatim and are never cached.
                    if status.is_success() && directives.store {
                        match serde_json::from_slice::<Value>(&body) {
                            Ok(response_value) => {
                                state.engine.spawn_write_through(ctx, response_value);
                            }
                            Err(e) => debug!(error = %e, "upstream body not JSON, not caching"),
                        }
                    }

                    let mut response = Response::builder()
                        .status(status)
                        .header(header::CONTENT_TYPE, "application/json")
                        .body(Body::from(body))
                        .map_err(|e| ApiError::Internal(e.to_string()))?;
                    apply_provenance(&mut response, &provenance);
                    Ok(response)
                }
                UpstreamReply::Stream { status, body } => {
                    let engine = state.engine.clone();
                    let store = directives.store;
                    let capture: replay::passthrough::CaptureCallback =
                        Box::new(move |response| {
                            if store {
                                engine.spawn_write_through(ctx, response);
                            }
                        });
                    let captured = CaptureStream::new(body, capture);

                    let mut response = Response::builder()
                        .status(status)
                        .header(header::CONTENT_TYPE, "text/event-stream")
                        .header(header::CACHE_CONTROL, "no-cache")
                        .body(Body::from_stream(captured))
                        .map_err(|e| ApiError::Internal(e.to_string()))?;
                    apply_provenance(&mut response, &provenance);
                    Ok(response)
                }
            }
        }
    }
}

/// Serve a non-streaming hit straight from the cached blob.
fn serve_buffered_hit(hit: CacheHit) -> Response {
    let provenance = hit.provenance.clone();
    let mut response = (StatusCode::OK, Json(hit.response)).into_response();
    apply_provenance(&mut response, &provenance);
    response
}

/// Serve a streaming hit as a deterministic SSE replay.
///
/// The emitter task sleeps between chunks; when the client disconnects the
/// receiver drops, the next send fails, and the task stops emitting.
fn serve_replay(hit: CacheHit) -> Result<Response, ApiError> {
    let plan = replay::plan_replay(&hit.response, &hit.replay_key)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let chunk_count = plan.frames.len();

    let (tx, rx) = mpsc::channel::<Result<bytes::Bytes, std::io::Error>>(8);
    tokio::spawn(async move {
        for (frame, delay_ms) in plan.frames.into_iter().zip(plan.delays_ms) {
            if delay_ms > 0 {
                tokio::time::sleep(std::time::Duration::from_millis(delay_ms)).await;
            }
            let event = bytes::Bytes::from(format!("data: {frame}\n\n"));
            if tx.send(Ok(event)).await.is_err() {
                // Client went away; stop emitting.
                return;
            }
        }
        metrics::record_replay(chunk_count);
    });

    let provenance = hit.provenance;
    let mut response = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(ReceiverStream::new(rx)))
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    apply_provenance(&mut response, &provenance);
    Ok(response)
}
