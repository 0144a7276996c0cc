//! Miss passthrough: tee upstream SSE bytes to the client while reassembling
//! the full response for write-through.
//!
//! Bytes flow to the client unmodified. Each chunk also lands in an
//! in-memory buffer; when the stream ends cleanly after a terminal `[DONE]`
//! marker, the buffered frames are reassembled into a non-streaming chat
//! completion and handed to the completion callback. A client disconnect
//! drops the stream mid-flight, the callback never fires, and the partial
//! buffer is discarded — incomplete streams must not produce cache entries.

use std::{
    pin::Pin,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures_util::Stream;
use serde_json::{Value, json};

/// Callback invoked with the reassembled response after a clean terminal
/// marker.
pub type CaptureCallback = Box<dyn FnOnce(Value) + Send>;

/// Stream adapter that forwards upstream bytes and captures them.
pub struct CaptureStream<S> {
    inner: S,
    buffer: Vec<u8>,
    saw_done: bool,
    errored: bool,
    on_complete: Option<CaptureCallback>,
}

impl<S> CaptureStream<S> {
    pub fn new(inner: S, on_complete: CaptureCallback) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            saw_done: false,
            errored: false,
            on_complete: Some(on_complete),
        }
    }
}

impl<S, E> Stream for CaptureStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                self.buffer.extend_from_slice(&bytes);
                if !self.saw_done && contains_done_marker(&self.buffer) {
                    self.saw_done = true;
                }
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => {
                // Upstream error: propagate verbatim, never cache.
                self.errored = true;
                self.on_complete = None;
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if self.saw_done
                    && !self.errored
                    && let Some(callback) = self.on_complete.take()
                    && let Some(response) = reassemble(&self.buffer)
                {
                    callback(response);
                }
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

fn contains_done_marker(buffer: &[u8]) -> bool {
    // The marker always appears on its own `data:` line.
    buffer
        .windows(b"data: [DONE]".len())
        .any(|w| w == b"data: [DONE]")
        || buffer.windows(b"data:[DONE]".len()).any(|w| w == b"data:[DONE]")
}

/// Reassemble a buffered SSE stream into a non-streaming chat completion.
///
/// Walks every `data:` frame, concatenating delta content for choice 0 and
/// carrying id/created/model from the first chunk, role from the first delta
/// that has one, finish reason from the last, and usage if any frame
/// reported it. Returns None when no parseable chunk was seen.
pub fn reassemble(buffer: &[u8]) -> Option<Value> {
    let text = String::from_utf8_lossy(buffer);

    let mut id = None;
    let mut created = None;
    let mut model = None;
    let mut role: Option<String> = None;
    let mut content = String::new();
    let mut finish_reason: Option<String> = None;
    let mut usage: Option<Value> = None;

    for line in text.lines() {
        let Some(payload) = line.strip_prefix("data:").map(str::trim) else {
            continue;
        };
        if payload == "[DONE]" {
            break;
        }
        let Ok(frame) = serde_json::from_str::<Value>(payload) else {
            continue;
        };

        if id.is_none() {
            id = frame.get("id").and_then(Value::as_str).map(str::to_string);
            created = frame.get("created").and_then(Value::as_i64);
            model = frame.get("model").and_then(Value::as_str).map(str::to_string);
        }
        if let Some(u) = frame.get("usage").filter(|u| !u.is_null()) {
            usage = Some(u.clone());
        }

        let Some(choice) = frame
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
        else {
            continue;
        };
        if let Some(delta) = choice.get("delta") {
            if role.is_none() {
                role = delta.get("role").and_then(Value::as_str).map(str::to_string);
            }
            if let Some(piece) = delta.get("content").and_then(Value::as_str) {
                content.push_str(piece);
            }
        }
        if let Some(reason) = choice.get("finish_reason").and_then(Value::as_str) {
            finish_reason = Some(reason.to_string());
        }
    }

    let id = id?;

    let mut response = json!({
        "id": id,
        "object": "chat.completion",
        "created": created.unwrap_or_default(),
        "model": model.unwrap_or_default(),
        "choices": [{
            "index": 0,
            "message": {
                "role": role.unwrap_or_else(|| "assistant".to_string()),
                "content": content,
            },
            "finish_reason": finish_reason.unwrap_or_else(|| "stop".to_string()),
        }],
    });
    if let Some(usage) = usage {
        response["usage"] = usage;
    }
    Some(response)
}
