use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::warn;
use uuid::Uuid;

use super::response::{concat_text_parts, map_finish_reason};
use crate::model_mapping::to_inbound_model;
use crate::upstream::UpstreamError;

/// Translate an upstream `streamGenerateContent?alt=sse` byte stream into
/// Chat Completions chunk events.
///
/// Each upstream `data:` event yields exactly one downstream
/// `chat.completion.chunk` event; the downstream stream ends with a single
/// `data: [DONE]` frame. An upstream event that fails to parse is logged and
/// skipped without ending the stream. Upstream transport errors are passed
/// through so the caller can close the response early.
pub fn translate_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>>,
    inbound_model: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, UpstreamError>> + Send>> {
    let stream_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();
    let model = to_inbound_model(&inbound_model).to_string();

    Box::pin(async_stream::stream! {
        let mut buffer = BytesMut::new();

        loop {
            match upstream.next().await {
                Some(Ok(bytes)) => {
                    buffer.extend_from_slice(&bytes);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        let Ok(line) = std::str::from_utf8(&line_raw) else {
                            warn!("Skipping non-UTF-8 upstream stream line");
                            continue;
                        };
                        if let Some(chunk) = translate_line(line, &stream_id, created, &model) {
                            yield Ok(chunk);
                        }
                    }
                }
                Some(Err(e)) => {
                    yield Err(e);
                    return;
                }
                None => break,
            }
        }

        // Upstream may close without a trailing newline on the last event.
        if !buffer.is_empty() {
            if let Ok(line) = std::str::from_utf8(&buffer) {
                let line = line.to_string();
                if let Some(chunk) = translate_line(&line, &stream_id, created, &model) {
                    yield Ok(chunk);
                }
            }
        }

        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    })
}

fn translate_line(line: &str, stream_id: &str, created: i64, model: &str) -> Option<Bytes> {
    let line = line.trim();
    let payload = line.strip_prefix("data: ")?.trim();
    if payload == "[DONE]" {
        return None;
    }

    let event: Value = match serde_json::from_str(payload) {
        Ok(event) => event,
        Err(e) => {
            warn!("Skipping malformed upstream stream event: {}", e);
            return None;
        }
    };

    let candidate = event
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first());

    let (delta, finish_reason) = match candidate {
        Some(candidate) => {
            let text = concat_text_parts(candidate);
            let delta = if text.is_empty() {
                json!({})
            } else {
                json!({ "content": text })
            };
            let finish = map_finish_reason(candidate.get("finishReason").and_then(|r| r.as_str()));
            (delta, finish)
        }
        None => (json!({}), None),
    };

    let chunk = json!({
        "id": stream_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish_reason,
        }],
    });

    Some(Bytes::from(format!("data: {}\n\n", chunk)))
}
