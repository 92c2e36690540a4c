use axum::body::Body;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::json;
use std::convert::Infallible;
use std::time::Instant;
use tracing::info;

use crate::error::GatewayError;
use crate::server::AppState;
use crate::upstream::UpstreamError;
use crate::util::{extract_credentials, mask_credential};

const MAX_BATCH: usize = 50;
const PROBE_CONCURRENCY: usize = 10;

/// Probe every submitted credential and stream one verdict per credential as
/// soon as it is known, then `[DONE]`. Probes run in arrival-order batches
/// of ten; verdicts within a batch flush in completion order.
pub async fn handle_verify(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let credentials = extract_credentials(&headers);
    if credentials.is_empty() {
        return GatewayError::AuthMissing.into_response();
    }
    if credentials.len() > MAX_BATCH {
        return GatewayError::Validation(format!(
            "at most {} credentials per verification request",
            MAX_BATCH
        ))
        .into_response();
    }

    info!("Verifying {} credential(s)", credentials.len());
    let upstream = state.upstream.clone();

    let stream = async_stream::stream! {
        for batch in credentials.chunks(PROBE_CONCURRENCY) {
            let mut probes: FuturesUnordered<_> = batch
                .iter()
                .cloned()
                .map(|credential| {
                    let upstream = upstream.clone();
                    async move {
                        let started = Instant::now();
                        let outcome = upstream.probe(&credential).await;
                        let response_time = started.elapsed().as_millis() as u64;

                        let (status, error) = match outcome {
                            Ok(()) => ("GOOD", None),
                            Err(e @ (UpstreamError::Timeout | UpstreamError::Network(_))) => {
                                ("ERROR", Some(e.to_string()))
                            }
                            Err(e) => ("BAD", Some(e.to_string())),
                        };

                        let mut verdict = json!({
                            "key": mask_credential(&credential),
                            "status": status,
                            "responseTime": response_time,
                        });
                        if let Some(error) = error {
                            verdict["error"] = json!(error);
                        }
                        verdict
                    }
                })
                .collect();

            while let Some(verdict) = probes.next().await {
                yield Ok::<Bytes, Infallible>(Bytes::from(format!("data: {}\n\n", verdict)));
            }
        }
        yield Ok(Bytes::from_static(b"data: [DONE]\n\n"));
    };

    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .body(Body::from_stream(stream))
        .expect("static response headers")
}
