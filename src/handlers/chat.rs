use axum::body::Body;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::GatewayError;
use crate::mappers::openai::{
    to_chat_response, to_upstream_request, translate_sse_stream, ChatCompletionRequest,
};
use crate::model_mapping::to_upstream_model;
use crate::pool::CredentialPool;
use crate::server::AppState;
use crate::util::{extract_credentials, mask_credential};

/// Settles the health outcome of one attempt exactly once and releases the
/// in-flight hold taken at selection. Dropping it unsettled means the client
/// went away mid-call or mid-stream: that counts as a failure, never a
/// success.
struct AttemptOutcome {
    pool: Arc<CredentialPool>,
    credential: String,
    settled: bool,
}

impl AttemptOutcome {
    fn new(pool: Arc<CredentialPool>, credential: String) -> Self {
        Self {
            pool,
            credential,
            settled: false,
        }
    }

    fn settle(&mut self, success: bool) {
        if self.settled {
            return;
        }
        self.settled = true;
        if success {
            self.pool.record_success(&self.credential);
        } else {
            self.pool.record_failure(&self.credential);
        }
        self.pool.release(&self.credential);
    }
}

impl Drop for AttemptOutcome {
    fn drop(&mut self) {
        if !self.settled {
            debug!(
                "Attempt with {} cancelled before completion, recording failure",
                mask_credential(&self.credential)
            );
            self.settle(false);
        }
    }
}

pub async fn handle_chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    // Parse by hand so malformed bodies get the uniform error document
    // instead of the extractor's plain-text rejection.
    let body: Value = match serde_json::from_slice(&body) {
        Ok(value) => value,
        Err(e) => {
            return GatewayError::Validation(format!("malformed JSON body: {}", e))
                .into_response()
        }
    };
    match chat_completions(state, headers, body).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn chat_completions(
    state: AppState,
    headers: HeaderMap,
    body: Value,
) -> Result<Response, GatewayError> {
    if !body.is_object() {
        return Err(GatewayError::Validation(
            "request body must be a JSON object".to_string(),
        ));
    }
    let request: ChatCompletionRequest = serde_json::from_value(body)
        .map_err(|e| GatewayError::Validation(format!("invalid request: {}", e)))?;
    if request.messages.is_empty() {
        return Err(GatewayError::Validation(
            "`messages` must be a non-empty list".to_string(),
        ));
    }

    let credentials = extract_credentials(&headers);
    if credentials.is_empty() {
        return Err(GatewayError::AuthMissing);
    }
    state.pool.register_all(&credentials);

    let upstream_body = to_upstream_request(&request);
    let upstream_model = to_upstream_model(&request.model).to_string();
    info!(
        "Chat request: {} -> {} | {} message(s) | {} credential(s) | stream: {}",
        request.model,
        upstream_model,
        request.messages.len(),
        credentials.len(),
        request.stream
    );

    // Failover loop: at most one attempt per inbound credential, never
    // repeating one within this request.
    let mut remaining = credentials;
    let mut last_err: Option<GatewayError> = None;

    while !remaining.is_empty() {
        let credential = match state.pool.select(&remaining) {
            Ok(credential) => credential,
            // Nothing selectable anymore; the most recent upstream error is
            // more useful to the caller than the generic advisory.
            Err(select_err) => return Err(last_err.take().unwrap_or(select_err)),
        };
        remaining.retain(|c| c != &credential);
        debug!("Attempting with credential {}", mask_credential(&credential));
        let mut outcome = AttemptOutcome::new(state.pool.clone(), credential.clone());

        if request.stream {
            match state
                .upstream
                .stream_generate_content(&upstream_model, &upstream_body, &credential)
                .await
            {
                Ok(stream) => {
                    return Ok(stream_response(
                        request.model.clone(),
                        credential,
                        outcome,
                        Box::pin(stream),
                    ));
                }
                Err(e) => {
                    outcome.settle(false);
                    if e.is_failover_eligible() && !remaining.is_empty() {
                        warn!(
                            "Credential {} failed ({}), failing over",
                            mask_credential(&credential),
                            e
                        );
                        last_err = Some(e.into());
                        continue;
                    }
                    return Err(e.into());
                }
            }
        }

        match state
            .upstream
            .generate_content(&upstream_model, &upstream_body, &credential)
            .await
        {
            Ok(upstream_response) => {
                outcome.settle(true);
                let response = to_chat_response(&upstream_response, &request.model);
                return Ok((
                    StatusCode::OK,
                    [("X-Selected-Credential", mask_credential(&credential))],
                    Json(response),
                )
                    .into_response());
            }
            Err(e) => {
                outcome.settle(false);
                if e.is_failover_eligible() && !remaining.is_empty() {
                    warn!(
                        "Credential {} failed ({}), failing over",
                        mask_credential(&credential),
                        e
                    );
                    last_err = Some(e.into());
                    continue;
                }
                return Err(e.into());
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| GatewayError::ServiceUnavailable("all credentials failed".to_string())))
}

/// Build the SSE response once upstream bytes are flowing. From this point
/// on failover is off the table: errors close the stream early and are
/// recorded against the credential.
fn stream_response(
    inbound_model: String,
    credential: String,
    mut outcome: AttemptOutcome,
    upstream_stream: std::pin::Pin<
        Box<dyn futures::Stream<Item = Result<Bytes, crate::upstream::UpstreamError>> + Send>,
    >,
) -> Response {
    let masked = mask_credential(&credential);
    let mut translated = translate_sse_stream(upstream_stream, inbound_model);

    let body_stream = async_stream::stream! {
        let mut failed = false;
        while let Some(item) = translated.next().await {
            match item {
                Ok(bytes) => yield Ok::<Bytes, Infallible>(bytes),
                Err(e) => {
                    warn!("Mid-stream upstream error: {}", e);
                    failed = true;
                    break;
                }
            }
        }
        outcome.settle(!failed);
    };

    Response::builder()
        .header("Content-Type", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .header("Connection", "keep-alive")
        .header("X-Accel-Buffering", "no")
        .header("X-Selected-Credential", masked)
        .body(Body::from_stream(body_stream))
        .expect("static response headers")
}
