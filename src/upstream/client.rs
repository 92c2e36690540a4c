use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::GatewayError;
use crate::model_mapping::DEFAULT_UPSTREAM_MODEL;
use crate::util::mask_credential;

/// Per-probe budget used by the batch credential validator.
const PROBE_TIMEOUT: Duration = Duration::from_secs(15);

/// Upstream statuses that are never worth retrying within one credential.
const NON_RETRYABLE_STATUSES: [u16; 4] = [400, 401, 403, 404];

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("upstream call exceeded its time budget")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("upstream returned status {code}")]
    Status { code: u16, body: String },

    #[error("upstream rejected the credential with status {code}")]
    CredentialRejected { code: u16, body: String },

    #[error("malformed upstream response: {0}")]
    Parse(String),
}

impl UpstreamError {
    fn from_status(code: u16, body: String) -> Self {
        if code == 401 || code == 403 {
            Self::CredentialRejected { code, body }
        } else {
            Self::Status { code, body }
        }
    }

    /// Whether the unary call may retry this error on the same credential.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) => true,
            Self::Status { code, .. } => !NON_RETRYABLE_STATUSES.contains(code),
            Self::CredentialRejected { .. } | Self::Parse(_) => false,
        }
    }

    /// Whether the orchestrator should try another credential after this.
    pub fn is_failover_eligible(&self) -> bool {
        match self {
            Self::Timeout | Self::Network(_) | Self::Parse(_) | Self::CredentialRejected { .. } => {
                true
            }
            Self::Status { code, .. } => *code == 429 || *code >= 500,
        }
    }
}

impl From<UpstreamError> for GatewayError {
    fn from(err: UpstreamError) -> Self {
        match err {
            UpstreamError::Timeout => GatewayError::Timeout,
            UpstreamError::Network(e) => GatewayError::Network(e),
            UpstreamError::Status { code: 429, body } => GatewayError::RateLimited { body },
            UpstreamError::Status { code, body }
            | UpstreamError::CredentialRejected { code, body } => {
                GatewayError::UpstreamStatus { code, body }
            }
            UpstreamError::Parse(e) => GatewayError::Parse(e),
        }
    }
}

/// Thin client over the Generative Language `generateContent` endpoint
/// family. One instance is shared across all handlers.
pub struct UpstreamClient {
    client: Client,
    base_url: String,
    api_version: String,
    timeout: Duration,
    retry_count: u32,
    retry_delay: Duration,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .build()
            .expect("Failed to create upstream HTTP client");

        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_version: config.api_version.clone(),
            timeout: Duration::from_millis(config.timeout_ms),
            retry_count: config.retry_count,
            retry_delay: Duration::from_millis(config.retry_delay_ms),
        }
    }

    fn build_url(&self, model: &str, method: &str, query_string: Option<&str>) -> String {
        let url = format!(
            "{}/{}/models/{}:{}",
            self.base_url, self.api_version, model, method
        );
        match query_string {
            Some(qs) => format!("{}?{}", url, qs),
            None => url,
        }
    }

    /// One POST with the per-call budget applied; expiry drops the request,
    /// which cancels it at the transport level.
    async fn send(
        &self,
        url: &str,
        credential: &str,
        body: &Value,
        budget: Duration,
    ) -> Result<reqwest::Response, UpstreamError> {
        let request = self
            .client
            .post(url)
            .header("x-goog-api-key", credential)
            .json(body)
            .send();
        match tokio::time::timeout(budget, request).await {
            Err(_) => Err(UpstreamError::Timeout),
            Ok(Err(e)) => Err(UpstreamError::Network(e.to_string())),
            Ok(Ok(response)) => Ok(response),
        }
    }

    /// Buffered `generateContent` call with retry on transient errors.
    pub async fn generate_content(
        &self,
        model: &str,
        body: &Value,
        credential: &str,
    ) -> Result<Value, UpstreamError> {
        let url = self.build_url(model, "generateContent", None);
        let mut last_err = UpstreamError::Network("no attempt made".to_string());

        for attempt in 0..=self.retry_count {
            if attempt > 0 {
                // Linear backoff: delay grows with each retry.
                let delay = self.retry_delay * attempt;
                debug!(
                    "Retrying upstream call for {} in {:?} (attempt {}/{})",
                    mask_credential(credential),
                    delay,
                    attempt + 1,
                    self.retry_count + 1
                );
                tokio::time::sleep(delay).await;
            }

            match self.send(&url, credential, body, self.timeout).await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response
                            .json::<Value>()
                            .await
                            .map_err(|e| UpstreamError::Parse(e.to_string()));
                    }
                    let code = status.as_u16();
                    let body_text = response.text().await.unwrap_or_default();
                    let err = UpstreamError::from_status(code, body_text);
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    warn!(
                        "Upstream returned {} for {}, attempt {}/{}",
                        code,
                        mask_credential(credential),
                        attempt + 1,
                        self.retry_count + 1
                    );
                    last_err = err;
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err);
                    }
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Streaming `streamGenerateContent?alt=sse` call. No internal retry:
    /// once bytes flow, failover belongs to the orchestrator, and before
    /// bytes flow a failed call surfaces immediately.
    pub async fn stream_generate_content(
        &self,
        model: &str,
        body: &Value,
        credential: &str,
    ) -> Result<impl Stream<Item = Result<Bytes, UpstreamError>> + Send + 'static, UpstreamError>
    {
        let url = self.build_url(model, "streamGenerateContent", Some("alt=sse"));
        let response = self.send(&url, credential, body, self.timeout).await?;

        let status = response.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body_text = response.text().await.unwrap_or_default();
            return Err(UpstreamError::from_status(code, body_text));
        }

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| UpstreamError::Network(e.to_string()))))
    }

    /// Minimal liveness probe used by the batch validator: one short
    /// `generateContent` with a fixed prompt and a 15 s budget, no retry.
    pub async fn probe(&self, credential: &str) -> Result<(), UpstreamError> {
        let url = self.build_url(DEFAULT_UPSTREAM_MODEL, "generateContent", None);
        let body = json!({
            "contents": [{ "role": "user", "parts": [{ "text": "Hello" }] }]
        });
        let response = self.send(&url, credential, &body, PROBE_TIMEOUT).await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let code = status.as_u16();
            let body_text = response.text().await.unwrap_or_default();
            Err(UpstreamError::from_status(code, body_text))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::extract::State;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::{IntoResponse, Response};
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    fn test_config(base_url: &str, retry_count: u32) -> UpstreamConfig {
        UpstreamConfig {
            base_url: base_url.to_string(),
            api_version: "v1beta".to_string(),
            timeout_ms: 5_000,
            retry_count,
            retry_delay_ms: 0,
        }
    }

    #[derive(Clone)]
    struct MockState {
        hits: Arc<AtomicUsize>,
        // Statuses replayed in order; the last one repeats.
        script: Arc<Vec<u16>>,
    }

    async fn scripted_handler(State(state): State<MockState>, headers: HeaderMap) -> Response {
        let hit = state.hits.fetch_add(1, Ordering::SeqCst);
        assert!(headers.contains_key("x-goog-api-key"));
        let status = *state
            .script
            .get(hit)
            .or_else(|| state.script.last())
            .unwrap_or(&200);
        if status == 200 {
            Json(serde_json::json!({
                "candidates": [{ "content": { "parts": [{ "text": "ok" }] } }]
            }))
            .into_response()
        } else {
            (
                StatusCode::from_u16(status).unwrap(),
                r#"{"error":{"message":"scripted"}}"#,
            )
                .into_response()
        }
    }

    async fn start_mock_upstream(script: Vec<u16>) -> (String, Arc<AtomicUsize>) {
        let state = MockState {
            hits: Arc::new(AtomicUsize::new(0)),
            script: Arc::new(script),
        };
        let hits = state.hits.clone();
        let app = Router::new()
            .route("/v1beta/models/{model_call}", post(scripted_handler))
            .with_state(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock upstream");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve mock upstream");
        });
        (format!("http://{}", addr), hits)
    }

    #[test]
    fn builds_generate_content_urls() {
        let client = UpstreamClient::new(&UpstreamConfig::default());
        assert_eq!(
            client.build_url("gemini-2.0-flash", "generateContent", None),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:generateContent"
        );
        assert_eq!(
            client.build_url("gemini-2.0-flash", "streamGenerateContent", Some("alt=sse")),
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.0-flash:streamGenerateContent?alt=sse"
        );
    }

    #[tokio::test]
    async fn unary_call_returns_parsed_body() {
        let (base_url, hits) = start_mock_upstream(vec![200]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 2));

        let response = client
            .generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .expect("unary call");
        assert_eq!(response["candidates"][0]["content"]["parts"][0]["text"], "ok");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_server_errors_are_retried() {
        let (base_url, hits) = start_mock_upstream(vec![500, 503, 200]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 2));

        client
            .generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .expect("should succeed on third attempt");
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retries_exhaust_into_last_error() {
        let (base_url, hits) = start_mock_upstream(vec![503]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 1));

        let err = client
            .generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .expect_err("should exhaust retries");
        assert!(matches!(err, UpstreamError::Status { code: 503, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn auth_failures_classify_as_credential_rejected_without_retry() {
        let (base_url, hits) = start_mock_upstream(vec![401]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 2));

        let err = client
            .generate_content("gemini-2.0-flash", &json!({"contents": []}), "bad-key")
            .await
            .expect_err("should fail");
        assert!(matches!(err, UpstreamError::CredentialRejected { code: 401, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let (base_url, hits) = start_mock_upstream(vec![400]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 2));

        let err = client
            .generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .expect_err("should fail");
        assert!(matches!(err, UpstreamError::Status { code: 400, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streaming_call_surfaces_status_errors_without_retry() {
        let (base_url, hits) = start_mock_upstream(vec![429]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 2));

        let err = client
            .stream_generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .err()
            .expect("should fail");
        assert!(matches!(err, UpstreamError::Status { code: 429, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn streaming_call_yields_raw_bytes() {
        async fn sse_handler() -> Response {
            Response::builder()
                .header("content-type", "text/event-stream")
                .body(Body::from("data: {\"candidates\":[]}\n\n"))
                .unwrap()
        }
        let app = Router::new().route("/v1beta/models/{model_call}", post(sse_handler));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let client = UpstreamClient::new(&test_config(&format!("http://{}", addr), 0));
        let stream = client
            .stream_generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .expect("stream");
        let chunks: Vec<Bytes> = stream.map(|c| c.expect("chunk")).collect::<Vec<_>>().await;
        let joined: Vec<u8> = chunks.concat();
        assert_eq!(
            String::from_utf8(joined).unwrap(),
            "data: {\"candidates\":[]}\n\n"
        );
    }

    #[tokio::test]
    async fn probe_maps_success_and_rejection() {
        let (base_url, _) = start_mock_upstream(vec![200]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 0));
        assert!(client.probe("good-key").await.is_ok());

        let (base_url, _) = start_mock_upstream(vec![401]).await;
        let client = UpstreamClient::new(&test_config(&base_url, 0));
        assert!(matches!(
            client.probe("bad-key").await,
            Err(UpstreamError::CredentialRejected { .. })
        ));
    }

    #[tokio::test]
    async fn unreachable_upstream_is_a_network_error() {
        // Nothing listens on this port.
        let client = UpstreamClient::new(&test_config("http://127.0.0.1:1", 0));
        let err = client
            .generate_content("gemini-2.0-flash", &json!({"contents": []}), "test-key")
            .await
            .expect_err("should fail");
        assert!(matches!(err, UpstreamError::Network(_)));
    }
}
