// Black-box tests: a real gateway instance over HTTP against a scripted
// upstream, exercising credential failover, translation, and reporting
// end to end.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use axum::Router;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;

use sluice::{server, AppState, GatewayConfig};

#[derive(Clone)]
struct UpstreamScript {
    rejected: Vec<&'static str>,
    hits: Arc<AtomicUsize>,
}

async fn upstream_handler(State(script): State<UpstreamScript>, headers: HeaderMap) -> Response {
    script.hits.fetch_add(1, Ordering::SeqCst);
    let key = headers
        .get("x-goog-api-key")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if script.rejected.contains(&key) {
        return (
            StatusCode::UNAUTHORIZED,
            r#"{"error":{"message":"API key not valid"}}"#,
        )
            .into_response();
    }
    Json(json!({
        "candidates": [{
            "content": { "parts": [{ "text": "hello from upstream" }] },
            "finishReason": "STOP"
        }],
        "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 4, "totalTokenCount": 7 }
    }))
    .into_response()
}

async fn start_upstream(rejected: Vec<&'static str>) -> (String, Arc<AtomicUsize>) {
    let script = UpstreamScript {
        rejected,
        hits: Arc::new(AtomicUsize::new(0)),
    };
    let hits = script.hits.clone();
    let app = Router::new()
        .route("/v1beta/models/{model_call}", post(upstream_handler))
        .with_state(script);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });
    (format!("http://{}", addr), hits)
}

async fn start_gateway(upstream_base: &str) -> String {
    let mut config = GatewayConfig::default();
    config.upstream.base_url = upstream_base.to_string();
    config.upstream.retry_count = 0;
    config.upstream.retry_delay_ms = 0;

    let app = server::router(AppState::new(config));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind gateway");
    let addr = listener.local_addr().expect("gateway addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve gateway");
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn failover_within_one_request_then_stats_reflect_it() {
    let (upstream, _) = start_upstream(vec!["bad-key"]).await;
    let gateway = start_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat/completions", gateway))
        .header("authorization", "Bearer bad-key,good-key")
        .json(&json!({
            "model": "gpt-4o",
            "messages": [{ "role": "user", "content": "ping" }]
        }))
        .send()
        .await
        .expect("chat response");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("chat body");
    assert_eq!(body["object"], "chat.completion");
    assert_eq!(body["model"], "gpt-4o");
    assert_eq!(
        body["choices"][0]["message"]["content"],
        "hello from upstream"
    );
    assert_eq!(body["usage"]["total_tokens"], 7);

    let stats: Value = client
        .get(format!("{}/stats", gateway))
        .send()
        .await
        .expect("stats response")
        .json()
        .await
        .expect("stats body");
    assert_eq!(stats["total"], 2);
    let credentials = stats["credentials"].as_array().expect("credentials");
    assert_eq!(credentials.len(), 2);
    let failures: u64 = credentials
        .iter()
        .map(|c| c["total_failures"].as_u64().unwrap())
        .sum();
    let successes: u64 = credentials
        .iter()
        .map(|c| c["total_successes"].as_u64().unwrap())
        .sum();
    assert_eq!(failures, 1);
    assert_eq!(successes, 1);
}

#[tokio::test]
async fn streaming_round_trip_produces_chunked_sse() {
    async fn sse_upstream() -> Response {
        Response::builder()
            .header("content-type", "text/event-stream")
            .body(axum::body::Body::from(
                "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"str\"}]}}]}\n\n\
                 data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"eam\"}]},\"finishReason\":\"STOP\"}]}\n\n",
            ))
            .unwrap()
    }
    let app = Router::new().route("/v1beta/models/{model_call}", post(sse_upstream));
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind upstream");
    let addr = listener.local_addr().expect("upstream addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });

    let gateway = start_gateway(&format!("http://{}", addr)).await;
    let response = reqwest::Client::new()
        .post(format!("{}/chat/completions", gateway))
        .header("x-goog-api-key", "stream-key")
        .json(&json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [{ "role": "user", "content": "go" }]
        }))
        .send()
        .await
        .expect("stream response");

    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = response.text().await.expect("stream body");
    let frames: Vec<&str> = body.split("\n\n").filter(|f| !f.is_empty()).collect();
    assert_eq!(frames.len(), 3);
    assert_eq!(frames[2], "data: [DONE]");

    let text: String = frames[..2]
        .iter()
        .map(|f| {
            let event: Value =
                serde_json::from_str(f.strip_prefix("data: ").unwrap()).expect("event");
            event["choices"][0]["delta"]["content"]
                .as_str()
                .unwrap_or("")
                .to_string()
        })
        .collect();
    assert_eq!(text, "stream");
}

#[tokio::test]
async fn service_descriptor_and_unknown_paths() {
    let (upstream, _) = start_upstream(vec![]).await;
    let gateway = start_gateway(&upstream).await;
    let client = reqwest::Client::new();

    let descriptor: Value = client
        .get(&gateway)
        .send()
        .await
        .expect("descriptor")
        .json()
        .await
        .expect("descriptor body");
    assert_eq!(descriptor["name"], "sluice");
    assert!(descriptor["endpoints"]["chat"].is_string());

    let missing = client
        .get(format!("{}/does-not-exist", gateway))
        .send()
        .await
        .expect("404 response");
    assert_eq!(missing.status(), 404);
    let doc: Value = missing.json().await.expect("error doc");
    assert_eq!(doc["error"]["code"], "not_found");
}
