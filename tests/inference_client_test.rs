//! VisionClient against a local stand-in for the chat-completions endpoint.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::{Arc, Mutex};

use stock_meta::models::metadata::{CategoryValue, KeywordsValue};
use stock_meta::services::inference::{InferenceError, MetadataGenerator, VisionClient};
use stock_meta::services::retry::HttpStatus;

#[derive(Clone)]
struct Upstream {
    status: StatusCode,
    reply: Value,
    seen: Arc<Mutex<Vec<(Option<String>, Value)>>>,
}

async fn completions(State(upstream): State<Upstream>, headers: HeaderMap, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    upstream.seen.lock().unwrap().push((auth, body));
    (upstream.status, Json(upstream.reply.clone()))
}

/// Serve `reply` with `status` on an ephemeral port and return the endpoint URL.
async fn spawn_upstream(status: StatusCode, reply: Value) -> (String, Upstream) {
    let upstream = Upstream {
        status,
        reply,
        seen: Arc::new(Mutex::new(Vec::new())),
    };
    let app = Router::new()
        .route("/v1/chat/completions", post(completions))
        .with_state(upstream.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}/v1/chat/completions"), upstream)
}

fn chat_reply(content: &str) -> Value {
    json!({ "choices": [{ "message": { "role": "assistant", "content": content } }] })
}

#[tokio::test]
async fn test_generate_metadata_sends_image_and_parses_reply() {
    let content = "```json\n{\"title\": \"Lighthouse at dusk\", \"keywords\": [\"lighthouse\", \"coast\"], \"category\": \"Travel\"}\n```";
    let (endpoint, upstream) = spawn_upstream(StatusCode::OK, chat_reply(content)).await;
    let client = VisionClient::new(&endpoint, "secret-token", "vision-test").unwrap();

    let raw = client
        .generate_metadata("http://localhost/temp/abc.jpg")
        .await
        .unwrap();

    assert_eq!(raw.title, "Lighthouse at dusk");
    assert_eq!(
        raw.keywords,
        KeywordsValue::List(vec!["lighthouse".to_string(), "coast".to_string()])
    );
    assert_eq!(raw.category, CategoryValue::Text("Travel".to_string()));

    let seen = upstream.seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (auth, body) = &seen[0];
    assert_eq!(auth.as_deref(), Some("Bearer secret-token"));
    assert_eq!(body["model"], "vision-test");
    assert_eq!(
        body["messages"][0]["content"][1]["image_url"]["url"],
        "http://localhost/temp/abc.jpg"
    );
}

#[tokio::test]
async fn test_rate_limit_carries_status() {
    let (endpoint, _) = spawn_upstream(
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": { "message": "slow down" } }),
    )
    .await;
    let client = VisionClient::new(&endpoint, "t", "vision-test").unwrap();

    let err = client.generate_metadata("http://localhost/temp/a.jpg").await.unwrap_err();

    assert!(matches!(err, InferenceError::Request { .. }));
    assert_eq!(err.http_status(), Some(429));
    assert!(err.to_string().contains("slow down"));
}

#[tokio::test]
async fn test_server_error_carries_status() {
    let (endpoint, _) = spawn_upstream(StatusCode::BAD_GATEWAY, json!({})).await;
    let client = VisionClient::new(&endpoint, "t", "vision-test").unwrap();

    let err = client.generate_metadata("http://localhost/temp/a.jpg").await.unwrap_err();

    assert_eq!(err.http_status(), Some(502));
}

#[tokio::test]
async fn test_prose_reply_is_invalid_response() {
    let (endpoint, _) = spawn_upstream(StatusCode::OK, chat_reply("A nice picture of a dog.")).await;
    let client = VisionClient::new(&endpoint, "t", "vision-test").unwrap();

    let err = client.generate_metadata("http://localhost/temp/a.jpg").await.unwrap_err();

    assert!(matches!(err, InferenceError::InvalidResponse { .. }));
    assert_eq!(err.http_status(), None);
}

#[tokio::test]
async fn test_empty_choices_is_invalid_response() {
    let (endpoint, _) = spawn_upstream(StatusCode::OK, json!({ "choices": [] })).await;
    let client = VisionClient::new(&endpoint, "t", "vision-test").unwrap();

    let err = client.generate_metadata("http://localhost/temp/a.jpg").await.unwrap_err();

    assert!(matches!(err, InferenceError::InvalidResponse { .. }));
}

#[tokio::test]
async fn test_unreachable_endpoint_has_no_status() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    let client = VisionClient::new(&format!("http://{addr}/v1/chat/completions"), "t", "vision-test").unwrap();

    let err = client.generate_metadata("http://localhost/temp/a.jpg").await.unwrap_err();

    assert!(matches!(err, InferenceError::Request { status: None, .. }));
}
