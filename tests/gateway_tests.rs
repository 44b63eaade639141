//! End-to-end tests of the chat route against fake upstream and coordinators.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::Router;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tower::ServiceExt;

use chatgate::config::UpstreamConfig;
use chatgate::coordinator::{AdmissionBackend, AdmissionCoordinator, CoordinatorOptions};
use chatgate::error::{GatewayError, Result};
use chatgate::gateway::{
    AdmissionLimits, AppState, ChatMessage, GatewayAdapter, GatewayServer, ModelClient,
    OpenAiClient, Role,
};
use chatgate::ratelimit::{AdmissionDecision, Dimension, LimitSpec, ManualClock, MemoryStore};

const TOKEN: &str = "s3cret";

/// Records every conversation it is asked to complete.
#[derive(Default)]
struct FakeModel {
    calls: AtomicUsize,
    last: Mutex<Vec<ChatMessage>>,
    reply: String,
}

impl FakeModel {
    fn replying(reply: &str) -> Arc<Self> {
        Arc::new(Self {
            reply: reply.to_string(),
            ..Default::default()
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelClient for FakeModel {
    async fn complete(&self, conversation: &[ChatMessage]) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock() = conversation.to_vec();
        Ok(self.reply.clone())
    }
}

struct FailingModel;

#[async_trait]
impl ModelClient for FailingModel {
    async fn complete(&self, _conversation: &[ChatMessage]) -> Result<String> {
        Err(GatewayError::UpstreamStatus {
            status: 429,
            body: "quota exceeded".to_string(),
        })
    }
}

struct DownCoordinator;

#[async_trait]
impl AdmissionBackend for DownCoordinator {
    async fn check(&self, _dimensions: &[Dimension]) -> Result<AdmissionDecision> {
        Err(GatewayError::CoordinatorUnreachable("connection refused".to_string()))
    }
}

fn local_adapter(address_max: u32, credential_max: u32) -> GatewayAdapter {
    let options = CoordinatorOptions {
        eviction_interval: None,
        ..Default::default()
    };
    let clock = Arc::new(ManualClock::new(0));
    let handle = AdmissionCoordinator::spawn(MemoryStore::new(), clock, options);
    GatewayAdapter::new(Arc::new(handle)).with_limits(AdmissionLimits {
        source_address: LimitSpec::per_secs(address_max, 60).unwrap(),
        credential: LimitSpec::per_secs(credential_max, 60).unwrap(),
    })
}

fn router(adapter: GatewayAdapter, upstream: Arc<dyn ModelClient>) -> Router {
    GatewayServer::router(AppState {
        adapter: Arc::new(adapter),
        upstream,
        shared_token: Some(TOKEN.to_string()),
        max_turns: 24,
    })
}

fn chat(ip: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/api/agent")
        .header("content-type", "application/json")
        .header("cf-connecting-ip", ip)
        .header("x-agent-token", token)
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_text(response: axum::response::Response) -> String {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[tokio::test]
async fn test_chat_reply() {
    let model = FakeModel::replying("Hello there.");
    let app = router(local_adapter(30, 60), model.clone());

    let response = app
        .oneshot(chat(
            "203.0.113.5",
            TOKEN,
            json!({
                "system": "You are terse.",
                "messages": [
                    {"role": "user", "content": "hi"},
                    {"role": "assistant", "content": "yo"}
                ],
                "user": "how are you?"
            }),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"reply": "Hello there."}));
    assert_eq!(model.calls(), 1);

    let sent = model.last.lock().clone();
    assert_eq!(sent.len(), 4);
    assert_eq!(sent[0].role, Role::System);
    assert_eq!(sent[3].content, "how are you?");
}

#[tokio::test]
async fn test_wrong_token_is_unauthorized() {
    let model = FakeModel::replying("unused");
    let app = router(local_adapter(30, 60), model.clone());

    let response = app
        .oneshot(chat("203.0.113.5", "wrong", json!({"user": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_missing_shared_token_is_server_error() {
    let app = GatewayServer::router(AppState {
        adapter: Arc::new(local_adapter(30, 60)),
        upstream: FakeModel::replying("unused"),
        shared_token: None,
        max_turns: 24,
    });

    let response = app
        .oneshot(chat("203.0.113.5", TOKEN, json!({"user": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body_text(response).await.contains("AGENT_SHARED_TOKEN"));
}

#[tokio::test]
async fn test_missing_api_key_is_server_error_before_body_parse() {
    let upstream = OpenAiClient::new(&UpstreamConfig::default(), None).unwrap();
    let app = router(local_adapter(30, 60), Arc::new(upstream));

    let blank = app
        .clone()
        .oneshot(chat("203.0.113.5", TOKEN, json!({"user": "  "})))
        .await
        .unwrap();
    assert_eq!(blank.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body_text(blank).await,
        "Server misconfigured: missing OPENAI_API_KEY"
    );

    let request = Request::builder()
        .method("POST")
        .uri("/api/agent")
        .header("x-agent-token", TOKEN)
        .body(Body::from("{not json"))
        .unwrap();
    let malformed = app.oneshot(request).await.unwrap();
    assert_eq!(malformed.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_rate_limited_after_address_ceiling() {
    let model = FakeModel::replying("ok");
    let app = router(local_adapter(2, 5), model.clone());

    for _ in 0..2 {
        let response = app
            .clone()
            .oneshot(chat("198.51.100.9", TOKEN, json!({"user": "hi"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app
        .clone()
        .oneshot(chat("198.51.100.9", TOKEN, json!({"user": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    let body = body_json(response).await;
    assert_eq!(body["error"], "rate_limited");
    assert_eq!(body["retryAfterSec"], 60);
    assert_eq!(model.calls(), 2);

    // A different address still gets through on the same credential.
    let response = app
        .oneshot(chat("198.51.100.10", TOKEN, json!({"user": "hi"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_fail_open_when_coordinator_is_down() {
    let model = FakeModel::replying("still here");
    let adapter = GatewayAdapter::new(Arc::new(DownCoordinator))
        .with_timeout(Duration::from_millis(50));
    let adapter = Arc::new(adapter);
    let app = GatewayServer::router(AppState {
        adapter: adapter.clone(),
        upstream: model.clone(),
        shared_token: Some(TOKEN.to_string()),
        max_turns: 24,
    });

    let response = app
        .oneshot(chat("203.0.113.5", TOKEN, json!({"user": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"reply": "still here"}));
    assert_eq!(model.calls(), 1);
    assert_eq!(adapter.coordinator_failures(), 1);
}

#[tokio::test]
async fn test_invalid_json_body() {
    let model = FakeModel::replying("unused");
    let app = router(local_adapter(30, 60), model.clone());

    let request = Request::builder()
        .method("POST")
        .uri("/api/agent")
        .header("x-agent-token", TOKEN)
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_text(response).await, "Invalid JSON body");
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_blank_user_input() {
    let model = FakeModel::replying("unused");
    let app = router(local_adapter(30, 60), model.clone());

    let response = app
        .oneshot(chat("203.0.113.5", TOKEN, json!({"user": "   "})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"reply": "No input received."}));
    assert_eq!(model.calls(), 0);
}

#[tokio::test]
async fn test_empty_model_output() {
    let app = router(local_adapter(30, 60), FakeModel::replying(""));

    let response = app
        .oneshot(chat("203.0.113.5", TOKEN, json!({"user": "hi"})))
        .await
        .unwrap();

    assert_eq!(body_json(response).await, json!({"reply": "(No text output)"}));
}

#[tokio::test]
async fn test_upstream_error_is_bad_gateway() {
    let app = router(local_adapter(30, 60), Arc::new(FailingModel));

    let response = app
        .oneshot(chat("203.0.113.5", TOKEN, json!({"user": "hi"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_text(response).await, "OpenAI error (429): quota exceeded");
}

#[tokio::test]
async fn test_health() {
    let app = router(local_adapter(30, 60), FakeModel::replying("unused"));

    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let response = app.oneshot(request).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "healthy");
}
