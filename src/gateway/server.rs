//! HTTP server for the chat gateway.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::adapter::{CheckRequest, GatewayAdapter};
use super::upstream::{build_conversation, trim_conversation, ModelClient};
use crate::error::{GatewayError, Result};

/// Header carrying the shared secret.
pub const TOKEN_HEADER: &str = "x-agent-token";

const NO_INPUT_REPLY: &str = "No input received.";
const NO_TEXT_REPLY: &str = "(No text output)";

/// Shared state for the chat routes.
#[derive(Clone)]
pub struct AppState {
    pub adapter: Arc<GatewayAdapter>,
    pub upstream: Arc<dyn ModelClient>,
    /// Expected value of [`TOKEN_HEADER`]. `None` means the server is
    /// misconfigured and every chat request is refused.
    pub shared_token: Option<String>,
    pub max_turns: usize,
}

/// HTTP server for the chat gateway.
pub struct GatewayServer {
    /// Address to bind to
    addr: SocketAddr,
    state: AppState,
}

impl GatewayServer {
    pub fn new(addr: SocketAddr, state: AppState) -> Self {
        Self { addr, state }
    }

    /// Routes served by the gateway.
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/api/agent", post(agent_handler))
            .route("/health", get(health_handler))
            .with_state(state)
    }

    /// Start the server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        serve_router(self.addr, Self::router(self.state), signal).await
    }
}

/// Bind `addr` and serve `router` until `signal` resolves.
pub async fn serve_router<F>(addr: SocketAddr, router: Router, signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "HTTP server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            GatewayError::Io(e)
        })
}

/// Client address as reported by the edge proxy.
pub fn source_address(headers: &HeaderMap) -> String {
    if let Some(ip) = header_str(headers, "cf-connecting-ip") {
        let ip = ip.trim();
        if !ip.is_empty() {
            return ip.to_string();
        }
    }
    header_str(headers, "x-forwarded-for")
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .unwrap_or("unknown")
        .to_string()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

/// Compare secrets without short-circuiting on the first differing byte.
///
/// Runs over the longer input so the expected length does not leak either.
fn constant_time_eq(a: &str, b: &str) -> bool {
    let (a, b) = (a.as_bytes(), b.as_bytes());
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= usize::from(x ^ y);
    }
    diff == 0
}

fn text(status: StatusCode, body: impl Into<String>) -> Response {
    (status, body.into()).into_response()
}

fn reply(text: &str) -> Response {
    Json(json!({ "reply": text })).into_response()
}

fn rate_limited(retry_after_seconds: u64) -> Response {
    let mut response = (
        StatusCode::TOO_MANY_REQUESTS,
        Json(json!({
            "error": "rate_limited",
            "message": "Too many requests. Please wait and try again.",
            "retryAfterSec": retry_after_seconds,
        })),
    )
        .into_response();
    response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_seconds));
    response
}

#[instrument(skip_all, fields(request_id = %Uuid::new_v4()))]
async fn agent_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Some(expected) = state.shared_token.as_deref() else {
        error!("No shared token configured");
        return text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server misconfigured: missing AGENT_SHARED_TOKEN",
        );
    };
    let provided = header_str(&headers, TOKEN_HEADER).unwrap_or_default();
    if !constant_time_eq(provided, expected) {
        debug!("Rejected request with bad token");
        return text(StatusCode::UNAUTHORIZED, "Unauthorized");
    }

    let check = CheckRequest::new(source_address(&headers), provided);
    let decision = state.adapter.handle(&check).await;
    if !decision.allowed {
        info!(
            source_address = %check.source_address,
            retry_after_seconds = decision.retry_after_seconds,
            "Request rate limited"
        );
        return rate_limited(decision.retry_after_seconds);
    }

    if !state.upstream.has_credentials() {
        error!("No upstream API key configured");
        return text(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Server misconfigured: missing OPENAI_API_KEY",
        );
    }

    let Ok(body) = serde_json::from_slice::<Value>(&body) else {
        return text(StatusCode::BAD_REQUEST, "Invalid JSON body");
    };

    let system = body.get("system").and_then(Value::as_str).unwrap_or_default();
    let user = body.get("user").and_then(Value::as_str).unwrap_or_default();
    let history = body
        .get("messages")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();

    if user.trim().is_empty() {
        return reply(NO_INPUT_REPLY);
    }

    let conversation =
        trim_conversation(build_conversation(system, history, user), state.max_turns);

    match state.upstream.complete(&conversation).await {
        Ok(answer) if answer.is_empty() => reply(NO_TEXT_REPLY),
        Ok(answer) => reply(&answer),
        Err(GatewayError::UpstreamStatus { status, body }) => text(
            StatusCode::BAD_GATEWAY,
            format!("OpenAI error ({}): {}", status, body),
        ),
        Err(e) => {
            warn!(error = %e, "Upstream call failed");
            text(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Upstream exception: {}", e),
            )
        }
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
