//! HTTP access to a shared coordinator.
//!
//! One coordinator process owns the event logs for a deployment; every
//! gateway reaches it at the same fixed address. [`coordinator_router`] is
//! the coordinator's side of the wire, [`RemoteCoordinator`] the gateway's.

use std::time::Duration;

use async_trait::async_trait;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use super::actor::CoordinatorHandle;
use super::backend::AdmissionBackend;
use crate::error::{GatewayError, Result};
use crate::ratelimit::{AdmissionDecision, Dimension, LimitSpec, RateKey};

/// Route serving admission checks on the coordinator.
pub const CHECK_PATH: &str = "/internal/admission/check";

/// Error code returned when the coordinator's store fails.
const STORAGE_FAILURE_CODE: &str = "storage_failure";

/// One dimension on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireDimension {
    pub key: String,
    pub max_events: u32,
    pub window_ms: u64,
}

/// Body of a check request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckPayload {
    pub dimensions: Vec<WireDimension>,
}

/// Body of a successful check response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionPayload {
    pub allowed: bool,
    pub retry_after_seconds: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorPayload {
    error: String,
    #[serde(default)]
    message: String,
}

impl From<&Dimension> for WireDimension {
    fn from(dimension: &Dimension) -> Self {
        Self {
            key: dimension.key.to_string(),
            max_events: dimension.limit.max_events(),
            window_ms: dimension.limit.window_ms(),
        }
    }
}

impl TryFrom<WireDimension> for Dimension {
    type Error = GatewayError;

    fn try_from(wire: WireDimension) -> Result<Self> {
        Ok(Dimension::new(
            RateKey::new(wire.key)?,
            LimitSpec::new(wire.max_events, Duration::from_millis(wire.window_ms))?,
        ))
    }
}

impl From<AdmissionDecision> for DecisionPayload {
    fn from(decision: AdmissionDecision) -> Self {
        Self {
            allowed: decision.allowed,
            retry_after_seconds: decision.retry_after_secs(),
        }
    }
}

impl From<DecisionPayload> for AdmissionDecision {
    fn from(payload: DecisionPayload) -> Self {
        if payload.allowed {
            AdmissionDecision::allow()
        } else {
            AdmissionDecision::deny(Duration::from_secs(payload.retry_after_seconds))
        }
    }
}

/// Router exposing a coordinator over HTTP.
pub fn coordinator_router(handle: CoordinatorHandle) -> Router {
    Router::new()
        .route(CHECK_PATH, post(check_handler))
        .route("/health", get(health_handler))
        .with_state(handle)
}

async fn check_handler(
    State(handle): State<CoordinatorHandle>,
    Json(payload): Json<CheckPayload>,
) -> Response {
    let dimensions = match payload
        .dimensions
        .into_iter()
        .map(Dimension::try_from)
        .collect::<Result<Vec<_>>>()
    {
        Ok(dimensions) => dimensions,
        Err(e) => {
            warn!(error = %e, "Rejected malformed admission check");
            return error_response(StatusCode::BAD_REQUEST, "invalid_input", &e);
        }
    };

    match handle.check(&dimensions).await {
        Ok(decision) => Json(DecisionPayload::from(decision)).into_response(),
        Err(e @ GatewayError::StorageFailure(_)) => {
            error_response(StatusCode::SERVICE_UNAVAILABLE, STORAGE_FAILURE_CODE, &e)
        }
        Err(e @ GatewayError::InvalidInput(_)) => {
            error_response(StatusCode::BAD_REQUEST, "invalid_input", &e)
        }
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", &e),
    }
}

async fn health_handler(State(handle): State<CoordinatorHandle>) -> Response {
    match handle.tracked_keys().await {
        Ok(tracked_keys) => Json(json!({
            "status": "healthy",
            "trackedKeys": tracked_keys,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::SERVICE_UNAVAILABLE, "unavailable", &e),
    }
}

fn error_response(status: StatusCode, code: &str, err: &GatewayError) -> Response {
    (
        status,
        Json(json!({ "error": code, "message": err.to_string() })),
    )
        .into_response()
}

/// Client for a coordinator served by [`coordinator_router`].
pub struct RemoteCoordinator {
    client: reqwest::Client,
    check_url: String,
}

impl RemoteCoordinator {
    /// Create a client for the coordinator at `base_url`.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()
            .map_err(|e| {
                GatewayError::Config(format!("Failed to build coordinator client: {}", e))
            })?;

        Ok(Self {
            client,
            check_url: format!("{}{}", base_url.trim_end_matches('/'), CHECK_PATH),
        })
    }

    pub fn check_url(&self) -> &str {
        &self.check_url
    }
}

#[async_trait]
impl AdmissionBackend for RemoteCoordinator {
    async fn check(&self, dimensions: &[Dimension]) -> Result<AdmissionDecision> {
        let payload = CheckPayload {
            dimensions: dimensions.iter().map(WireDimension::from).collect(),
        };

        let response = self
            .client
            .post(&self.check_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| GatewayError::CoordinatorUnreachable(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let decision: DecisionPayload = response.json().await.map_err(|e| {
                GatewayError::CoordinatorUnreachable(format!("Malformed decision: {}", e))
            })?;
            debug!(allowed = decision.allowed, "Remote admission decision");
            return Ok(decision.into());
        }

        let body: Option<ErrorPayload> = response.json().await.ok();
        match body {
            Some(body) if body.error == STORAGE_FAILURE_CODE => {
                Err(GatewayError::StorageFailure(body.message))
            }
            Some(body) if status == StatusCode::BAD_REQUEST => {
                Err(GatewayError::InvalidInput(body.message))
            }
            _ => Err(GatewayError::CoordinatorUnreachable(format!(
                "coordinator answered {}",
                status
            ))),
        }
    }
}
