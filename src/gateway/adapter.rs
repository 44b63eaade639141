//! Turns an inbound chat request into an admission check.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::coordinator::AdmissionBackend;
use crate::error::GatewayError;
use crate::ratelimit::{AdmissionDecision, Dimension, LimitSpec, RateKey};

/// What the gateway does when the coordinator cannot answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Let the request through. Enforcement is weaker until the coordinator
    /// recovers, but the chat keeps working.
    #[default]
    FailOpen,
    /// Turn the request away with a fixed retry hint.
    FailClosed,
}

/// Identity attributes of an inbound request, already normalised.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub source_address: String,
    pub credential: String,
}

impl CheckRequest {
    pub fn new(source_address: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            source_address: source_address.into(),
            credential: credential.into(),
        }
    }
}

/// Decision handed back to the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResult {
    pub allowed: bool,
    /// Zero when allowed
    pub retry_after_seconds: u64,
}

impl CheckResult {
    pub fn allowed() -> Self {
        Self {
            allowed: true,
            retry_after_seconds: 0,
        }
    }
}

impl From<AdmissionDecision> for CheckResult {
    fn from(decision: AdmissionDecision) -> Self {
        Self {
            allowed: decision.allowed,
            retry_after_seconds: if decision.allowed {
                0
            } else {
                decision.retry_after_secs().max(1)
            },
        }
    }
}

/// Limits applied to every chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionLimits {
    pub source_address: LimitSpec,
    pub credential: LimitSpec,
}

impl Default for AdmissionLimits {
    /// 30 per minute per source address, 60 per minute per credential.
    fn default() -> Self {
        Self {
            source_address: LimitSpec::DEFAULT_SOURCE_ADDRESS,
            credential: LimitSpec::DEFAULT_CREDENTIAL,
        }
    }
}

/// Bridges inbound requests to the admission coordinator.
pub struct GatewayAdapter {
    backend: Arc<dyn AdmissionBackend>,
    limits: RwLock<AdmissionLimits>,
    timeout: Duration,
    policy: FailurePolicy,
    fail_closed_retry: Duration,
    failures: AtomicU64,
}

impl GatewayAdapter {
    /// Create an adapter with default limits, a 250ms timeout and fail-open.
    pub fn new(backend: Arc<dyn AdmissionBackend>) -> Self {
        Self {
            backend,
            limits: RwLock::new(AdmissionLimits::default()),
            timeout: Duration::from_millis(250),
            policy: FailurePolicy::FailOpen,
            fail_closed_retry: Duration::from_secs(10),
            failures: AtomicU64::new(0),
        }
    }

    pub fn with_limits(self, limits: AdmissionLimits) -> Self {
        *self.limits.write() = limits;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_policy(mut self, policy: FailurePolicy, fail_closed_retry: Duration) -> Self {
        self.policy = policy;
        self.fail_closed_retry = fail_closed_retry.max(Duration::from_secs(1));
        self
    }

    /// Replace the limits applied to subsequent requests.
    pub fn set_limits(&self, limits: AdmissionLimits) {
        *self.limits.write() = limits;
    }

    pub fn limits(&self) -> AdmissionLimits {
        *self.limits.read()
    }

    pub fn policy(&self) -> FailurePolicy {
        self.policy
    }

    /// Number of checks the coordinator failed to answer.
    pub fn coordinator_failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// The dimensions a request is counted against.
    pub fn dimensions(&self, request: &CheckRequest) -> Vec<Dimension> {
        let limits = self.limits();
        vec![
            Dimension::new(
                RateKey::source_address(&request.source_address),
                limits.source_address,
            ),
            Dimension::new(RateKey::credential(&request.credential), limits.credential),
        ]
    }

    /// Decide whether a request may proceed to the upstream call.
    ///
    /// A coordinator error or timeout never surfaces to the caller; it is
    /// resolved by the configured [`FailurePolicy`].
    pub async fn handle(&self, request: &CheckRequest) -> CheckResult {
        let dimensions = self.dimensions(request);

        let check = self.backend.check(&dimensions);
        let outcome = match tokio::time::timeout(self.timeout, check).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::CoordinatorUnreachable(format!(
                "no decision within {:?}",
                self.timeout
            ))),
        };

        match outcome {
            Ok(decision) => {
                let result = CheckResult::from(decision);
                debug!(
                    source_address = %request.source_address,
                    allowed = result.allowed,
                    retry_after_seconds = result.retry_after_seconds,
                    "Admission decision"
                );
                result
            }
            Err(e) => self.on_coordinator_failure(e),
        }
    }

    fn on_coordinator_failure(&self, error: GatewayError) -> CheckResult {
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        match self.policy {
            FailurePolicy::FailOpen => {
                warn!(
                    error = %error,
                    policy = "fail_open",
                    failures = failures,
                    "Admission coordinator failed, admitting request"
                );
                CheckResult::allowed()
            }
            FailurePolicy::FailClosed => {
                warn!(
                    error = %error,
                    policy = "fail_closed",
                    failures = failures,
                    "Admission coordinator failed, rejecting request"
                );
                CheckResult {
                    allowed: false,
                    retry_after_seconds: self.fail_closed_retry.as_secs(),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::{AdmissionCoordinator, CoordinatorOptions};
    use crate::error::Result;
    use crate::ratelimit::{ManualClock, MemoryStore};
    use async_trait::async_trait;

    struct UnreachableBackend;

    #[async_trait]
    impl AdmissionBackend for UnreachableBackend {
        async fn check(&self, _dimensions: &[Dimension]) -> Result<AdmissionDecision> {
            Err(GatewayError::CoordinatorUnreachable("connection refused".to_string()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl AdmissionBackend for SlowBackend {
        async fn check(&self, _dimensions: &[Dimension]) -> Result<AdmissionDecision> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(AdmissionDecision::deny(Duration::from_secs(30)))
        }
    }

    fn local_adapter(clock: Arc<ManualClock>) -> GatewayAdapter {
        let options = CoordinatorOptions {
            eviction_interval: None,
            ..Default::default()
        };
        let handle = AdmissionCoordinator::spawn(MemoryStore::new(), clock, options);
        GatewayAdapter::new(Arc::new(handle))
    }

    fn limits(address_max: u32, credential_max: u32) -> AdmissionLimits {
        AdmissionLimits {
            source_address: LimitSpec::per_secs(address_max, 60).unwrap(),
            credential: LimitSpec::per_secs(credential_max, 60).unwrap(),
        }
    }

    #[tokio::test]
    async fn test_allowed_then_denied() {
        let clock = Arc::new(ManualClock::new(0));
        let adapter = local_adapter(clock.clone()).with_limits(limits(2, 3));

        assert_eq!(
            adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await,
            CheckResult::allowed()
        );
        clock.advance(Duration::from_secs(10));
        assert!(adapter.handle(&CheckRequest::new("10.0.0.1", "b")).await.allowed);

        clock.advance(Duration::from_secs(10));
        let result = adapter.handle(&CheckRequest::new("10.0.0.1", "c")).await;
        assert!(!result.allowed);
        assert_eq!(result.retry_after_seconds, 40);
        assert_eq!(adapter.coordinator_failures(), 0);
    }

    #[tokio::test]
    async fn test_credential_ceiling_applies_across_addresses() {
        let clock = Arc::new(ManualClock::new(0));
        let adapter = local_adapter(clock).with_limits(limits(10, 2));

        assert!(adapter.handle(&CheckRequest::new("10.0.0.1", "shared")).await.allowed);
        assert!(adapter.handle(&CheckRequest::new("10.0.0.2", "shared")).await.allowed);
        assert!(!adapter.handle(&CheckRequest::new("10.0.0.3", "shared")).await.allowed);
    }

    #[tokio::test]
    async fn test_fail_open_on_error() {
        let adapter = GatewayAdapter::new(Arc::new(UnreachableBackend));
        let result = adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await;
        assert_eq!(result, CheckResult::allowed());
        assert_eq!(adapter.coordinator_failures(), 1);
    }

    #[tokio::test]
    async fn test_fail_open_on_timeout() {
        let adapter =
            GatewayAdapter::new(Arc::new(SlowBackend)).with_timeout(Duration::from_millis(20));
        let result = adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await;
        assert_eq!(result, CheckResult::allowed());
        assert_eq!(adapter.coordinator_failures(), 1);
    }

    #[tokio::test]
    async fn test_fail_closed_policy() {
        let adapter = GatewayAdapter::new(Arc::new(UnreachableBackend))
            .with_policy(FailurePolicy::FailClosed, Duration::from_secs(10));
        let result = adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await;
        assert!(!result.allowed);
        assert_eq!(result.retry_after_seconds, 10);
    }

    #[tokio::test]
    async fn test_set_limits_applies_to_next_request() {
        let clock = Arc::new(ManualClock::new(0));
        let adapter = local_adapter(clock).with_limits(limits(1, 10));

        assert!(adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await.allowed);
        assert!(!adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await.allowed);

        adapter.set_limits(limits(5, 10));
        assert!(adapter.handle(&CheckRequest::new("10.0.0.1", "a")).await.allowed);
    }

    #[test]
    fn test_dimensions_use_prefixed_keys() {
        let adapter = GatewayAdapter::new(Arc::new(UnreachableBackend));
        let dims = adapter.dimensions(&CheckRequest::new("203.0.113.5", ""));
        assert_eq!(dims[0].key.as_str(), "ip:203.0.113.5");
        assert_eq!(dims[1].key.as_str(), "tok:none");
        assert_eq!(dims[0].limit.max_events(), 30);
        assert_eq!(dims[1].limit.max_events(), 60);
    }

    #[test]
    fn test_check_result_wire_format() {
        let json = serde_json::to_value(CheckResult {
            allowed: false,
            retry_after_seconds: 12,
        })
        .unwrap();
        assert_eq!(json, serde_json::json!({"allowed": false, "retryAfterSeconds": 12}));
    }
}
