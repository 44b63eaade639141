//! Multi-dimension admission checks.

use std::time::Duration;
use tracing::debug;

use super::counter::{LimitSpec, SlidingWindowCounter};
use super::decision::AdmissionDecision;
use super::key::RateKey;
use super::store::EventStore;
use crate::error::{GatewayError, Result};

/// One `(key, limit)` pair a request is counted against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dimension {
    pub key: RateKey,
    pub limit: LimitSpec,
}

impl Dimension {
    pub fn new(key: RateKey, limit: LimitSpec) -> Self {
        Self { key, limit }
    }
}

/// Evaluates a request against every one of its dimensions.
pub struct CompositeLimiter<S: EventStore> {
    counter: SlidingWindowCounter<S>,
}

impl<S: EventStore> CompositeLimiter<S> {
    pub fn new(store: S) -> Self {
        Self {
            counter: SlidingWindowCounter::new(store),
        }
    }

    /// Check all dimensions and combine the results.
    ///
    /// Every dimension is evaluated even after one denies, so the retry hint
    /// is the true maximum across dimensions. Dimensions that admit the
    /// request record it regardless of what the others decide.
    pub fn evaluate(&mut self, dimensions: &[Dimension], now_ms: u64) -> Result<AdmissionDecision> {
        if dimensions.is_empty() {
            return Err(GatewayError::InvalidInput(
                "at least one dimension is required".to_string(),
            ));
        }

        let mut combined = AdmissionDecision::allow();
        for dimension in dimensions {
            let decision = self
                .counter
                .check_and_record(&dimension.key, &dimension.limit, now_ms)?;

            if !decision.allowed {
                debug!(
                    key = %dimension.key,
                    max_events = dimension.limit.max_events(),
                    retry_after_secs = decision.retry_after_secs(),
                    "Dimension over limit"
                );
            }

            combined = combined.combine(decision);
        }

        Ok(combined)
    }

    /// Drop logs idle for at least `idle_for`.
    pub fn evict_idle(&mut self, idle_for: Duration, now_ms: u64) -> Result<usize> {
        self.counter.evict_idle(idle_for, now_ms)
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.counter.tracked_keys()
    }
}
