//! Sliding-window-by-log counter.
//!
//! Each key owns an ordered log of event timestamps. A check prunes entries
//! that have fallen out of the trailing window, compares what is left against
//! the ceiling, and records the new event only when it is admitted.

use std::time::Duration;
use tracing::trace;

use super::decision::AdmissionDecision;
use super::key::RateKey;
use super::store::EventStore;
use crate::error::{GatewayError, Result};

/// Smallest retry hint handed to a denied caller.
const MIN_RETRY_AFTER: Duration = Duration::from_secs(1);

/// "At most `max_events` occurrences within any trailing `window`."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    max_events: u32,
    window: Duration,
}

impl LimitSpec {
    /// 30 events per minute, the default per-source-address ceiling.
    pub const DEFAULT_SOURCE_ADDRESS: LimitSpec = LimitSpec {
        max_events: 30,
        window: Duration::from_secs(60),
    };

    /// 60 events per minute, the default per-credential ceiling.
    pub const DEFAULT_CREDENTIAL: LimitSpec = LimitSpec {
        max_events: 60,
        window: Duration::from_secs(60),
    };

    /// Create a limit. Both the ceiling and the window must be positive.
    pub fn new(max_events: u32, window: Duration) -> Result<Self> {
        if max_events == 0 {
            return Err(GatewayError::InvalidInput("max_events must be positive".to_string()));
        }
        if window.as_millis() == 0 {
            return Err(GatewayError::InvalidInput(
                "window must be at least one millisecond".to_string(),
            ));
        }
        Ok(Self { max_events, window })
    }

    /// Convenience constructor for whole-second windows.
    pub fn per_secs(max_events: u32, window_secs: u64) -> Result<Self> {
        Self::new(max_events, Duration::from_secs(window_secs))
    }

    pub fn max_events(&self) -> u32 {
        self.max_events
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn window_ms(&self) -> u64 {
        self.window.as_millis() as u64
    }
}

/// Timestamps (ms since the Unix epoch) of admitted events for one key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventLog {
    events: Vec<u64>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an admitted event.
    pub fn record(&mut self, at_ms: u64) {
        self.events.push(at_ms);
    }

    /// Drop every event at or before `now_ms - window_ms`.
    ///
    /// Returns the number of events dropped.
    pub fn prune(&mut self, now_ms: u64, window_ms: u64) -> usize {
        let before = self.events.len();
        self.events.retain(|&ts| ts.saturating_add(window_ms) > now_ms);
        before - self.events.len()
    }

    /// Earliest surviving event. Logs are not assumed to be sorted.
    pub fn oldest(&self) -> Option<u64> {
        self.events.iter().copied().min()
    }

    /// Most recent event.
    pub fn latest(&self) -> Option<u64> {
        self.events.iter().copied().max()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.events.iter().copied()
    }
}

impl From<Vec<u64>> for EventLog {
    fn from(events: Vec<u64>) -> Self {
        Self { events }
    }
}

/// How long until the oldest event leaves the window, rounded up to whole
/// seconds and never below [`MIN_RETRY_AFTER`].
pub fn retry_after(oldest_ms: u64, window: Duration, now_ms: u64) -> Duration {
    let frees_at = oldest_ms.saturating_add(window.as_millis() as u64);
    let wait_ms = frees_at.saturating_sub(now_ms);
    Duration::from_secs(wait_ms.div_ceil(1000)).max(MIN_RETRY_AFTER)
}

/// Answers "may this key have one more event now?" against its log.
pub struct SlidingWindowCounter<S: EventStore> {
    store: S,
}

impl<S: EventStore> SlidingWindowCounter<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Check `key` against `spec` as of `now_ms`, recording the event if it
    /// is admitted. Denied attempts are not counted.
    pub fn check_and_record(
        &mut self,
        key: &RateKey,
        spec: &LimitSpec,
        now_ms: u64,
    ) -> Result<AdmissionDecision> {
        let mut log = self.store.load(key)?.unwrap_or_default();
        let pruned = log.prune(now_ms, spec.window_ms());

        if log.len() >= spec.max_events() as usize {
            let oldest = log.oldest().unwrap_or(now_ms);
            let wait = retry_after(oldest, spec.window(), now_ms);
            trace!(
                key = %key,
                count = log.len(),
                max_events = spec.max_events(),
                retry_after_secs = wait.as_secs(),
                "Window full"
            );
            if pruned > 0 {
                self.store.save(key, log)?;
            }
            return Ok(AdmissionDecision::deny(wait));
        }

        log.record(now_ms);
        trace!(
            key = %key,
            count = log.len(),
            max_events = spec.max_events(),
            "Event recorded"
        );
        self.store.save(key, log)?;
        Ok(AdmissionDecision::allow())
    }

    /// Drop logs whose latest event is at least `idle_for` old.
    pub fn evict_idle(&mut self, idle_for: Duration, now_ms: u64) -> Result<usize> {
        let cutoff = now_ms.saturating_sub(idle_for.as_millis() as u64);
        self.store.evict_idle(cutoff)
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.store.len()
    }

    pub fn store(&self) -> &S {
        &self.store
    }
}
