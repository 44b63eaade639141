//! Admission decisions and how they combine.

use std::time::Duration;

/// Outcome of an admission check, for one dimension or for a whole request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    pub allowed: bool,
    /// Zero when allowed. At least one second when denied.
    pub retry_after: Duration,
}

impl AdmissionDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: Duration::ZERO,
        }
    }

    pub fn deny(retry_after: Duration) -> Self {
        Self {
            allowed: false,
            retry_after,
        }
    }

    /// Fold another dimension's decision into this one.
    ///
    /// Allowed only if both are allowed; the retry hint is the larger of the
    /// two, since the request cannot succeed before the slowest dimension
    /// clears.
    pub fn combine(self, other: AdmissionDecision) -> Self {
        Self {
            allowed: self.allowed && other.allowed,
            retry_after: self.retry_after.max(other.retry_after),
        }
    }

    /// The retry hint in whole seconds, as reported to clients.
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.as_secs()
    }
}

impl Default for AdmissionDecision {
    fn default() -> Self {
        Self::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_takes_and_and_max() {
        let a = AdmissionDecision::deny(Duration::from_secs(5));
        let b = AdmissionDecision::deny(Duration::from_secs(12));
        let combined = a.combine(b);
        assert!(!combined.allowed);
        assert_eq!(combined.retry_after_secs(), 12);
    }

    #[test]
    fn test_combine_allowed_with_denied() {
        let denied = AdmissionDecision::deny(Duration::from_secs(3));
        let combined = AdmissionDecision::allow().combine(denied);
        assert!(!combined.allowed);
        assert_eq!(combined.retry_after, Duration::from_secs(3));
    }

    #[test]
    fn test_default_is_allow() {
        let decision = AdmissionDecision::default();
        assert!(decision.allowed);
        assert_eq!(decision.retry_after_secs(), 0);
    }
}
