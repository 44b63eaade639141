//! Admission backend trait for abstracting in-process and remote coordinators.

use async_trait::async_trait;

use crate::error::Result;
use crate::ratelimit::{AdmissionDecision, Dimension};

/// Trait for admission coordinator implementations.
///
/// This trait abstracts over the in-process [`CoordinatorHandle`] and the
/// HTTP [`RemoteCoordinator`] so the gateway can work with either.
///
/// [`CoordinatorHandle`]: super::CoordinatorHandle
/// [`RemoteCoordinator`]: super::RemoteCoordinator
#[async_trait]
pub trait AdmissionBackend: Send + Sync {
    /// Check (and, if admitted, record) a request against all its dimensions.
    ///
    /// The coordinator stamps the check with its own clock. `Err` means the
    /// coordinator could not answer; a denial is an `Ok` decision.
    async fn check(&self, dimensions: &[Dimension]) -> Result<AdmissionDecision>;
}
