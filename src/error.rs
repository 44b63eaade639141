//! Error types for the Chatgate service.

use thiserror::Error;

/// Main error type for Chatgate operations.
///
/// A rate-limit denial is not an error: it is an
/// [`AdmissionDecision`](crate::ratelimit::AdmissionDecision) with
/// `allowed == false`.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed key or limit definition. Treated as fatal at startup.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// The coordinator's backing store could not be read or written
    #[error("Storage failure: {0}")]
    StorageFailure(String),

    /// The coordinator could not be reached or did not answer in time
    #[error("Coordinator unreachable: {0}")]
    CoordinatorUnreachable(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The upstream model API answered with a non-success status
    #[error("Upstream returned {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    /// Any other failure talking to the upstream model API
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::Config(err.to_string())
    }
}

/// Result type alias for Chatgate operations.
pub type Result<T> = std::result::Result<T, GatewayError>;
