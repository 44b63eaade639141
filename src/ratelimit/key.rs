//! Rate key generation and handling.

use crate::error::{GatewayError, Result};

/// Prefix used for per-source-address keys.
pub const SOURCE_ADDRESS_PREFIX: &str = "ip";
/// Prefix used for per-credential keys.
pub const CREDENTIAL_PREFIX: &str = "tok";

/// A key that identifies one countable subject.
///
/// Keys are opaque: two keys count against the same log if and only if
/// their string forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RateKey(String);

impl RateKey {
    /// Create a key from its raw string form. Empty keys are rejected.
    pub fn new(raw: impl Into<String>) -> Result<Self> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(GatewayError::InvalidInput("rate key must not be empty".to_string()));
        }
        Ok(Self(raw))
    }

    /// Key for a client source address. A missing address counts as `unknown`.
    pub fn source_address(address: &str) -> Self {
        Self::scoped(SOURCE_ADDRESS_PREFIX, address, "unknown")
    }

    /// Key for a client credential. A missing credential counts as `none`.
    pub fn credential(credential: &str) -> Self {
        Self::scoped(CREDENTIAL_PREFIX, credential, "none")
    }

    fn scoped(prefix: &str, value: &str, fallback: &str) -> Self {
        let value = value.trim();
        let value = if value.is_empty() { fallback } else { value };
        Self(format!("{}:{}", prefix, value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}
