//! Configuration management for Chatgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::coordinator::CoordinatorOptions;
use crate::error::{GatewayError, Result};
use crate::gateway::{AdmissionLimits, FailurePolicy};
use crate::ratelimit::LimitSpec;

/// Prefix for environment overrides, e.g. `CHATGATE__ADMISSION__TIMEOUT_MS`.
const ENV_PREFIX: &str = "CHATGATE";

/// Main configuration for the Chatgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Admission control configuration
    #[serde(default)]
    pub admission: AdmissionConfig,

    /// Shared-secret authentication
    #[serde(default)]
    pub auth: AuthConfig,

    /// Upstream model API configuration
    #[serde(default)]
    pub upstream: UpstreamConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8787))
}

/// Admission control configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Base URL of a shared coordinator. `None` runs one in-process.
    #[serde(default)]
    pub coordinator_url: Option<String>,

    /// Longest the gateway waits for a decision, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// What to do when the coordinator cannot answer
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Retry hint handed out when failing closed
    #[serde(default = "default_fail_closed_retry_secs")]
    pub fail_closed_retry_secs: u64,

    /// Idle-log sweep interval in seconds (0 disables)
    #[serde(default = "default_eviction_interval_secs")]
    pub eviction_interval_secs: u64,

    /// Per-dimension limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            coordinator_url: None,
            timeout_ms: default_timeout_ms(),
            failure_policy: FailurePolicy::default(),
            fail_closed_retry_secs: default_fail_closed_retry_secs(),
            eviction_interval_secs: default_eviction_interval_secs(),
            limits: LimitsConfig::default(),
        }
    }
}

fn default_timeout_ms() -> u64 {
    250
}

fn default_fail_closed_retry_secs() -> u64 {
    10
}

fn default_eviction_interval_secs() -> u64 {
    60
}

/// The two limit dimensions applied to every chat request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default)]
    pub source_address: LimitRule,

    #[serde(default)]
    pub credential: LimitRule,
}

/// A limit as written in configuration.
///
/// Unset fields fall back to the dimension's default, so a rule may override
/// only its ceiling or only its window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitRule {
    /// Events allowed per window
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_events: Option<u32>,
    /// Window length in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_secs: Option<u64>,
}

impl LimitRule {
    /// Fill unset fields from `default` and validate the result.
    pub fn resolve(&self, default: LimitSpec) -> Result<LimitSpec> {
        let max_events = self.max_events.unwrap_or(default.max_events());
        let window_secs = self.window_secs.unwrap_or(default.window().as_secs());
        LimitSpec::per_secs(max_events, window_secs)
    }

    fn window(&self, default: LimitSpec) -> Duration {
        self.window_secs
            .map(Duration::from_secs)
            .unwrap_or(default.window())
    }
}

/// Shared-secret authentication configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Environment variable holding the shared token
    #[serde(default = "default_token_env")]
    pub token_env: String,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
        }
    }
}

fn default_token_env() -> String {
    "AGENT_SHARED_TOKEN".to_string()
}

/// Upstream model API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_model")]
    pub model: String,

    /// Most recent non-system messages forwarded upstream
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Environment variable holding the API key
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_upstream_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            max_turns: default_max_turns(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_upstream_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_model() -> String {
    "gpt-4.1-mini".to_string()
}

fn default_max_turns() -> usize {
    24
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_upstream_timeout_secs() -> u64 {
    60
}

impl GatewayConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `CHATGATE__SECTION__KEY` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder =
                builder.add_source(config::File::from(path).format(config::FileFormat::Yaml));
        }
        let config: GatewayConfig = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse configuration: {}", e)))
    }

    /// Check everything that would otherwise fail per request.
    pub fn validate(&self) -> Result<()> {
        self.admission.limits()?;
        if self.admission.timeout_ms == 0 {
            return Err(GatewayError::InvalidInput(
                "admission.timeout_ms must be positive".to_string(),
            ));
        }
        if self.upstream.max_turns == 0 {
            return Err(GatewayError::InvalidInput(
                "upstream.max_turns must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl AdmissionConfig {
    /// The configured limits as validated specs.
    pub fn limits(&self) -> Result<AdmissionLimits> {
        Ok(AdmissionLimits {
            source_address: self
                .limits
                .source_address
                .resolve(LimitSpec::DEFAULT_SOURCE_ADDRESS)?,
            credential: self.limits.credential.resolve(LimitSpec::DEFAULT_CREDENTIAL)?,
        })
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fail_closed_retry(&self) -> Duration {
        Duration::from_secs(self.fail_closed_retry_secs.max(1))
    }

    /// Options for an in-process coordinator.
    ///
    /// Logs are kept for at least the largest configured window.
    pub fn coordinator_options(&self) -> CoordinatorOptions {
        let idle_after = self
            .limits
            .source_address
            .window(LimitSpec::DEFAULT_SOURCE_ADDRESS)
            .max(self.limits.credential.window(LimitSpec::DEFAULT_CREDENTIAL));
        let eviction_interval = match self.eviction_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        CoordinatorOptions {
            eviction_interval,
            idle_after,
            ..Default::default()
        }
    }
}
