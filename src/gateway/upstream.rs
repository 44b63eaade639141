//! Upstream model API client and conversation assembly.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::UpstreamConfig;
use crate::error::{GatewayError, Result};

/// Speaker of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Assemble the conversation sent upstream.
///
/// History entries that are not `{role: "user" | "assistant", content: string}`
/// objects are skipped. An empty system prompt is omitted.
pub fn build_conversation(system: &str, history: &[Value], user: &str) -> Vec<ChatMessage> {
    let mut conversation = Vec::with_capacity(history.len() + 2);
    if !system.is_empty() {
        conversation.push(ChatMessage::new(Role::System, system));
    }

    for entry in history {
        let role = match entry.get("role").and_then(Value::as_str) {
            Some("user") => Role::User,
            Some("assistant") => Role::Assistant,
            _ => continue,
        };
        let Some(content) = entry.get("content").and_then(Value::as_str) else {
            continue;
        };
        conversation.push(ChatMessage::new(role, content));
    }

    conversation.push(ChatMessage::new(Role::User, user));
    conversation
}

/// Keep a leading system message plus the last `max_turns` other messages.
pub fn trim_conversation(mut conversation: Vec<ChatMessage>, max_turns: usize) -> Vec<ChatMessage> {
    let start = match conversation.first() {
        Some(first) if first.role == Role::System => 1,
        _ => 0,
    };
    let rest = conversation.len() - start;
    if rest > max_turns {
        conversation.drain(start..start + rest - max_turns);
    }
    conversation
}

/// Concatenate every `output_text` item of a Responses API reply.
pub fn extract_response_text(response: &Value) -> String {
    let Some(output) = response.get("output").and_then(Value::as_array) else {
        return String::new();
    };

    let mut text = String::new();
    for item in output {
        let Some(content) = item.get("content").and_then(Value::as_array) else {
            continue;
        };
        for part in content {
            if part.get("type").and_then(Value::as_str) != Some("output_text") {
                continue;
            }
            if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                text.push_str(chunk);
            }
        }
    }
    text.trim().to_string()
}

/// A hosted model that turns a conversation into a reply.
#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, conversation: &[ChatMessage]) -> Result<String>;

    /// Whether the client holds the credentials `complete` needs.
    fn has_credentials(&self) -> bool {
        true
    }
}

/// Client for the OpenAI Responses API.
pub struct OpenAiClient {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &UpstreamConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                GatewayError::Config(format!("Failed to build upstream client: {}", e))
            })?;

        Ok(Self {
            client,
            endpoint: format!("{}/responses", config.base_url.trim_end_matches('/')),
            model: config.model.clone(),
            api_key: api_key.filter(|key| !key.is_empty()),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ModelClient for OpenAiClient {
    async fn complete(&self, conversation: &[ChatMessage]) -> Result<String> {
        let api_key = self.api_key.as_deref().ok_or_else(|| {
            GatewayError::Config("Server misconfigured: missing OPENAI_API_KEY".to_string())
        })?;

        debug!(
            model = %self.model,
            messages = conversation.len(),
            "Calling upstream model"
        );

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(api_key)
            .json(&json!({ "model": self.model, "input": conversation }))
            .send()
            .await
            .map_err(|e| GatewayError::Upstream(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Upstream model returned an error");
            let body = if body.is_empty() {
                status.canonical_reason().unwrap_or_default().to_string()
            } else {
                body
            };
            return Err(GatewayError::UpstreamStatus {
                status: status.as_u16(),
                body,
            });
        }

        let data: Value = response
            .json()
            .await
            .map_err(|e| GatewayError::Upstream(format!("Malformed upstream reply: {}", e)))?;
        Ok(extract_response_text(&data))
    }

    fn has_credentials(&self) -> bool {
        self.api_key.is_some()
    }
}
