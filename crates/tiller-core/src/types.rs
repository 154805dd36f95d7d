use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a conversation.
pub type ConversationId = Uuid;

/// Unique identifier for a single routing request.
pub type RequestId = Uuid;

/// Unique identifier for a scheduled job.
pub type JobId = Uuid;

/// The cost/latency/quality class of an inference backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Served from the semantic cache — no backend call at all.
    Cached,
    /// On-device model. Cheapest, fastest, weakest.
    Local,
    /// Local model augmented with retrieval / search context.
    Augmented,
    /// Cloud frontier model. Most capable, most expensive.
    Frontier,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Cached => "cached",
            Tier::Local => "local",
            Tier::Augmented => "augmented",
            Tier::Frontier => "frontier",
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An inbound request to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingRequest {
    pub conversation_id: ConversationId,
    pub request_id: RequestId,
    pub prompt: String,
    /// When true, the cache is never consulted and a fresh tier call is
    /// always made, regardless of cached confidence.
    #[serde(default)]
    pub freshness_required: bool,
    /// Shared-secret token that lets a caller approve non-trivial spend.
    #[serde(default)]
    pub budget_override_token: Option<String>,
    /// Response verbosity, 1 (terse) to 5 (exhaustive).
    #[serde(default = "default_verbosity")]
    pub verbosity: u8,
}

fn default_verbosity() -> u8 {
    3
}

impl RoutingRequest {
    pub fn new(conversation_id: ConversationId, prompt: impl Into<String>) -> Self {
        Self {
            conversation_id,
            request_id: Uuid::new_v4(),
            prompt: prompt.into(),
            freshness_required: false,
            budget_override_token: None,
            verbosity: 3,
        }
    }
}

/// The router's answer for a single request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingResult {
    pub request_id: RequestId,
    pub output: String,
    pub tier: Tier,
    /// Composite confidence in [0, 1].
    pub confidence: f64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub cached: bool,
    /// Set while the conversation has a hazardous action parked awaiting
    /// human confirmation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requires_confirmation: Option<PendingAction>,
}

/// Descriptor of a hazardous action parked behind a confirmation token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PendingAction {
    pub name: String,
    pub args: serde_json::Value,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmation_token: String,
    pub attempt_count: u32,
}

impl PendingAction {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The prompt shown to the human. Always states the token expiry.
    pub fn prompt(&self) -> String {
        format!(
            "Confirm '{}' with token {} before {}",
            self.name,
            self.confirmation_token,
            self.expires_at.format("%H:%M:%S UTC")
        )
    }
}

/// Token counts reported by a tier call.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl TokenUsage {
    pub fn total(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

/// A request from the router (or a scheduled job) to invoke a tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

impl ToolCall {
    pub fn new(tool_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tool_name: tool_name.into(),
            arguments,
        }
    }
}

/// The result of one tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub tool_call_id: String,
    pub content: String,
    pub is_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl ToolResult {
    pub fn ok(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.to_string(),
            content: content.into(),
            is_error: false,
            data: None,
        }
    }

    pub fn err(call_id: &str, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: call_id.to_string(),
            content: content.into(),
            is_error: true,
            data: None,
        }
    }
}
