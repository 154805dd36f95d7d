use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::{TokenUsage, ToolResult};
use crate::Result;

/// Generation constraints passed down to a tier backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierConstraints {
    pub max_tokens: u32,
    pub temperature: f32,
    /// Extra context lines (retrieval results, conversation summary)
    /// prepended by the router. Empty for the plain local path.
    #[serde(default)]
    pub context: Vec<String>,
}

impl Default for TierConstraints {
    fn default() -> Self {
        Self {
            max_tokens: 2048,
            temperature: 0.7,
            context: vec![],
        }
    }
}

/// A completed generation from a tier backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierResponse {
    pub text: String,
    pub usage: TokenUsage,
    /// Backend-reported metadata: model name, finish reason, optional
    /// self-reported quality signals. Shape is backend-specific.
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Trait implemented once per inference backend (local, augmented, frontier).
///
/// Implementations live outside the core. The router only assumes that
/// `generate` either returns a response or an error — it never lets a tier
/// error propagate past the escalation path.
#[async_trait]
pub trait InferenceTier: Send + Sync {
    /// Human-readable backend name for logs and audit records.
    fn name(&self) -> &str;

    /// Which routing tier this backend serves.
    fn tier(&self) -> crate::types::Tier;

    async fn generate(&self, prompt: &str, constraints: &TierConstraints) -> Result<TierResponse>;
}

/// Outcome of a tool adapter invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ToolOutcome {
    pub fn into_result(self, call_id: &str) -> ToolResult {
        if self.success {
            ToolResult::ok(call_id, self.output)
        } else {
            ToolResult::err(call_id, self.error.unwrap_or(self.output))
        }
    }
}

/// Trait implemented by each external tool collaborator (CAD generation,
/// printer control, home automation, semantic memory, web search).
#[async_trait]
pub trait ToolAdapter: Send + Sync {
    /// Adapter name for logs and audit records.
    fn name(&self) -> &str;

    async fn invoke(&self, tool_name: &str, args: &serde_json::Value) -> Result<ToolOutcome>;
}
