use thiserror::Error;

/// Unified error type for the entire Tiller core.
#[derive(Error, Debug)]
pub enum TillerError {
    // ── Tier / routing errors ──────────────────────────────────
    #[error("tier call failed: {tier}: {reason}")]
    TierCall { tier: String, reason: String },

    #[error("tier timed out after {timeout_ms}ms: {tier}")]
    TierTimeout { tier: String, timeout_ms: u64 },

    #[error("all tiers failed, no output produced")]
    AllTiersFailed,

    // ── Budget errors ──────────────────────────────────────────
    #[error("budget exceeded for {scope}: would spend {attempted:.4}, remaining {remaining:.4} of {ceiling:.4}")]
    BudgetExceeded {
        scope: String,
        attempted: f64,
        remaining: f64,
        ceiling: f64,
    },

    // ── Tool errors ────────────────────────────────────────────
    #[error("tool not registered: {0}")]
    ToolNotFound(String),

    #[error("tool execution failed: {tool}: {reason}")]
    ToolExecution { tool: String, reason: String },

    // ── Scheduler / lock errors ────────────────────────────────
    #[error("lock held by another worker: {lock_key}")]
    LockContention { lock_key: String },

    #[error("invalid schedule spec: {0}")]
    InvalidSchedule(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("job timed out after {timeout_secs}s: {job_id}")]
    JobTimeout { job_id: String, timeout_secs: u64 },

    // ── Persistence errors ─────────────────────────────────────
    /// A state or audit write failed. Fatal to the enclosing request —
    /// a response must never be returned without its audit trail.
    #[error("persistence failure: {0}")]
    Persistence(String),

    // ── Config errors ──────────────────────────────────────────
    #[error("config error: {0}")]
    Config(String),

    #[error("config validation failed: {field}: {reason}")]
    ConfigValidation { field: String, reason: String },

    // ── Generic wrappers ───────────────────────────────────────
    #[error("transient io error: {0}")]
    TransientIo(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl TillerError {
    /// Whether this error class is worth a local retry (network hiccup,
    /// tier overload) as opposed to a hard stop.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TillerError::TransientIo(_)
                | TillerError::TierCall { .. }
                | TillerError::TierTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, TillerError>;
