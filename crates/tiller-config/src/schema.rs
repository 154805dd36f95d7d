use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

/// Root configuration — maps to `tiller.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TillerConfig {
    pub router: RouterConfig,
    pub cache: CacheConfig,
    pub budget: BudgetConfig,
    pub confirmation: ConfirmationConfig,
    pub scheduler: SchedulerConfig,
    pub store: StoreConfig,
    pub logging: LoggingConfig,
}

// ── Router ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Composite confidence threshold — a tier response at or above this
    /// is accepted without escalation.
    pub confidence_threshold: f64,
    /// Per-tier call timeouts in milliseconds.
    pub local_timeout_ms: u64,
    pub augmented_timeout_ms: u64,
    pub frontier_timeout_ms: u64,
    /// Weights for the composite confidence score. Tunable defaults, not
    /// a fixed contract — they only need to sum to roughly 1.0.
    pub weights: ConfidenceWeights,
    /// Max tokens requested from any tier.
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.82,
            local_timeout_ms: 10_000,
            augmented_timeout_ms: 20_000,
            frontier_timeout_ms: 45_000,
            weights: ConfidenceWeights::default(),
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfidenceWeights {
    pub completeness: f64,
    pub certainty: f64,
    pub tool_effectiveness: f64,
    pub quality: f64,
    pub metadata: f64,
}

impl Default for ConfidenceWeights {
    fn default() -> Self {
        Self {
            completeness: 0.25,
            certainty: 0.25,
            tool_effectiveness: 0.15,
            quality: 0.20,
            metadata: 0.15,
        }
    }
}

impl ConfidenceWeights {
    pub fn sum(&self) -> f64 {
        self.completeness + self.certainty + self.tool_effectiveness + self.quality + self.metadata
    }
}

// ── Cache ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Default TTL for cached responses, in seconds.
    pub ttl_secs: u64,
    /// Size cap — the sweep evicts least-recently-used entries beyond this.
    pub max_entries: usize,
    /// Interval of the background expiry/eviction sweep.
    pub sweep_interval_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 3600,
            max_entries: 10_000,
            sweep_interval_secs: 300,
        }
    }
}

// ── Budget ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    /// Ceiling per conversation, USD. Enforced independently of the daily
    /// ceiling — both must pass.
    pub conversation_ceiling_usd: f64,
    /// Ceiling per UTC day across all autonomous and interactive spend.
    pub daily_ceiling_usd: f64,
    /// Estimated costs under this are auto-approved without an override.
    pub trivial_threshold_usd: f64,
    /// Shared secret a caller presents to approve non-trivial spend.
    pub override_token: Option<String>,
    /// Per-tier price table, USD per 1K tokens.
    pub prices: PriceTable,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            conversation_ceiling_usd: 0.50,
            daily_ceiling_usd: 5.00,
            trivial_threshold_usd: 0.01,
            override_token: None,
            prices: PriceTable::default(),
        }
    }
}

/// Approximate pricing — the point is ordering tiers by cost, not
/// token-accurate accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PriceTable {
    pub local_per_1k_input: f64,
    pub local_per_1k_output: f64,
    pub augmented_per_1k_input: f64,
    pub augmented_per_1k_output: f64,
    pub frontier_per_1k_input: f64,
    pub frontier_per_1k_output: f64,
}

impl Default for PriceTable {
    fn default() -> Self {
        Self {
            local_per_1k_input: 0.0,
            local_per_1k_output: 0.0,
            augmented_per_1k_input: 0.0002,
            augmented_per_1k_output: 0.0002,
            frontier_per_1k_input: 0.003,
            frontier_per_1k_output: 0.015,
        }
    }
}

// ── Confirmation ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfirmationConfig {
    /// How long a confirmation token stays valid, in seconds.
    pub ttl_secs: u64,
    /// Mismatched tokens allowed before the pending action locks out.
    pub max_attempts: u32,
}

impl Default for ConfirmationConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 300,
            max_attempts: 3,
        }
    }
}

// ── Scheduler ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// How often the scheduler checks for due jobs, in seconds.
    pub tick_secs: u64,
    /// TTL on job locks — a crashed holder's lock becomes claimable after
    /// this without manual intervention.
    pub lock_ttl_secs: u64,
    /// Wall-clock timeout for a single job run.
    pub job_timeout_secs: u64,
    /// Capped retry attempts for transient job failures.
    pub max_retries: u32,
    /// Base delay for exponential backoff between retries.
    pub retry_base_delay_ms: u64,
    /// Worker pool size for batch jobs.
    pub max_concurrent_task_items: usize,
    /// Per-item timeout inside a batch job.
    pub item_timeout_secs: u64,
    /// Jobs registered from config at startup.
    pub jobs: Vec<JobConfig>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: 10,
            lock_ttl_secs: 120,
            job_timeout_secs: 300,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            max_concurrent_task_items: 4,
            item_timeout_secs: 60,
            jobs: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Human-readable name, doubles as the lock key.
    pub name: String,
    /// Cron expression or `"every:<secs>"` interval spec.
    pub schedule: String,
    /// Job kind: "research", "task_batch", "maintenance".
    pub kind: String,
    /// Kind-specific payload (research prompt, batch items, ...).
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

// ── Store ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Path to the SQLite database.
    pub db_path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("tiller.db"),
        }
    }
}

// ── Logging ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level filter, e.g. "info", "tiller_router=debug".
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Validation ─────────────────────────────────────────────────

impl TillerConfig {
    /// Validate the config. Returns soft warnings; hard problems are errors.
    pub fn validate(&self) -> Result<Vec<String>, String> {
        let mut warnings = Vec::new();

        if !(0.0..=1.0).contains(&self.router.confidence_threshold) {
            return Err(format!(
                "router.confidence_threshold must be in [0,1], got {}",
                self.router.confidence_threshold
            ));
        }
        let weight_sum = self.router.weights.sum();
        if (weight_sum - 1.0).abs() > 0.05 {
            warnings.push(format!(
                "router.weights sum to {weight_sum:.2}, expected ~1.0 — scores will be rescaled"
            ));
        }
        if self.budget.daily_ceiling_usd <= 0.0 {
            return Err("budget.daily_ceiling_usd must be positive".into());
        }
        if self.budget.conversation_ceiling_usd <= 0.0 {
            return Err("budget.conversation_ceiling_usd must be positive".into());
        }
        if self.budget.trivial_threshold_usd > self.budget.conversation_ceiling_usd {
            warnings.push(
                "budget.trivial_threshold_usd exceeds the conversation ceiling — every call will be trivially approved until the ceiling hits".into(),
            );
        }
        if self.confirmation.ttl_secs == 0 {
            return Err("confirmation.ttl_secs must be nonzero".into());
        }
        if self.scheduler.max_concurrent_task_items == 0 {
            return Err("scheduler.max_concurrent_task_items must be nonzero".into());
        }
        for job in &self.scheduler.jobs {
            validate_schedule_spec(&job.schedule)
                .map_err(|e| format!("scheduler.jobs[{}]: {}", job.name, e))?;
        }

        Ok(warnings)
    }
}

/// Accepts a cron expression or `every:<secs>`.
pub fn validate_schedule_spec(spec: &str) -> Result<(), String> {
    if let Some(rest) = spec.strip_prefix("every:") {
        return match rest.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(()),
            _ => Err(format!("invalid interval spec '{spec}'")),
        };
    }
    cron::Schedule::from_str(spec)
        .map(|_| ())
        .map_err(|e| format!("invalid cron expression '{spec}': {e}"))
}
