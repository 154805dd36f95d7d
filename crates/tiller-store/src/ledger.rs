use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use tiller_config::BudgetConfig;
use tiller_core::{Tier, TokenUsage};

use crate::store::{now_ts, persist_err};

/// Why an approval was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    /// The spend would cross a ceiling. Overrides never bypass this.
    CeilingExceeded { scope: String },
    /// Non-trivial spend without a matching override token.
    OverrideRequired,
}

/// Outcome of an approval check.
#[derive(Debug, Clone, PartialEq)]
pub enum Approval {
    Approved,
    Denied {
        reason: DenialReason,
        /// Budget left in the tightest scope, so the caller can report
        /// exactly how much room remains.
        remaining_usd: f64,
    },
}

/// A scope's position against its ceiling.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BudgetStatus {
    pub accumulated_usd: f64,
    pub ceiling_usd: f64,
}

impl BudgetStatus {
    pub fn remaining(&self) -> f64 {
        (self.ceiling_usd - self.accumulated_usd).max(0.0)
    }
}

/// Cost ledger with two independent, simultaneously-enforced ceilings:
/// one per conversation, one per UTC day. `commit` is a guarded UPDATE —
/// the ledger total can never be observed above a ceiling, no matter how
/// many callers commit concurrently for the same scope.
pub struct BudgetLedger {
    db: Arc<Mutex<Connection>>,
    config: BudgetConfig,
}

const DAY_SCOPE: &str = "daily";
const CONV_PERIOD: &str = "all";

impl BudgetLedger {
    pub(crate) fn new(db: Arc<Mutex<Connection>>, config: BudgetConfig) -> Self {
        Self { db, config }
    }

    /// Approximate cost of a tier call. Pricing is pluggable via config;
    /// ordering tiers by cost is what matters, not token-exactness.
    pub fn estimate(&self, tier: Tier, usage: TokenUsage) -> f64 {
        let p = &self.config.prices;
        let (per_1k_in, per_1k_out) = match tier {
            Tier::Cached => (0.0, 0.0),
            Tier::Local => (p.local_per_1k_input, p.local_per_1k_output),
            Tier::Augmented => (p.augmented_per_1k_input, p.augmented_per_1k_output),
            Tier::Frontier => (p.frontier_per_1k_input, p.frontier_per_1k_output),
        };
        (usage.input_tokens as f64 / 1000.0) * per_1k_in
            + (usage.output_tokens as f64 / 1000.0) * per_1k_out
    }

    /// Decide whether an estimated spend may proceed.
    ///
    /// Ceiling checks come first and are absolute — an override token never
    /// unlocks spend past a ceiling. Below the ceilings, trivial costs are
    /// auto-approved and anything larger needs the shared-secret override.
    pub fn approve(
        &self,
        estimated_usd: f64,
        scope_key: &str,
        override_token: Option<&str>,
    ) -> tiller_core::Result<Approval> {
        let conv = self.status_row(scope_key, CONV_PERIOD, self.config.conversation_ceiling_usd)?;
        let day = self.status_row(DAY_SCOPE, &today(), self.config.daily_ceiling_usd)?;

        for (scope, status) in [(scope_key, conv), (DAY_SCOPE, day)] {
            if status.accumulated_usd + estimated_usd > status.ceiling_usd {
                warn!(
                    scope,
                    estimated = estimated_usd,
                    remaining = status.remaining(),
                    "spend denied — ceiling would be crossed"
                );
                return Ok(Approval::Denied {
                    reason: DenialReason::CeilingExceeded {
                        scope: scope.to_string(),
                    },
                    remaining_usd: status.remaining(),
                });
            }
        }

        if estimated_usd < self.config.trivial_threshold_usd {
            return Ok(Approval::Approved);
        }

        match (override_token, self.config.override_token.as_deref()) {
            (Some(given), Some(secret)) if given == secret => Ok(Approval::Approved),
            _ => {
                debug!(
                    scope = scope_key,
                    estimated = estimated_usd,
                    "non-trivial spend without valid override token"
                );
                Ok(Approval::Denied {
                    reason: DenialReason::OverrideRequired,
                    remaining_usd: conv.remaining().min(day.remaining()),
                })
            }
        }
    }

    /// Record actual spend against both scopes atomically.
    ///
    /// Each scope is a compare-and-increment: the UPDATE only lands when
    /// the new total stays under the ceiling, so concurrent commits for
    /// the same scope serialize correctly at the database.
    pub fn commit(&self, scope_key: &str, actual_usd: f64) -> tiller_core::Result<()> {
        self.commit_scope(scope_key, CONV_PERIOD, self.config.conversation_ceiling_usd, actual_usd)?;
        self.commit_scope(DAY_SCOPE, &today(), self.config.daily_ceiling_usd, actual_usd)?;
        Ok(())
    }

    /// Position of a conversation scope against its ceiling.
    pub fn status(&self, scope_key: &str) -> tiller_core::Result<BudgetStatus> {
        self.status_row(scope_key, CONV_PERIOD, self.config.conversation_ceiling_usd)
    }

    /// Position of today's autonomous-spend scope.
    pub fn day_status(&self) -> tiller_core::Result<BudgetStatus> {
        self.status_row(DAY_SCOPE, &today(), self.config.daily_ceiling_usd)
    }

    fn commit_scope(
        &self,
        scope_key: &str,
        period: &str,
        ceiling: f64,
        actual_usd: f64,
    ) -> tiller_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "INSERT OR IGNORE INTO budget_ledger
                (scope_key, period, accumulated_cost_usd, ceiling_usd, updated_at)
             VALUES (?1, ?2, 0.0, ?3, ?4)",
            rusqlite::params![scope_key, period, ceiling, now_ts()],
        )
        .map_err(persist_err)?;

        let updated = db
            .execute(
                "UPDATE budget_ledger
                 SET accumulated_cost_usd = accumulated_cost_usd + ?3, updated_at = ?4
                 WHERE scope_key = ?1 AND period = ?2
                   AND accumulated_cost_usd + ?3 <= ceiling_usd",
                rusqlite::params![scope_key, period, actual_usd, now_ts()],
            )
            .map_err(persist_err)?;

        if updated == 0 {
            let status = self.read_row(&db, scope_key, period, ceiling)?;
            return Err(tiller_core::TillerError::BudgetExceeded {
                scope: scope_key.to_string(),
                attempted: actual_usd,
                remaining: status.remaining(),
                ceiling: status.ceiling_usd,
            });
        }
        Ok(())
    }

    fn status_row(
        &self,
        scope_key: &str,
        period: &str,
        ceiling: f64,
    ) -> tiller_core::Result<BudgetStatus> {
        let db = self.db.lock();
        self.read_row(&db, scope_key, period, ceiling)
    }

    fn read_row(
        &self,
        db: &Connection,
        scope_key: &str,
        period: &str,
        default_ceiling: f64,
    ) -> tiller_core::Result<BudgetStatus> {
        let row = db
            .query_row(
                "SELECT accumulated_cost_usd, ceiling_usd FROM budget_ledger
                 WHERE scope_key = ?1 AND period = ?2",
                rusqlite::params![scope_key, period],
                |row| Ok((row.get::<_, f64>(0)?, row.get::<_, f64>(1)?)),
            )
            .optional()
            .map_err(persist_err)?;

        Ok(match row {
            Some((accumulated, ceiling)) => BudgetStatus {
                accumulated_usd: accumulated,
                ceiling_usd: ceiling,
            },
            None => BudgetStatus {
                accumulated_usd: 0.0,
                ceiling_usd: default_ceiling,
            },
        })
    }
}

fn today() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}
