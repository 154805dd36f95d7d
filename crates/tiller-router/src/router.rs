use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use tiller_config::{CacheConfig, RouterConfig};
use tiller_core::{
    InferenceTier, Result, RoutingRequest, RoutingResult, Tier, TierConstraints, TillerError,
    TokenUsage,
};
use tiller_store::{Approval, AuditKind, AuditRecord, DenialReason, Store};

use crate::confidence::ConfidenceScorer;
use crate::fingerprint::fingerprint;

/// Escalation order. Cheapest and fastest first — accepting at the first
/// tier that clears the confidence threshold is the cost tie-break.
const ESCALATION_ORDER: [Tier; 3] = [Tier::Local, Tier::Augmented, Tier::Frontier];

/// One tier's attempt at a request.
#[derive(Debug, Clone)]
struct Candidate {
    text: String,
    tier: Tier,
    confidence: f64,
    cost_usd: f64,
    latency_ms: u64,
}

/// Routes each request to the cheapest tier that can answer it confidently.
///
/// The router never lets a tier failure escape: an errored or timed-out
/// call scores confidence 0 and simply escalates. Paid escalations are
/// gated by the budget ledger, and every decision lands in the audit log
/// before the result is returned.
pub struct TierRouter {
    backends: Vec<Arc<dyn InferenceTier>>,
    store: Arc<Store>,
    config: RouterConfig,
    cache_config: CacheConfig,
    scorer: ConfidenceScorer,
}

impl TierRouter {
    pub fn new(store: Arc<Store>, config: RouterConfig, cache_config: CacheConfig) -> Self {
        let scorer = ConfidenceScorer::new(config.weights.clone());
        Self {
            backends: vec![],
            store,
            config,
            cache_config,
            scorer,
        }
    }

    /// Register an inference backend. One backend per tier is expected;
    /// with several, the first registered for a tier wins.
    pub fn add_backend(&mut self, backend: Arc<dyn InferenceTier>) {
        info!(backend = backend.name(), tier = %backend.tier(), "registered inference backend");
        self.backends.push(backend);
    }

    fn backend_for(&self, tier: Tier) -> Option<&Arc<dyn InferenceTier>> {
        self.backends.iter().find(|b| b.tier() == tier)
    }

    fn timeout_for(&self, tier: Tier) -> Duration {
        let ms = match tier {
            Tier::Cached => 0,
            Tier::Local => self.config.local_timeout_ms,
            Tier::Augmented => self.config.augmented_timeout_ms,
            Tier::Frontier => self.config.frontier_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    /// Route one request. Never blocks past the sum of the per-tier
    /// timeouts; never returns a raw tier error.
    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutingResult> {
        let started = Instant::now();
        let fp = fingerprint(
            &request.prompt,
            &[format!("verbosity:{}", request.verbosity)],
        );

        // Freshness always forces a fresh path, even against a
        // high-confidence cached entry.
        if !request.freshness_required {
            if let Some(entry) = self.store.cache.get(&fp)? {
                if entry.confidence >= self.config.confidence_threshold {
                    debug!(request = %request.request_id, "cache hit");
                    let result = RoutingResult {
                        request_id: request.request_id,
                        output: entry.response,
                        tier: Tier::Cached,
                        confidence: entry.confidence,
                        cost_usd: 0.0,
                        latency_ms: started.elapsed().as_millis() as u64,
                        cached: true,
                        requires_confirmation: None,
                    };
                    self.audit_decision(request, &result, 0)?;
                    return Ok(result);
                }
            }
        }

        let scope_key = request.conversation_id.to_string();
        let mut best: Option<Candidate> = None;
        let mut escalations = 0u32;
        let mut budget_stopped = false;

        for tier in ESCALATION_ORDER {
            let backend = match self.backend_for(tier) {
                Some(b) => b,
                None => continue,
            };

            // Paid tiers clear the ledger before we spend anything.
            if tier != Tier::Local {
                let projected = TokenUsage {
                    input_tokens: (request.prompt.len() / 4) as u32,
                    output_tokens: self.config.max_tokens / 2,
                };
                let estimated = self.store.ledger.estimate(tier, projected);
                match self.store.ledger.approve(
                    estimated,
                    &scope_key,
                    request.budget_override_token.as_deref(),
                )? {
                    Approval::Approved => {}
                    Approval::Denied {
                        reason,
                        remaining_usd,
                    } => {
                        warn!(
                            tier = %tier,
                            estimated,
                            remaining = remaining_usd,
                            ?reason,
                            "escalation denied by budget ledger"
                        );
                        if best.is_none() && matches!(reason, DenialReason::CeilingExceeded { .. })
                        {
                            let status = self.store.ledger.status(&scope_key)?;
                            self.audit_denied(request, tier, remaining_usd)?;
                            return Err(TillerError::BudgetExceeded {
                                scope: scope_key,
                                attempted: estimated,
                                remaining: remaining_usd,
                                ceiling: status.ceiling_usd,
                            });
                        }
                        budget_stopped = true;
                        break;
                    }
                }
            }

            escalations += 1;
            let candidate = self.call_tier(backend.as_ref(), tier, request, &scope_key).await;

            let accept = candidate.confidence >= self.config.confidence_threshold
                && !candidate.text.is_empty();

            if !candidate.text.is_empty()
                && best
                    .as_ref()
                    .map_or(true, |b| candidate.confidence > b.confidence)
            {
                best = Some(candidate.clone());
            }

            if accept {
                break;
            }
            debug!(
                tier = %tier,
                confidence = candidate.confidence,
                threshold = self.config.confidence_threshold,
                "below threshold — escalating"
            );
        }

        let chosen = match best {
            Some(c) => c,
            None => {
                // Nothing produced any output at all.
                self.audit_failure(request, budget_stopped)?;
                return Err(TillerError::AllTiersFailed);
            }
        };

        let confident = chosen.confidence >= self.config.confidence_threshold;
        if confident {
            // Write-through on any confident result.
            self.store.cache.put(
                &fp,
                &chosen.text,
                chosen.confidence,
                Duration::from_secs(self.cache_config.ttl_secs),
            )?;
        }

        let result = RoutingResult {
            request_id: request.request_id,
            output: chosen.text,
            tier: chosen.tier,
            confidence: chosen.confidence,
            cost_usd: chosen.cost_usd,
            latency_ms: started.elapsed().as_millis() as u64,
            cached: false,
            requires_confirmation: None,
        };
        self.audit_decision(request, &result, escalations)?;

        info!(
            request = %request.request_id,
            tier = %result.tier,
            confidence = result.confidence,
            cost = result.cost_usd,
            latency_ms = result.latency_ms,
            "routing decision"
        );
        Ok(result)
    }

    /// Call one tier under its timeout. Errors and timeouts come back as
    /// a confidence-0 candidate, which the escalation loop treats like
    /// any other low-confidence result.
    async fn call_tier(
        &self,
        backend: &dyn InferenceTier,
        tier: Tier,
        request: &RoutingRequest,
        scope_key: &str,
    ) -> Candidate {
        let constraints = TierConstraints {
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
            context: vec![],
        };
        let call_started = Instant::now();
        let timeout = self.timeout_for(tier);

        let outcome = tokio::time::timeout(timeout, backend.generate(&request.prompt, &constraints)).await;

        let latency_ms = call_started.elapsed().as_millis() as u64;
        match outcome {
            Ok(Ok(response)) => {
                let confidence = self.scorer.score(&response, request);
                let cost = self.store.ledger.estimate(tier, response.usage);
                if cost > 0.0 {
                    // Commit actual spend. A refused commit means the
                    // ceiling is hit; the response already exists, so we
                    // keep it but the ledger stays capped.
                    if let Err(e) = self.store.ledger.commit(scope_key, cost) {
                        warn!(tier = %tier, error = %e, "cost commit refused at ceiling");
                    }
                }
                Candidate {
                    text: response.text,
                    tier,
                    confidence,
                    cost_usd: cost,
                    latency_ms,
                }
            }
            Ok(Err(e)) => {
                warn!(tier = %tier, backend = backend.name(), error = %e, "tier call failed");
                Candidate {
                    text: String::new(),
                    tier,
                    confidence: 0.0,
                    cost_usd: 0.0,
                    latency_ms,
                }
            }
            Err(_) => {
                warn!(
                    tier = %tier,
                    backend = backend.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    "tier call timed out — canceled"
                );
                Candidate {
                    text: String::new(),
                    tier,
                    confidence: 0.0,
                    cost_usd: 0.0,
                    latency_ms,
                }
            }
        }
    }

    fn audit_decision(
        &self,
        request: &RoutingRequest,
        result: &RoutingResult,
        escalations: u32,
    ) -> Result<()> {
        self.store.audit.append(&AuditRecord::new(
            AuditKind::RoutingDecision,
            request.request_id.to_string(),
            serde_json::json!({
                "conversation_id": request.conversation_id.to_string(),
                "tier": result.tier.as_str(),
                "confidence": result.confidence,
                "cost_usd": result.cost_usd,
                "latency_ms": result.latency_ms,
                "cached": result.cached,
                "escalations": escalations,
                "freshness_required": request.freshness_required,
            }),
        ))
    }

    fn audit_denied(&self, request: &RoutingRequest, tier: Tier, remaining: f64) -> Result<()> {
        self.store.audit.append(&AuditRecord::new(
            AuditKind::RoutingDecision,
            request.request_id.to_string(),
            serde_json::json!({
                "conversation_id": request.conversation_id.to_string(),
                "outcome": "budget_denied",
                "tier": tier.as_str(),
                "remaining_usd": remaining,
            }),
        ))
    }

    fn audit_failure(&self, request: &RoutingRequest, budget_stopped: bool) -> Result<()> {
        self.store.audit.append(&AuditRecord::new(
            AuditKind::RoutingDecision,
            request.request_id.to_string(),
            serde_json::json!({
                "conversation_id": request.conversation_id.to_string(),
                "outcome": "all_tiers_failed",
                "budget_stopped": budget_stopped,
            }),
        ))
    }
}
