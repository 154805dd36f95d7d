//! Integration tests for the tiered router: escalation, caching,
//! budget gating, and failure absorption.

use std::sync::Arc;

use tiller_config::TillerConfig;
use tiller_core::{RoutingRequest, Tier, TillerError};
use tiller_router::{MockOutcome, MockTier, TierRouter};
use tiller_store::Store;
use uuid::Uuid;

const STRONG: &str = "The melting point of PLA is around 175 degrees Celsius, and a nozzle \
                      temperature between 190 and 220 degrees works well for most blends.";
const WEAK: &str = "I'm not sure, possibly around 175.";

fn test_config() -> TillerConfig {
    let mut config = TillerConfig::default();
    // Short timeouts keep hang tests fast
    config.router.local_timeout_ms = 200;
    config.router.augmented_timeout_ms = 200;
    config.router.frontier_timeout_ms = 200;
    // Paid-tier estimates auto-approve; override gating has its own tests
    config.budget.trivial_threshold_usd = 0.05;
    config
}

struct Fixture {
    router: TierRouter,
    local: Arc<MockTier>,
    augmented: Arc<MockTier>,
    frontier: Arc<MockTier>,
    store: Arc<Store>,
}

fn fixture(config: TillerConfig) -> Fixture {
    let store = Arc::new(Store::open_in_memory(&config).unwrap());
    let local = Arc::new(MockTier::new("local-mock", Tier::Local));
    let augmented = Arc::new(MockTier::new("augmented-mock", Tier::Augmented));
    let frontier = Arc::new(MockTier::new("frontier-mock", Tier::Frontier));

    let mut router = TierRouter::new(
        Arc::clone(&store),
        config.router.clone(),
        config.cache.clone(),
    );
    router.add_backend(local.clone());
    router.add_backend(augmented.clone());
    router.add_backend(frontier.clone());

    Fixture {
        router,
        local,
        augmented,
        frontier,
        store,
    }
}

mod escalation {
    use super::*;

    #[tokio::test]
    async fn test_confident_local_answer_never_escalates() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(STRONG, 0.95));

        let req = RoutingRequest::new(Uuid::new_v4(), "melting point of PLA?");
        let result = f.router.route(&req).await.unwrap();

        assert_eq!(result.tier, Tier::Local);
        assert!(result.confidence >= 0.82);
        assert!(!result.cached);
        assert_eq!(f.local.calls(), 1);
        assert_eq!(f.augmented.calls(), 0);
        assert_eq!(f.frontier.calls(), 0);
    }

    #[tokio::test]
    async fn test_low_confidence_escalates_one_tier() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(WEAK, 0.1));
        f.augmented.push(MockOutcome::confident(STRONG, 0.95));

        let req = RoutingRequest::new(Uuid::new_v4(), "melting point of PLA?");
        let result = f.router.route(&req).await.unwrap();

        assert_eq!(result.tier, Tier::Augmented);
        assert_eq!(f.local.calls(), 1);
        assert_eq!(f.augmented.calls(), 1);
        assert_eq!(f.frontier.calls(), 0);
    }

    #[tokio::test]
    async fn test_tier_error_absorbed_and_escalated() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::Fail("model crashed".into()));
        f.augmented.push(MockOutcome::confident(STRONG, 0.95));

        let req = RoutingRequest::new(Uuid::new_v4(), "status?");
        let result = f.router.route(&req).await.unwrap();

        assert_eq!(result.tier, Tier::Augmented);
    }

    #[tokio::test]
    async fn test_tier_timeout_absorbed_and_escalated() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::Hang);
        f.augmented.push(MockOutcome::confident(STRONG, 0.95));

        let req = RoutingRequest::new(Uuid::new_v4(), "status?");
        let result = f.router.route(&req).await.unwrap();

        assert_eq!(result.tier, Tier::Augmented);
        assert_eq!(f.local.calls(), 1);
    }

    #[tokio::test]
    async fn test_all_tiers_failed_is_terminal_error() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::Fail("down".into()));
        f.augmented.push(MockOutcome::Fail("down".into()));
        f.frontier.push(MockOutcome::Fail("down".into()));

        let req = RoutingRequest::new(Uuid::new_v4(), "anything");
        let err = f.router.route(&req).await.unwrap_err();

        assert!(matches!(err, TillerError::AllTiersFailed));
        // The failure is still audited
        assert!(f.store.audit.count().unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_below_threshold_everywhere_returns_best_available() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(WEAK, 0.1));
        f.augmented.push(MockOutcome::confident(WEAK, 0.2));
        f.frontier.push(MockOutcome::confident(WEAK, 0.3));

        let req = RoutingRequest::new(Uuid::new_v4(), "hard question");
        let result = f.router.route(&req).await.unwrap();

        // Best effort: an answer comes back, flagged below threshold
        assert!(!result.output.is_empty());
        assert!(result.confidence < 0.82);
        assert_eq!(result.tier, Tier::Frontier);
        assert_eq!(f.frontier.calls(), 1);
    }
}

mod caching {
    use super::*;

    #[tokio::test]
    async fn test_confident_result_cached_for_identical_prompt() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(STRONG, 0.95));

        let conv = Uuid::new_v4();
        let first = f
            .router
            .route(&RoutingRequest::new(conv, "melting point of PLA?"))
            .await
            .unwrap();
        assert!(!first.cached);

        // Same prompt modulo case/whitespace hits the cache, no tier call
        let second = f
            .router
            .route(&RoutingRequest::new(conv, "  Melting point of PLA? "))
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.tier, Tier::Cached);
        assert_eq!(second.cost_usd, 0.0);
        assert_eq!(second.output, first.output);
        assert_eq!(f.local.calls(), 1);
    }

    #[tokio::test]
    async fn test_freshness_required_never_served_from_cache() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(STRONG, 0.95));
        f.local.push(MockOutcome::confident(STRONG, 0.95));

        let conv = Uuid::new_v4();
        f.router
            .route(&RoutingRequest::new(conv, "garage door state"))
            .await
            .unwrap();

        let mut fresh = RoutingRequest::new(conv, "garage door state");
        fresh.freshness_required = true;
        let result = f.router.route(&fresh).await.unwrap();

        assert!(!result.cached);
        assert_eq!(f.local.calls(), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_result_not_cached() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(WEAK, 0.1));
        f.augmented.push(MockOutcome::confident(WEAK, 0.1));
        f.frontier.push(MockOutcome::confident(WEAK, 0.1));

        let conv = Uuid::new_v4();
        f.router
            .route(&RoutingRequest::new(conv, "mystery"))
            .await
            .unwrap();
        assert!(f.store.cache.is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_different_verbosity_is_a_different_cache_key() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(STRONG, 0.95));
        f.local.push(MockOutcome::confident(STRONG, 0.95));

        let conv = Uuid::new_v4();
        f.router
            .route(&RoutingRequest::new(conv, "explain PLA"))
            .await
            .unwrap();

        let mut verbose = RoutingRequest::new(conv, "explain PLA");
        verbose.verbosity = 5;
        let result = f.router.route(&verbose).await.unwrap();

        assert!(!result.cached);
        assert_eq!(f.local.calls(), 2);
    }
}

mod budget {
    use super::*;

    #[tokio::test]
    async fn test_exhausted_ceiling_blocks_paid_escalation() {
        let mut config = test_config();
        config.budget.conversation_ceiling_usd = 0.000_001;

        let f = fixture(config);
        f.local.push(MockOutcome::confident(WEAK, 0.1));

        let req = RoutingRequest::new(Uuid::new_v4(), "needs frontier");
        let result = f.router.route(&req).await.unwrap();

        // Local ran; the paid tiers were never consulted
        assert_eq!(result.tier, Tier::Local);
        assert!(result.confidence < 0.82);
        assert_eq!(f.augmented.calls(), 0);
        assert_eq!(f.frontier.calls(), 0);
    }

    #[tokio::test]
    async fn test_exhausted_ceiling_with_no_output_is_budget_error() {
        let mut config = test_config();
        config.budget.conversation_ceiling_usd = 0.000_001;

        let f = fixture(config);
        f.local.push(MockOutcome::Fail("down".into()));

        let req = RoutingRequest::new(Uuid::new_v4(), "needs frontier");
        let err = f.router.route(&req).await.unwrap_err();

        assert!(matches!(err, TillerError::BudgetExceeded { .. }));
    }

    #[tokio::test]
    async fn test_non_trivial_spend_needs_override_token() {
        let mut config = test_config();
        // Every paid call counts as non-trivial
        config.budget.trivial_threshold_usd = 0.0;
        config.budget.override_token = Some("let-me-spend".into());

        let f = fixture(config);
        f.local.push(MockOutcome::confident(WEAK, 0.1));
        f.local.push(MockOutcome::confident(WEAK, 0.1));
        f.augmented.push(MockOutcome::confident(STRONG, 0.95));

        // Without the token: stuck with the weak local answer
        let req = RoutingRequest::new(Uuid::new_v4(), "expensive question");
        let result = f.router.route(&req).await.unwrap();
        assert_eq!(result.tier, Tier::Local);
        assert_eq!(f.augmented.calls(), 0);

        // With the token: escalation proceeds
        let mut authorized = RoutingRequest::new(Uuid::new_v4(), "expensive question again");
        authorized.budget_override_token = Some("let-me-spend".into());
        let result = f.router.route(&authorized).await.unwrap();
        assert_eq!(result.tier, Tier::Augmented);
    }

    #[tokio::test]
    async fn test_paid_tier_cost_lands_in_ledger() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(WEAK, 0.1));
        f.augmented
            .push(MockOutcome::with_usage(STRONG, 0.95, 1000, 1000));

        let conv = Uuid::new_v4();
        let result = f
            .router
            .route(&RoutingRequest::new(conv, "question"))
            .await
            .unwrap();

        assert!(result.cost_usd > 0.0);
        let status = f.store.ledger.status(&conv.to_string()).unwrap();
        assert!(status.accumulated_usd > 0.0);
        let day = f.store.ledger.day_status().unwrap();
        assert!(day.accumulated_usd > 0.0);
    }
}

mod auditing {
    use super::*;
    use tiller_store::AuditKind;

    #[tokio::test]
    async fn test_every_decision_is_audited() {
        let f = fixture(test_config());
        f.local.push(MockOutcome::confident(STRONG, 0.95));

        let conv = Uuid::new_v4();
        f.router
            .route(&RoutingRequest::new(conv, "audit me"))
            .await
            .unwrap();
        // Cache hit on the repeat is audited too
        f.router
            .route(&RoutingRequest::new(conv, "audit me"))
            .await
            .unwrap();

        let records = f.store.audit.recent(10).unwrap();
        assert_eq!(records.len(), 2);
        assert!(records
            .iter()
            .all(|r| r.kind == AuditKind::RoutingDecision));
        assert!(records[0].detail["cached"].as_bool().unwrap());
        assert!(!records[1].detail["cached"].as_bool().unwrap());
    }
}
