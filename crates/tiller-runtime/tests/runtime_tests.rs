//! End-to-end tests through the orchestrator: routing, confirmation
//! durability across restart, and the status surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tiller_config::TillerConfig;
use tiller_core::{Result, RoutingRequest, Tier, ToolAdapter, ToolCall, ToolOutcome};
use tiller_gateway::{ConfirmReply, ExecutionOutcome, HazardClass, ToolClass};
use tiller_router::{MockOutcome, MockTier};
use tiller_runtime::Orchestrator;
use uuid::Uuid;

const STRONG: &str = "The greenhouse vents are open and the interior temperature is holding at \
                      24 degrees, well inside the configured band for tomato seedlings.";

struct NoopAdapter {
    calls: AtomicUsize,
}

impl NoopAdapter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl ToolAdapter for NoopAdapter {
    fn name(&self) -> &str {
        "noop"
    }

    async fn invoke(&self, tool_name: &str, _args: &serde_json::Value) -> Result<ToolOutcome> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(ToolOutcome {
            success: true,
            output: format!("{tool_name} executed"),
            error: None,
        })
    }
}

fn config_at(dir: &tempfile::TempDir) -> TillerConfig {
    let mut config = TillerConfig::default();
    config.store.db_path = dir.path().join("tiller.db");
    config
}

#[tokio::test]
async fn test_route_and_status_through_orchestrator() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(MockTier::new("local-mock", Tier::Local));
    local.push(MockOutcome::confident(STRONG, 0.95));

    let orchestrator = Orchestrator::builder(config_at(&dir))
        .backend(local.clone())
        .tool("memory_search", ToolClass::Free, NoopAdapter::new())
        .build()
        .unwrap();

    let result = orchestrator
        .route(&RoutingRequest::new(Uuid::new_v4(), "greenhouse status"))
        .await
        .unwrap();
    assert_eq!(result.tier, Tier::Local);

    let status = orchestrator.status().unwrap();
    assert_eq!(status.cache_entries, 1);
    assert!(status.audit_records >= 1);
    assert_eq!(status.registered_tools, vec!["memory_search".to_string()]);
}

#[tokio::test]
async fn test_pending_confirmation_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let conv = Uuid::new_v4();
    let call = ToolCall::new("open_vent", serde_json::json!({"vent": "north"}));

    let token = {
        let adapter = NoopAdapter::new();
        let orchestrator = Orchestrator::builder(config_at(&dir))
            .tool(
                "open_vent",
                ToolClass::Hazardous {
                    hazard_class: HazardClass::Physical,
                },
                adapter.clone(),
            )
            .build()
            .unwrap();

        let outcome = orchestrator.execute_tool(conv, &call, None).await.unwrap();
        let pending = match outcome {
            ExecutionOutcome::AwaitingConfirmation(p) => p,
            other => panic!("expected AwaitingConfirmation, got {other:?}"),
        };
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 0);
        pending.confirmation_token
        // Orchestrator dropped here: simulated crash before confirmation
    };

    let adapter = NoopAdapter::new();
    let orchestrator = Orchestrator::builder(config_at(&dir))
        .tool(
            "open_vent",
            ToolClass::Hazardous {
                hazard_class: HazardClass::Physical,
            },
            adapter.clone(),
        )
        .build()
        .unwrap();

    // The old token still confirms, exactly once
    let reply = orchestrator.confirm(conv, &token).await.unwrap();
    assert!(matches!(reply, ConfirmReply::Executed(_)));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);

    let replay = orchestrator.confirm(conv, &token).await.unwrap();
    assert!(matches!(replay, ConfirmReply::Expired));
    assert_eq!(adapter.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_routing_result_carries_parked_action() {
    let dir = tempfile::tempdir().unwrap();
    let conv = Uuid::new_v4();
    let local = Arc::new(MockTier::new("local-mock", Tier::Local));
    local.push(MockOutcome::confident(STRONG, 0.95));

    let orchestrator = Orchestrator::builder(config_at(&dir))
        .backend(local)
        .tool(
            "open_vent",
            ToolClass::Hazardous {
                hazard_class: HazardClass::Physical,
            },
            NoopAdapter::new(),
        )
        .build()
        .unwrap();

    let call = ToolCall::new("open_vent", serde_json::json!({"vent": "north"}));
    let outcome = orchestrator.execute_tool(conv, &call, None).await.unwrap();
    let parked = match outcome {
        ExecutionOutcome::AwaitingConfirmation(p) => p,
        other => panic!("expected AwaitingConfirmation, got {other:?}"),
    };

    // While the action is parked, every result for the conversation
    // carries it
    let result = orchestrator
        .route(&RoutingRequest::new(conv, "greenhouse status"))
        .await
        .unwrap();
    let riding = result.requires_confirmation.expect("pending action missing");
    assert_eq!(riding.confirmation_token, parked.confirmation_token);
    assert_eq!(riding.name, "open_vent");

    // Confirmed means no longer pending, cached or not
    orchestrator
        .confirm(conv, &parked.confirmation_token)
        .await
        .unwrap();
    let after = orchestrator
        .route(&RoutingRequest::new(conv, "greenhouse status"))
        .await
        .unwrap();
    assert!(after.cached);
    assert!(after.requires_confirmation.is_none());
}

#[tokio::test]
async fn test_budget_status_reflects_spend() {
    let dir = tempfile::tempdir().unwrap();
    let local = Arc::new(MockTier::new("local-mock", Tier::Local));
    let augmented = Arc::new(MockTier::new("augmented-mock", Tier::Augmented));
    local.push(MockOutcome::confident("hmm", 0.1));
    augmented.push(MockOutcome::with_usage(STRONG, 0.95, 1000, 1000));

    let orchestrator = Orchestrator::builder(config_at(&dir))
        .backend(local)
        .backend(augmented)
        .build()
        .unwrap();

    let conv = Uuid::new_v4();
    orchestrator
        .route(&RoutingRequest::new(conv, "what changed in the greenhouse?"))
        .await
        .unwrap();

    let budget = orchestrator.budget_status(conv).unwrap();
    assert!(budget.accumulated_usd > 0.0);
    assert!(budget.remaining() < budget.ceiling_usd);
}
