use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use tiller_config::TillerConfig;
use tiller_core::{
    ConversationId, InferenceTier, Result, RoutingRequest, RoutingResult, ToolAdapter, ToolCall,
};
use tiller_gateway::{ConfirmReply, ExecutionGateway, ExecutionOutcome, ToolClass};
use tiller_router::TierRouter;
use tiller_scheduler::{JobExecutor, Scheduler};
use tiller_store::{BudgetStatus, ScheduledJob, Store, TaskItem};

/// Snapshot of the running system for status surfaces.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    pub jobs: Vec<ScheduledJob>,
    pub day_budget: BudgetStatus,
    pub cache_entries: usize,
    pub audit_records: u64,
    pub registered_tools: Vec<String>,
}

/// Assembles an [`Orchestrator`] from config plus the pluggable pieces:
/// inference backends and classified tools.
pub struct OrchestratorBuilder {
    config: TillerConfig,
    backends: Vec<Arc<dyn InferenceTier>>,
    tools: Vec<(String, ToolClass, Arc<dyn ToolAdapter>)>,
}

impl OrchestratorBuilder {
    pub fn new(config: TillerConfig) -> Self {
        Self {
            config,
            backends: vec![],
            tools: vec![],
        }
    }

    pub fn backend(mut self, backend: Arc<dyn InferenceTier>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn tool(mut self, name: &str, class: ToolClass, adapter: Arc<dyn ToolAdapter>) -> Self {
        self.tools.push((name.to_string(), class, adapter));
        self
    }

    pub fn build(self) -> Result<Orchestrator> {
        let store = Arc::new(Store::open(&self.config.store.db_path, &self.config)?);

        let mut router = TierRouter::new(
            Arc::clone(&store),
            self.config.router.clone(),
            self.config.cache.clone(),
        );
        for backend in self.backends {
            router.add_backend(backend);
        }
        let router = Arc::new(router);

        let gateway = Arc::new(ExecutionGateway::new(Arc::clone(&store)));
        for (name, class, adapter) in self.tools {
            gateway.register(&name, class, adapter);
        }

        let executor = Arc::new(AutonomousExecutor {
            router: Arc::clone(&router),
        });
        let scheduler = Arc::new(Scheduler::new(
            Arc::clone(&store),
            self.config.scheduler.clone(),
            self.config.cache.max_entries,
            executor,
        ));
        scheduler.install_jobs()?;

        // Durable confirmations survive the restart; tokens issued by the
        // previous process remain valid until their TTL.
        for (conversation_id, pending) in store.conversations.load_pending()? {
            info!(
                conversation = %conversation_id,
                action = %pending.name,
                expires_at = %pending.expires_at,
                "pending confirmation restored"
            );
        }

        Ok(Orchestrator {
            store,
            router,
            gateway,
            scheduler,
        })
    }
}

/// The one front door to the core: routing, tool execution, confirmation,
/// status, and the autonomous scheduler loop all hang off this.
pub struct Orchestrator {
    store: Arc<Store>,
    router: Arc<TierRouter>,
    gateway: Arc<ExecutionGateway>,
    scheduler: Arc<Scheduler>,
}

impl Orchestrator {
    pub fn builder(config: TillerConfig) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config)
    }

    /// Route one interactive request. Any hazardous action parked for
    /// this conversation rides along on the result until it is confirmed
    /// or expires.
    pub async fn route(&self, request: &RoutingRequest) -> Result<RoutingResult> {
        let mut result = self.router.route(request).await?;
        result.requires_confirmation = self.store.conversations.pending(request.conversation_id)?;
        Ok(result)
    }

    /// Execute a tool call through the safety gateway.
    pub async fn execute_tool(
        &self,
        conversation_id: ConversationId,
        call: &ToolCall,
        override_token: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        self.gateway.execute(conversation_id, call, override_token).await
    }

    /// Attempt to confirm a parked hazardous action.
    pub async fn confirm(&self, conversation_id: ConversationId, token: &str) -> Result<ConfirmReply> {
        self.gateway.confirm(conversation_id, token).await
    }

    /// Budget position of one conversation.
    pub fn budget_status(&self, conversation_id: ConversationId) -> Result<BudgetStatus> {
        self.store.ledger.status(&conversation_id.to_string())
    }

    /// System-wide status snapshot.
    pub fn status(&self) -> Result<RuntimeStatus> {
        Ok(RuntimeStatus {
            jobs: self.store.jobs.load_all()?,
            day_budget: self.store.ledger.day_status()?,
            cache_entries: self.store.cache.len()?,
            audit_records: self.store.audit.count()?,
            registered_tools: self.gateway.tool_names(),
        })
    }

    /// Run the autonomous scheduler loop until cancelled.
    pub async fn run(&self, shutdown: CancellationToken) {
        self.scheduler.run(shutdown).await
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn gateway(&self) -> &Arc<ExecutionGateway> {
        &self.gateway
    }
}

/// Routes scheduled work through the same tiers and the same ledger as
/// interactive traffic. Autonomous runs get no special allowance: the
/// daily ceiling caps them exactly as it caps everything else.
struct AutonomousExecutor {
    router: Arc<TierRouter>,
}

#[async_trait]
impl JobExecutor for AutonomousExecutor {
    async fn research(&self, job_name: &str, prompt: &str) -> Result<()> {
        let mut request = RoutingRequest::new(Uuid::new_v4(), prompt);
        // Research exists to find out what changed; stale cache defeats it
        request.freshness_required = true;

        let result = self.router.route(&request).await?;
        if result.confidence < 0.5 {
            warn!(
                job = job_name,
                confidence = result.confidence,
                "research run finished with low confidence"
            );
        }
        info!(
            job = job_name,
            tier = %result.tier,
            confidence = result.confidence,
            cost = result.cost_usd,
            "research run complete"
        );
        Ok(())
    }

    async fn task_item(&self, item: &TaskItem) -> Result<()> {
        let request = RoutingRequest::new(Uuid::new_v4(), item.description.as_str());
        let result = self.router.route(&request).await?;
        info!(
            item = %item.id,
            tier = %result.tier,
            confidence = result.confidence,
            "task item routed"
        );
        Ok(())
    }
}
