use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use tiller_core::{
    ConversationId, PendingAction, Result, TillerError, ToolAdapter, ToolCall, ToolResult,
};
use tiller_store::{AuditKind, AuditRecord, ConfirmOutcome, DenialReason, Store};

use crate::classify::ToolClass;

/// What came of an execution request.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// The tool ran. Failure inside the tool still lands here, as an
    /// error-flagged [`ToolResult`].
    Completed(ToolResult),
    /// The tool is hazardous; it is parked until a human confirms.
    AwaitingConfirmation(PendingAction),
    /// The budget ledger refused a cloud tool.
    BudgetDenied {
        reason: DenialReason,
        remaining_usd: f64,
    },
}

/// Reply to a confirmation attempt.
#[derive(Debug, Clone)]
pub enum ConfirmReply {
    /// Token matched; the parked action executed and this is its result.
    Executed(ToolResult),
    /// Token mismatched. Zero attempts remaining means the action was
    /// invalidated and must be requested again.
    Rejected { attempts_remaining: u32 },
    /// No live pending action for this conversation.
    Expired,
}

struct RegisteredTool {
    adapter: Arc<dyn ToolAdapter>,
    class: ToolClass,
}

/// Single choke point for tool execution.
///
/// Nothing calls a [`ToolAdapter`] except through here: free tools run
/// immediately, cloud tools clear the budget ledger first, hazardous
/// tools park behind a confirmation token. Every invocation, denial, and
/// confirmation round-trip is durably audited before the outcome is
/// returned.
pub struct ExecutionGateway {
    tools: RwLock<HashMap<String, RegisteredTool>>,
    store: Arc<Store>,
}

impl ExecutionGateway {
    pub fn new(store: Arc<Store>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a tool with its fixed safety class.
    pub fn register(&self, tool_name: &str, class: ToolClass, adapter: Arc<dyn ToolAdapter>) {
        info!(
            tool = tool_name,
            class = class.label(),
            adapter = adapter.name(),
            "tool registered"
        );
        self.tools
            .write()
            .insert(tool_name.to_string(), RegisteredTool { adapter, class });
    }

    /// Names of all registered tools.
    pub fn tool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// The registered class of a tool, if known.
    pub fn class_of(&self, tool_name: &str) -> Option<ToolClass> {
        self.tools.read().get(tool_name).map(|t| t.class.clone())
    }

    /// Execute a tool call on behalf of a conversation.
    pub async fn execute(
        &self,
        conversation_id: ConversationId,
        call: &ToolCall,
        override_token: Option<&str>,
    ) -> Result<ExecutionOutcome> {
        let (adapter, class) = {
            let tools = self.tools.read();
            let tool = tools
                .get(&call.tool_name)
                .ok_or_else(|| TillerError::ToolNotFound(call.tool_name.clone()))?;
            (Arc::clone(&tool.adapter), tool.class.clone())
        };

        match class {
            ToolClass::Free => self.run(conversation_id, &adapter, call).await,

            ToolClass::Cloud { est_cost_usd } => {
                let scope = conversation_id.to_string();
                match self
                    .store
                    .ledger
                    .approve(est_cost_usd, &scope, override_token)?
                {
                    tiller_store::Approval::Approved => {
                        let outcome = self.run(conversation_id, &adapter, call).await?;
                        if est_cost_usd > 0.0 {
                            self.store.ledger.commit(&scope, est_cost_usd)?;
                        }
                        Ok(outcome)
                    }
                    tiller_store::Approval::Denied {
                        reason,
                        remaining_usd,
                    } => {
                        warn!(
                            tool = %call.tool_name,
                            conversation = %conversation_id,
                            est_cost = est_cost_usd,
                            ?reason,
                            "cloud tool denied by budget ledger"
                        );
                        self.audit(
                            &call.tool_name,
                            serde_json::json!({
                                "conversation_id": conversation_id.to_string(),
                                "outcome": "budget_denied",
                                "est_cost_usd": est_cost_usd,
                                "remaining_usd": remaining_usd,
                            }),
                        )?;
                        Ok(ExecutionOutcome::BudgetDenied {
                            reason,
                            remaining_usd,
                        })
                    }
                }
            }

            ToolClass::Hazardous { hazard_class } => {
                let pending = self
                    .store
                    .conversations
                    .begin_confirmation(conversation_id, &call.tool_name, &call.arguments)
                    .await?;
                self.store.audit.append(&AuditRecord::new(
                    AuditKind::Confirmation,
                    call.tool_name.clone(),
                    serde_json::json!({
                        "conversation_id": conversation_id.to_string(),
                        "outcome": "token_issued",
                        "hazard_class": hazard_class.as_str(),
                        "expires_at": pending.expires_at.to_rfc3339(),
                    }),
                ))?;
                Ok(ExecutionOutcome::AwaitingConfirmation(pending))
            }
        }
    }

    /// Confirm (or fail to confirm) the pending hazardous action for a
    /// conversation. On a token match the parked action executes
    /// immediately; the token can never be used again.
    pub async fn confirm(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> Result<ConfirmReply> {
        let outcome = self.store.conversations.confirm(conversation_id, token).await?;

        match outcome {
            ConfirmOutcome::Confirmed(action) => {
                self.store.audit.append(&AuditRecord::new(
                    AuditKind::Confirmation,
                    action.name.clone(),
                    serde_json::json!({
                        "conversation_id": conversation_id.to_string(),
                        "outcome": "confirmed",
                    }),
                ))?;

                let adapter = {
                    let tools = self.tools.read();
                    tools
                        .get(&action.name)
                        .map(|t| Arc::clone(&t.adapter))
                        .ok_or_else(|| TillerError::ToolNotFound(action.name.clone()))?
                };
                let call = ToolCall::new(action.name.clone(), action.args.clone());
                match self.run(conversation_id, &adapter, &call).await? {
                    ExecutionOutcome::Completed(result) => Ok(ConfirmReply::Executed(result)),
                    // run() only ever completes
                    _ => Err(TillerError::ToolExecution {
                        tool: action.name,
                        reason: "confirmed action did not complete".into(),
                    }),
                }
            }
            ConfirmOutcome::Denied { attempts_remaining } => {
                self.audit_confirmation(conversation_id, "rejected", attempts_remaining)?;
                Ok(ConfirmReply::Rejected { attempts_remaining })
            }
            ConfirmOutcome::Expired => {
                self.audit_confirmation(conversation_id, "expired", 0)?;
                Ok(ConfirmReply::Expired)
            }
        }
    }

    /// Invoke the adapter and audit the invocation. Adapter errors become
    /// error-flagged results rather than gateway failures; only audit
    /// failures abort.
    async fn run(
        &self,
        conversation_id: ConversationId,
        adapter: &Arc<dyn ToolAdapter>,
        call: &ToolCall,
    ) -> Result<ExecutionOutcome> {
        let result = match adapter.invoke(&call.tool_name, &call.arguments).await {
            Ok(outcome) => outcome.into_result(&call.id),
            Err(e) => {
                warn!(tool = %call.tool_name, error = %e, "tool adapter failed");
                ToolResult::err(&call.id, e.to_string())
            }
        };

        self.audit(
            &call.tool_name,
            serde_json::json!({
                "conversation_id": conversation_id.to_string(),
                "outcome": if result.is_error { "error" } else { "ok" },
                "call_id": call.id,
            }),
        )?;

        Ok(ExecutionOutcome::Completed(result))
    }

    fn audit(&self, tool_name: &str, detail: serde_json::Value) -> Result<()> {
        self.store.audit.append(&AuditRecord::new(
            AuditKind::ToolInvocation,
            tool_name.to_string(),
            detail,
        ))
    }

    fn audit_confirmation(
        &self,
        conversation_id: ConversationId,
        outcome: &str,
        attempts_remaining: u32,
    ) -> Result<()> {
        self.store.audit.append(&AuditRecord::new(
            AuditKind::Confirmation,
            conversation_id.to_string(),
            serde_json::json!({
                "outcome": outcome,
                "attempts_remaining": attempts_remaining,
            }),
        ))
    }
}
