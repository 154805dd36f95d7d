//! # tiller-store
//!
//! Durable state for the orchestration core, all in one SQLite database:
//! the append-only audit log, conversation/confirmation state, the budget
//! ledger, the distributed lock table, the job registry, and the response
//! cache. Every mutation is an atomic read-modify-write at the database —
//! guarded UPDATEs for budget increments, token consumption, and lock
//! claims — so concurrent callers and restarted processes always observe
//! consistent state.

pub mod audit;
pub mod cache;
pub mod conversation;
pub mod jobs;
pub mod ledger;
pub mod lock;
pub mod store;

pub use audit::{AuditKind, AuditLog, AuditRecord};
pub use cache::{CacheEntry, CacheStore};
pub use conversation::{ConfirmOutcome, ConversationStatus, ConversationStore};
pub use jobs::{next_run_after, JobKind, JobStatus, JobStore, ScheduledJob, TaskItem};
pub use ledger::{Approval, BudgetLedger, BudgetStatus, DenialReason};
pub use lock::{LockInfo, LockManager};
pub use store::Store;
