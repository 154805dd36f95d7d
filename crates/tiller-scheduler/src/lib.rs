//! # tiller-scheduler
//!
//! Autonomous execution: a tick-based scheduler over durable job rows,
//! with TTL-lock mutual exclusion across workers, capped-backoff retries,
//! and a bounded worker pool for batch jobs. Autonomous spend flows
//! through the same budget ledger as interactive work — there is no
//! separate allowance.

pub mod batch;
pub mod scheduler;

pub use batch::{run_batch, BatchReport};
pub use scheduler::{job_kind_from_config, JobExecutor, Scheduler};
