use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tiller_config::{JobConfig, SchedulerConfig};
use tiller_core::{Result, TillerError};
use tiller_store::{
    next_run_after, AuditKind, AuditRecord, JobKind, JobStatus, ScheduledJob, Store, TaskItem,
};

use crate::batch::{backoff_delay, run_batch};

/// What the scheduler delegates when a job fires. Implemented by the
/// runtime so the scheduler stays ignorant of routing and tools.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// Run an autonomous research prompt.
    async fn research(&self, job_name: &str, prompt: &str) -> Result<()>;

    /// Process one batch task item.
    async fn task_item(&self, item: &TaskItem) -> Result<()>;
}

/// Durable tick-based scheduler.
///
/// Jobs live in the store, never only in memory, so a restart resumes
/// every schedule where it left off. Each due job is claimed through a
/// TTL lock keyed on the job name; a second scheduler (or a second
/// process on the shared database) that loses the claim skips the run
/// entirely and lets the holder advance the schedule.
pub struct Scheduler {
    store: Arc<Store>,
    config: SchedulerConfig,
    /// Cache size cap enforced by the maintenance sweep.
    cache_max_entries: usize,
    executor: Arc<dyn JobExecutor>,
    /// Unique per process; lock rows carry it so a holder only ever
    /// releases its own claim.
    holder_id: String,
}

impl Scheduler {
    pub fn new(
        store: Arc<Store>,
        config: SchedulerConfig,
        cache_max_entries: usize,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            store,
            config,
            cache_max_entries,
            executor,
            holder_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn holder_id(&self) -> &str {
        &self.holder_id
    }

    /// Register every enabled job from config. Existing rows keep their
    /// `next_run_at` when the spec is unchanged; disabled config entries
    /// are unregistered.
    pub fn install_jobs(&self) -> Result<()> {
        for job in &self.config.jobs {
            if !job.enabled {
                if self.store.jobs.unregister(&job.name)? {
                    info!(job = %job.name, "disabled job unregistered");
                }
                continue;
            }
            let kind = job_kind_from_config(job)?;
            self.store.jobs.register(&job.name, &job.schedule, &kind)?;
        }
        Ok(())
    }

    /// Run until cancelled, checking for due jobs every tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            tick_secs = self.config.tick_secs,
            holder = %self.holder_id,
            "scheduler started"
        );
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.tick_secs.max(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("scheduler stopped");
                    return;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.tick(Utc::now()).await {
                        error!(error = %e, "scheduler tick failed");
                    }
                }
            }
        }
    }

    /// One pass over the due jobs. Runs are concurrent across lock keys —
    /// one slow job must not stall its siblings. Job-level failures are
    /// contained; only a failure to read the registry surfaces.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<()> {
        let due = self.store.jobs.due(now)?;
        let outcomes = join_all(due.iter().map(|job| self.run_due_job(job, now))).await;
        for (job, outcome) in due.iter().zip(outcomes) {
            if let Err(e) = outcome {
                error!(job = %job.name, error = %e, "job run not recorded");
            }
        }
        Ok(())
    }

    async fn run_due_job(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<()> {
        let lock_ttl = Duration::from_secs(self.config.lock_ttl_secs);
        match self
            .store
            .locks
            .try_acquire(&job.name, &self.holder_id, lock_ttl)
        {
            Ok(()) => {}
            Err(TillerError::LockContention { .. }) => {
                // The holder advances the schedule; we just note the skip.
                debug!(job = %job.name, "skipping run — lock held elsewhere");
                return self.store.audit.append(&AuditRecord::new(
                    AuditKind::JobRun,
                    job.name.clone(),
                    serde_json::json!({ "outcome": "skipped_lock_held" }),
                ));
            }
            Err(e) => return Err(e),
        }

        self.store.jobs.mark_running(&job.name)?;

        // Keep the lease alive while the job runs. A slow-but-healthy run
        // must never lose its lock mid-flight to a second worker.
        let heartbeat = self.spawn_heartbeat(&job.name, lock_ttl);
        let started = std::time::Instant::now();
        let (status, attempts, failure) = self.run_with_retries(job).await;
        heartbeat.abort();

        let next_run = next_run_after(&job.schedule_spec, now)?;
        self.store.jobs.complete_run(&job.name, status, next_run)?;
        self.store.locks.release(&job.name, &self.holder_id)?;

        self.store.audit.append(&AuditRecord::new(
            AuditKind::JobRun,
            job.name.clone(),
            serde_json::json!({
                "outcome": if status == JobStatus::Idle { "ok" } else { "failed" },
                "attempts": attempts,
                "duration_ms": started.elapsed().as_millis() as u64,
                "next_run_at": next_run.to_rfc3339(),
                "error": failure,
            }),
        ))?;

        info!(
            job = %job.name,
            ?status,
            attempts,
            next_run = %next_run,
            "job run complete"
        );
        Ok(())
    }

    /// Re-upsert our own `ttl_expiry` at half the TTL until aborted. Only
    /// the row's recorded holder can renew; a lease lost anyway (clock
    /// skew, a stalled renewal) just stops the heartbeat.
    fn spawn_heartbeat(&self, job_name: &str, lock_ttl: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let name = job_name.to_string();
        let holder = self.holder_id.clone();
        let every = (lock_ttl / 2).max(Duration::from_millis(100));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            interval.tick().await;
            loop {
                interval.tick().await;
                match store.locks.renew(&name, &holder, lock_ttl) {
                    Ok(true) => {}
                    Ok(false) => {
                        warn!(job = %name, "lock lease no longer ours — stopping renewal");
                        return;
                    }
                    Err(e) => {
                        warn!(job = %name, error = %e, "lock renewal failed");
                        return;
                    }
                }
            }
        })
    }

    /// Execute a job under its timeout, retrying with capped exponential
    /// backoff. Returns the final status, the attempt count, and the last
    /// failure message if any.
    async fn run_with_retries(&self, job: &ScheduledJob) -> (JobStatus, u32, Option<String>) {
        let timeout = Duration::from_secs(self.config.job_timeout_secs);
        let base_delay = Duration::from_millis(self.config.retry_base_delay_ms);
        let mut last_failure = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(base_delay, attempt)).await;
            }
            match tokio::time::timeout(timeout, self.execute(job)).await {
                Ok(Ok(())) => return (JobStatus::Idle, attempt + 1, None),
                Ok(Err(e)) => {
                    warn!(job = %job.name, attempt, error = %e, "job attempt failed");
                    last_failure = Some(e.to_string());
                }
                Err(_) => {
                    let e = TillerError::JobTimeout {
                        job_id: job.job_id.to_string(),
                        timeout_secs: self.config.job_timeout_secs,
                    };
                    warn!(job = %job.name, attempt, "job attempt timed out");
                    last_failure = Some(e.to_string());
                }
            }
        }
        (JobStatus::Failed, self.config.max_retries + 1, last_failure)
    }

    async fn execute(&self, job: &ScheduledJob) -> Result<()> {
        match &job.kind {
            JobKind::Research { prompt } => self.executor.research(&job.name, prompt).await,
            JobKind::TaskBatch { items } => {
                let report = run_batch(
                    items.clone(),
                    Arc::clone(&self.executor),
                    &self.config,
                )
                .await;
                if report.all_succeeded() {
                    Ok(())
                } else {
                    Err(TillerError::ToolExecution {
                        tool: job.name.clone(),
                        reason: format!(
                            "{} of {} batch items failed",
                            report.failed,
                            report.failed + report.succeeded
                        ),
                    })
                }
            }
            JobKind::Maintenance => self.run_maintenance(),
        }
    }

    /// Housekeeping sweep: expired cache entries, stale confirmations,
    /// dead lock rows.
    fn run_maintenance(&self) -> Result<()> {
        let (expired, evicted) = self.store.cache.sweep(self.cache_max_entries)?;
        let confirmations = self.store.conversations.sweep_expired()?;
        let locks = self.store.locks.sweep_expired()?;
        debug!(
            cache_expired = expired,
            cache_evicted = evicted,
            confirmations,
            locks,
            "maintenance sweep complete"
        );
        Ok(())
    }
}

/// Translate a config job entry into a durable job kind.
pub fn job_kind_from_config(job: &JobConfig) -> Result<JobKind> {
    match job.kind.as_str() {
        "research" => {
            let prompt = job
                .payload
                .get("prompt")
                .and_then(|v| v.as_str())
                .ok_or_else(|| {
                    TillerError::Config(format!("job '{}': research needs a payload.prompt", job.name))
                })?;
            Ok(JobKind::Research {
                prompt: prompt.to_string(),
            })
        }
        "task_batch" => {
            let items: Vec<TaskItem> = serde_json::from_value(
                job.payload
                    .get("items")
                    .cloned()
                    .unwrap_or_else(|| serde_json::json!([])),
            )
            .map_err(|e| {
                TillerError::Config(format!("job '{}': bad payload.items: {e}", job.name))
            })?;
            Ok(JobKind::TaskBatch { items })
        }
        "maintenance" => Ok(JobKind::Maintenance),
        other => Err(TillerError::Config(format!(
            "job '{}': unknown kind '{other}'",
            job.name
        ))),
    }
}
