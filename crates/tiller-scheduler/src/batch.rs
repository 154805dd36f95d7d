use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use tiller_config::SchedulerConfig;
use tiller_store::TaskItem;

use crate::scheduler::JobExecutor;

/// Outcome of one batch run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub succeeded: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }
}

/// Run a batch of task items under a bounded worker pool.
///
/// Item failures are isolated: a failed or timed-out item counts against
/// the report but never stops its siblings. Each item gets its own
/// timeout and retry budget.
pub async fn run_batch(
    items: Vec<TaskItem>,
    executor: Arc<dyn JobExecutor>,
    config: &SchedulerConfig,
) -> BatchReport {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_task_items.max(1)));
    let item_timeout = Duration::from_secs(config.item_timeout_secs);
    let max_retries = config.max_retries;
    let base_delay = Duration::from_millis(config.retry_base_delay_ms);

    let mut set = JoinSet::new();
    for item in items {
        let semaphore = Arc::clone(&semaphore);
        let executor = Arc::clone(&executor);
        set.spawn(async move {
            // Closed semaphore is impossible here; treat it as a failure
            let _permit = match semaphore.acquire_owned().await {
                Ok(p) => p,
                Err(_) => return false,
            };
            run_item(&item, executor.as_ref(), item_timeout, max_retries, base_delay).await
        });
    }

    let mut report = BatchReport::default();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(true) => report.succeeded += 1,
            Ok(false) => report.failed += 1,
            Err(e) => {
                warn!(error = %e, "batch worker panicked");
                report.failed += 1;
            }
        }
    }
    report
}

async fn run_item(
    item: &TaskItem,
    executor: &dyn JobExecutor,
    item_timeout: Duration,
    max_retries: u32,
    base_delay: Duration,
) -> bool {
    for attempt in 0..=max_retries {
        if attempt > 0 {
            tokio::time::sleep(backoff_delay(base_delay, attempt)).await;
        }
        match tokio::time::timeout(item_timeout, executor.task_item(item)).await {
            Ok(Ok(())) => {
                debug!(item = %item.id, attempt, "task item done");
                return true;
            }
            Ok(Err(e)) => {
                warn!(item = %item.id, attempt, error = %e, "task item failed");
            }
            Err(_) => {
                warn!(
                    item = %item.id,
                    attempt,
                    timeout_secs = item_timeout.as_secs(),
                    "task item timed out"
                );
            }
        }
    }
    false
}

/// Exponential backoff with a hard cap, so a large retry count never
/// turns into multi-minute sleeps.
pub(crate) fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    const CAP: Duration = Duration::from_secs(60);
    base.saturating_mul(1u32 << attempt.min(16)).min(CAP)
}
