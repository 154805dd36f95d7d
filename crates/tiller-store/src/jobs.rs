use std::str::FromStr;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use tiller_core::JobId;

use crate::store::{fmt_ts, now_ts, parse_ts, persist_err};

/// What a scheduled job does when it fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobKind {
    /// Issue a routing request autonomously (research-style work).
    Research { prompt: String },
    /// Process a batch of ready work items under a bounded worker pool.
    TaskBatch { items: Vec<TaskItem> },
    /// Housekeeping: cache sweep, confirmation expiry, lock cleanup.
    Maintenance,
}

/// One unit of work inside a TaskBatch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskItem {
    pub id: String,
    pub description: String,
}

/// Last observed outcome of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Idle,
    Running,
    Failed,
}

impl JobStatus {
    fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Idle => "idle",
            JobStatus::Running => "running",
            JobStatus::Failed => "failed",
        }
    }

    fn from_str(raw: &str) -> Self {
        match raw {
            "running" => JobStatus::Running,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Idle,
        }
    }
}

/// A durable scheduled job row. The name doubles as the lock key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: JobId,
    pub name: String,
    /// Cron expression or `every:<secs>`.
    pub schedule_spec: String,
    pub kind: JobKind,
    pub next_run_at: DateTime<Utc>,
    pub last_status: JobStatus,
    pub last_run_at: Option<DateTime<Utc>>,
    pub enabled: bool,
}

/// Durable job registry. Jobs live in SQLite, never only in process
/// memory — a restart reloads every row with its `next_run_at` intact.
pub struct JobStore {
    db: Arc<Mutex<Connection>>,
}

impl JobStore {
    pub(crate) fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Register a job, or update its schedule if the name already exists.
    /// The existing `next_run_at` is preserved when the spec is unchanged,
    /// so re-registration at startup does not reset schedules.
    pub fn register(
        &self,
        name: &str,
        schedule_spec: &str,
        kind: &JobKind,
    ) -> tiller_core::Result<ScheduledJob> {
        let next_run = next_run_after(schedule_spec, Utc::now())?;
        let kind_json = serde_json::to_string(kind)?;
        let job_id = Uuid::new_v4();

        {
            let db = self.db.lock();
            db.execute(
                "INSERT INTO scheduled_jobs
                    (job_id, name, schedule_spec, kind, next_run_at, last_status, enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'idle', 1)
                 ON CONFLICT(name) DO UPDATE SET
                    kind = excluded.kind,
                    enabled = 1,
                    next_run_at = CASE
                        WHEN scheduled_jobs.schedule_spec = excluded.schedule_spec
                        THEN scheduled_jobs.next_run_at
                        ELSE excluded.next_run_at
                    END,
                    schedule_spec = excluded.schedule_spec",
                rusqlite::params![
                    job_id.to_string(),
                    name,
                    schedule_spec,
                    kind_json,
                    fmt_ts(next_run)
                ],
            )
            .map_err(persist_err)?;
        }

        let job = self
            .get(name)?
            .ok_or_else(|| tiller_core::TillerError::JobNotFound(name.to_string()))?;
        info!(job = name, schedule = schedule_spec, next_run = %job.next_run_at, "job registered");
        Ok(job)
    }

    /// Remove a job entirely. The only way a job row is ever deleted.
    pub fn unregister(&self, name: &str) -> tiller_core::Result<bool> {
        let db = self.db.lock();
        let removed = db
            .execute(
                "DELETE FROM scheduled_jobs WHERE name = ?1",
                rusqlite::params![name],
            )
            .map_err(persist_err)?;
        Ok(removed > 0)
    }

    pub fn get(&self, name: &str) -> tiller_core::Result<Option<ScheduledJob>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT job_id, name, schedule_spec, kind, next_run_at, last_status, last_run_at, enabled
                 FROM scheduled_jobs WHERE name = ?1",
                rusqlite::params![name],
                row_to_tuple,
            )
            .optional()
            .map_err(persist_err)?;
        row.map(tuple_to_job).transpose()
    }

    /// Every registered job, for startup load and status surfaces.
    pub fn load_all(&self) -> tiller_core::Result<Vec<ScheduledJob>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT job_id, name, schedule_spec, kind, next_run_at, last_status, last_run_at, enabled
                 FROM scheduled_jobs ORDER BY next_run_at",
            )
            .map_err(persist_err)?;
        let rows = stmt
            .query_map([], row_to_tuple)
            .map_err(persist_err)?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        drop(stmt);
        drop(db);
        rows.into_iter().map(tuple_to_job).collect()
    }

    /// Enabled jobs whose `next_run_at` has passed.
    pub fn due(&self, now: DateTime<Utc>) -> tiller_core::Result<Vec<ScheduledJob>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT job_id, name, schedule_spec, kind, next_run_at, last_status, last_run_at, enabled
                 FROM scheduled_jobs
                 WHERE enabled = 1 AND next_run_at <= ?1
                 ORDER BY next_run_at",
            )
            .map_err(persist_err)?;
        let rows = stmt
            .query_map(rusqlite::params![fmt_ts(now)], row_to_tuple)
            .map_err(persist_err)?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        drop(stmt);
        drop(db);
        rows.into_iter().map(tuple_to_job).collect()
    }

    pub fn mark_running(&self, name: &str) -> tiller_core::Result<()> {
        self.set_status(name, JobStatus::Running)
    }

    /// Record the outcome of a run and advance the schedule.
    pub fn complete_run(
        &self,
        name: &str,
        status: JobStatus,
        next_run_at: DateTime<Utc>,
    ) -> tiller_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE scheduled_jobs
             SET last_status = ?2, last_run_at = ?3, next_run_at = ?4
             WHERE name = ?1",
            rusqlite::params![name, status.as_str(), now_ts(), fmt_ts(next_run_at)],
        )
        .map_err(persist_err)?;
        Ok(())
    }

    fn set_status(&self, name: &str, status: JobStatus) -> tiller_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE scheduled_jobs SET last_status = ?2 WHERE name = ?1",
            rusqlite::params![name, status.as_str()],
        )
        .map_err(persist_err)?;
        Ok(())
    }
}

type JobTuple = (
    String,
    String,
    String,
    String,
    String,
    String,
    Option<String>,
    i64,
);

fn row_to_tuple(row: &rusqlite::Row<'_>) -> rusqlite::Result<JobTuple> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn tuple_to_job(t: JobTuple) -> tiller_core::Result<ScheduledJob> {
    let (id, name, spec, kind, next_run, status, last_run, enabled) = t;
    Ok(ScheduledJob {
        job_id: id
            .parse::<Uuid>()
            .map_err(|e| tiller_core::TillerError::Persistence(format!("bad job uuid: {e}")))?,
        name,
        schedule_spec: spec,
        kind: serde_json::from_str(&kind)?,
        next_run_at: parse_ts(&next_run)?,
        last_status: JobStatus::from_str(&status),
        last_run_at: last_run.as_deref().map(parse_ts).transpose()?,
        enabled: enabled != 0,
    })
}

/// Compute the next fire time after `after` for a schedule spec —
/// either a cron expression or `every:<secs>`.
pub fn next_run_after(spec: &str, after: DateTime<Utc>) -> tiller_core::Result<DateTime<Utc>> {
    if let Some(rest) = spec.strip_prefix("every:") {
        let secs = rest
            .parse::<i64>()
            .ok()
            .filter(|s| *s > 0)
            .ok_or_else(|| tiller_core::TillerError::InvalidSchedule(spec.to_string()))?;
        return Ok(after + Duration::seconds(secs));
    }
    let schedule = Schedule::from_str(spec)
        .map_err(|e| tiller_core::TillerError::InvalidSchedule(format!("{spec}: {e}")))?;
    schedule
        .after(&after)
        .next()
        .ok_or_else(|| tiller_core::TillerError::InvalidSchedule(format!("{spec}: no future fire time")))
}
