use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use crate::store::{parse_ts, persist_err};

/// What kind of decision a record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    RoutingDecision,
    ToolInvocation,
    JobRun,
    Confirmation,
}

impl AuditKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditKind::RoutingDecision => "routing_decision",
            AuditKind::ToolInvocation => "tool_invocation",
            AuditKind::JobRun => "job_run",
            AuditKind::Confirmation => "confirmation",
        }
    }

    fn from_str(raw: &str) -> Self {
        match raw {
            "routing_decision" => AuditKind::RoutingDecision,
            "tool_invocation" => AuditKind::ToolInvocation,
            "job_run" => AuditKind::JobRun,
            _ => AuditKind::Confirmation,
        }
    }
}

/// One append-only audit row. Never mutated or deleted by the core;
/// retention is an external concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub timestamp: DateTime<Utc>,
    pub kind: AuditKind,
    /// What the record is about: a request id, job name, or tool name.
    pub subject: String,
    pub detail: serde_json::Value,
}

impl AuditRecord {
    pub fn new(kind: AuditKind, subject: impl Into<String>, detail: serde_json::Value) -> Self {
        Self {
            timestamp: Utc::now(),
            kind,
            subject: subject.into(),
            detail,
        }
    }
}

/// Synchronous, durable audit sink. There is no fire-and-forget path:
/// `append` either lands the row or returns a `Persistence` error the
/// caller must treat as fatal to its in-flight operation.
pub struct AuditLog {
    db: Arc<Mutex<Connection>>,
}

impl AuditLog {
    pub(crate) fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Append one record. Blocks until the write is durable.
    pub fn append(&self, record: &AuditRecord) -> tiller_core::Result<()> {
        let detail = serde_json::to_string(&record.detail)?;
        let db = self.db.lock();
        db.execute(
            "INSERT INTO audit_log (timestamp, record_kind, subject, detail) VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![
                crate::store::fmt_ts(record.timestamp),
                record.kind.as_str(),
                record.subject,
                detail
            ],
        )
        .map_err(persist_err)?;
        Ok(())
    }

    /// Read the most recent records, newest first.
    pub fn recent(&self, limit: usize) -> tiller_core::Result<Vec<AuditRecord>> {
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT timestamp, record_kind, subject, detail
                 FROM audit_log ORDER BY id DESC LIMIT ?1",
            )
            .map_err(persist_err)?;

        let rows = stmt
            .query_map(rusqlite::params![limit as i64], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            })
            .map_err(persist_err)?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();

        let mut records = Vec::with_capacity(rows.len());
        for (ts, kind, subject, detail) in rows {
            records.push(AuditRecord {
                timestamp: parse_ts(&ts)?,
                kind: AuditKind::from_str(&kind),
                subject,
                detail: detail
                    .and_then(|d| serde_json::from_str(&d).ok())
                    .unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(records)
    }

    /// Total number of records.
    pub fn count(&self) -> tiller_core::Result<u64> {
        let db = self.db.lock();
        db.query_row("SELECT COUNT(*) FROM audit_log", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as u64)
        .map_err(persist_err)
    }
}
