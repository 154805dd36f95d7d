use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use tracing::info;

use tiller_config::TillerConfig;

use crate::audit::AuditLog;
use crate::cache::CacheStore;
use crate::conversation::ConversationStore;
use crate::jobs::JobStore;
use crate::ledger::BudgetLedger;
use crate::lock::LockManager;

/// Unified durable store. Every sub-store shares one WAL-mode connection;
/// serializing mutations through the connection mutex is what makes the
/// guarded UPDATEs (budget increments, lock claims, token consumption)
/// atomic in-process.
pub struct Store {
    pub audit: AuditLog,
    pub conversations: ConversationStore,
    pub ledger: BudgetLedger,
    pub locks: LockManager,
    pub jobs: JobStore,
    pub cache: CacheStore,
    db: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open or create the database at the given path.
    pub fn open(path: &Path, config: &TillerConfig) -> tiller_core::Result<Self> {
        info!(?path, "opening store");

        let conn = Connection::open(path).map_err(persist_err)?;

        // WAL for concurrent readers
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(persist_err)?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS conversation_state (
                conversation_id TEXT PRIMARY KEY,
                status TEXT NOT NULL DEFAULT 'NORMAL',
                action_name TEXT,
                action_args TEXT,
                issued_at TEXT,
                expires_at TEXT,
                confirmation_token TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 0,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS cache_entries (
                fingerprint TEXT PRIMARY KEY,
                response TEXT NOT NULL,
                confidence REAL NOT NULL,
                created_at TEXT NOT NULL,
                ttl_expiry TEXT NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0,
                last_access TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_cache_expiry ON cache_entries(ttl_expiry);
            CREATE INDEX IF NOT EXISTS idx_cache_access ON cache_entries(last_access);

            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                job_id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                schedule_spec TEXT NOT NULL,
                kind TEXT NOT NULL,
                next_run_at TEXT NOT NULL,
                last_status TEXT NOT NULL DEFAULT 'idle',
                last_run_at TEXT,
                enabled INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_next_run ON scheduled_jobs(next_run_at);

            CREATE TABLE IF NOT EXISTS locks (
                lock_key TEXT PRIMARY KEY,
                holder_id TEXT NOT NULL,
                acquired_at TEXT NOT NULL,
                ttl_expiry TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_locks_expiry ON locks(ttl_expiry);

            CREATE TABLE IF NOT EXISTS budget_ledger (
                scope_key TEXT NOT NULL,
                period TEXT NOT NULL,
                accumulated_cost_usd REAL NOT NULL DEFAULT 0.0,
                ceiling_usd REAL NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (scope_key, period)
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                record_kind TEXT NOT NULL,
                subject TEXT NOT NULL,
                detail TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_audit_timestamp ON audit_log(timestamp);
            ",
        )
        .map_err(persist_err)?;

        let db = Arc::new(Mutex::new(conn));

        Ok(Self {
            audit: AuditLog::new(Arc::clone(&db)),
            conversations: ConversationStore::new(Arc::clone(&db), config.confirmation.clone()),
            ledger: BudgetLedger::new(Arc::clone(&db), config.budget.clone()),
            locks: LockManager::new(Arc::clone(&db)),
            jobs: JobStore::new(Arc::clone(&db)),
            cache: CacheStore::new(Arc::clone(&db)),
            db,
        })
    }

    /// Open an in-memory database (for tests).
    pub fn open_in_memory(config: &TillerConfig) -> tiller_core::Result<Self> {
        Self::open(Path::new(":memory:"), config)
    }

    /// Raw connection access for advanced queries.
    pub fn db(&self) -> parking_lot::MutexGuard<'_, Connection> {
        self.db.lock()
    }
}

/// Every failed state write is a persistence failure — fatal to the
/// enclosing request, never silently swallowed.
pub(crate) fn persist_err(e: rusqlite::Error) -> tiller_core::TillerError {
    tiller_core::TillerError::Persistence(e.to_string())
}

/// Fixed-width RFC 3339 so timestamps compare correctly as strings in SQL.
pub(crate) fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn now_ts() -> String {
    fmt_ts(Utc::now())
}

pub(crate) fn parse_ts(raw: &str) -> tiller_core::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| tiller_core::TillerError::Persistence(format!("bad timestamp '{raw}': {e}")))
}
