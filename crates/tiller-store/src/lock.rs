use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{fmt_ts, now_ts, parse_ts, persist_err};

/// A currently-held lock row, for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub lock_key: String,
    pub holder_id: String,
    pub acquired_at: chrono::DateTime<chrono::Utc>,
    pub ttl_expiry: chrono::DateTime<chrono::Utc>,
}

/// TTL-bound mutual exclusion over the shared database.
///
/// The claim is a single guarded upsert: it lands only when no live row
/// exists for the key, so two concurrent acquirers resolve to exactly one
/// winner. Expired rows are claimable in the same statement — a crashed
/// holder never needs manual cleanup.
pub struct LockManager {
    db: Arc<Mutex<Connection>>,
}

impl LockManager {
    pub(crate) fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Try to take the lock. Returns `LockContention` when a live holder
    /// exists — callers skip their run rather than wait.
    pub fn try_acquire(
        &self,
        lock_key: &str,
        holder_id: &str,
        ttl: Duration,
    ) -> tiller_core::Result<()> {
        let now = Utc::now();
        let expiry = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));

        let db = self.db.lock();
        let claimed = db
            .execute(
                "INSERT INTO locks (lock_key, holder_id, acquired_at, ttl_expiry)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(lock_key) DO UPDATE SET
                    holder_id = excluded.holder_id,
                    acquired_at = excluded.acquired_at,
                    ttl_expiry = excluded.ttl_expiry
                 WHERE locks.ttl_expiry <= ?3",
                rusqlite::params![lock_key, holder_id, fmt_ts(now), fmt_ts(expiry)],
            )
            .map_err(persist_err)?;

        if claimed == 0 {
            debug!(lock_key, "lock held by another worker — skipping");
            return Err(tiller_core::TillerError::LockContention {
                lock_key: lock_key.to_string(),
            });
        }

        debug!(lock_key, holder = holder_id, ttl_secs = ttl.as_secs(), "lock acquired");
        Ok(())
    }

    /// Extend our own lease. Returns false when the row is no longer ours
    /// (expired and claimed by someone else, or already released) — the
    /// caller must treat that as having lost the lock.
    pub fn renew(&self, lock_key: &str, holder_id: &str, ttl: Duration) -> tiller_core::Result<bool> {
        let now = Utc::now();
        let expiry = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::seconds(60));
        let db = self.db.lock();
        let renewed = db
            .execute(
                "UPDATE locks SET ttl_expiry = ?3 WHERE lock_key = ?1 AND holder_id = ?2",
                rusqlite::params![lock_key, holder_id, fmt_ts(expiry)],
            )
            .map_err(persist_err)?;
        Ok(renewed > 0)
    }

    /// Release a lock we hold. Releasing someone else's lock is a no-op —
    /// a timed-out holder must not clobber the next claimant.
    pub fn release(&self, lock_key: &str, holder_id: &str) -> tiller_core::Result<()> {
        let db = self.db.lock();
        let released = db
            .execute(
                "DELETE FROM locks WHERE lock_key = ?1 AND holder_id = ?2",
                rusqlite::params![lock_key, holder_id],
            )
            .map_err(persist_err)?;
        if released > 0 {
            debug!(lock_key, holder = holder_id, "lock released");
        }
        Ok(())
    }

    /// Who currently holds a lock, if anyone live.
    pub fn holder(&self, lock_key: &str) -> tiller_core::Result<Option<LockInfo>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT lock_key, holder_id, acquired_at, ttl_expiry
                 FROM locks WHERE lock_key = ?1 AND ttl_expiry > ?2",
                rusqlite::params![lock_key, now_ts()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()
            .map_err(persist_err)?;

        match row {
            None => Ok(None),
            Some((lock_key, holder_id, acquired, expiry)) => Ok(Some(LockInfo {
                lock_key,
                holder_id,
                acquired_at: parse_ts(&acquired)?,
                ttl_expiry: parse_ts(&expiry)?,
            })),
        }
    }

    /// Drop expired rows. Not required for correctness (acquire treats
    /// expired rows as absent) but keeps the table small.
    pub fn sweep_expired(&self) -> tiller_core::Result<usize> {
        let db = self.db.lock();
        let swept = db
            .execute(
                "DELETE FROM locks WHERE ttl_expiry <= ?1",
                rusqlite::params![now_ts()],
            )
            .map_err(persist_err)?;
        if swept > 0 {
            info!(swept, "swept expired locks");
        }
        Ok(swept)
    }
}
