use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::store::{fmt_ts, now_ts, parse_ts, persist_err};

/// One cached routing response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub response: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    pub ttl_expiry: DateTime<Utc>,
    pub hit_count: u64,
}

/// Semantic response cache over SQLite.
///
/// Reads never return an entry past its TTL — expiry is checked against
/// the wall clock on every get, so the guarantee holds under any
/// interleaving with `put` and `sweep`. Expired rows are reaped by the
/// sweep, not by reads.
pub struct CacheStore {
    db: Arc<Mutex<Connection>>,
}

impl CacheStore {
    pub(crate) fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    /// Look up a live entry. Absent and expired are indistinguishable to
    /// the caller. A live hit bumps hit_count and recency.
    pub fn get(&self, fingerprint: &str) -> tiller_core::Result<Option<CacheEntry>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT response, confidence, created_at, ttl_expiry, hit_count
                 FROM cache_entries WHERE fingerprint = ?1",
                rusqlite::params![fingerprint],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, i64>(4)?,
                    ))
                },
            )
            .optional()
            .map_err(persist_err)?;

        let (response, confidence, created, expiry, hits) = match row {
            Some(r) => r,
            None => return Ok(None),
        };

        let ttl_expiry = parse_ts(&expiry)?;
        if Utc::now() > ttl_expiry {
            // Expired rows read as absent; the sweep deletes them later.
            return Ok(None);
        }

        db.execute(
            "UPDATE cache_entries SET hit_count = hit_count + 1, last_access = ?2
             WHERE fingerprint = ?1",
            rusqlite::params![fingerprint, now_ts()],
        )
        .map_err(persist_err)?;

        Ok(Some(CacheEntry {
            fingerprint: fingerprint.to_string(),
            response,
            confidence,
            created_at: parse_ts(&created)?,
            ttl_expiry,
            hit_count: hits as u64 + 1,
        }))
    }

    /// Write-through insert or refresh.
    pub fn put(
        &self,
        fingerprint: &str,
        response: &str,
        confidence: f64,
        ttl: Duration,
    ) -> tiller_core::Result<()> {
        let now = Utc::now();
        let expiry = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        let db = self.db.lock();
        db.execute(
            "INSERT INTO cache_entries
                (fingerprint, response, confidence, created_at, ttl_expiry, hit_count, last_access)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?4)
             ON CONFLICT(fingerprint) DO UPDATE SET
                response = excluded.response,
                confidence = excluded.confidence,
                created_at = excluded.created_at,
                ttl_expiry = excluded.ttl_expiry,
                last_access = excluded.last_access",
            rusqlite::params![fingerprint, response, confidence, fmt_ts(now), fmt_ts(expiry)],
        )
        .map_err(persist_err)?;
        debug!(fingerprint = &fingerprint[..12.min(fingerprint.len())], confidence, "cache write");
        Ok(())
    }

    /// Explicit admin invalidation of one entry.
    pub fn invalidate(&self, fingerprint: &str) -> tiller_core::Result<bool> {
        let db = self.db.lock();
        let removed = db
            .execute(
                "DELETE FROM cache_entries WHERE fingerprint = ?1",
                rusqlite::params![fingerprint],
            )
            .map_err(persist_err)?;
        Ok(removed > 0)
    }

    /// Invalidate every entry whose fingerprint starts with a prefix.
    pub fn invalidate_prefix(&self, prefix: &str) -> tiller_core::Result<usize> {
        // Escape LIKE metacharacters so the prefix is literal
        let pattern = format!(
            "{}%",
            prefix.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
        );
        let db = self.db.lock();
        let removed = db
            .execute(
                "DELETE FROM cache_entries WHERE fingerprint LIKE ?1 ESCAPE '\\'",
                rusqlite::params![pattern],
            )
            .map_err(persist_err)?;
        Ok(removed)
    }

    /// Background sweep: drop expired rows, then LRU-evict down to the cap.
    /// Returns (expired, evicted).
    pub fn sweep(&self, max_entries: usize) -> tiller_core::Result<(usize, usize)> {
        let db = self.db.lock();
        let expired = db
            .execute(
                "DELETE FROM cache_entries WHERE ttl_expiry <= ?1",
                rusqlite::params![now_ts()],
            )
            .map_err(persist_err)?;

        let total: i64 = db
            .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))
            .map_err(persist_err)?;

        let mut evicted = 0;
        if total as usize > max_entries {
            let overflow = total as usize - max_entries;
            evicted = db
                .execute(
                    "DELETE FROM cache_entries WHERE fingerprint IN (
                         SELECT fingerprint FROM cache_entries
                         ORDER BY last_access ASC LIMIT ?1
                     )",
                    rusqlite::params![overflow as i64],
                )
                .map_err(persist_err)?;
        }

        if expired > 0 || evicted > 0 {
            info!(expired, evicted, "cache sweep");
        }
        Ok((expired, evicted))
    }

    /// Number of rows currently stored (live and expired-but-unswept).
    pub fn len(&self) -> tiller_core::Result<usize> {
        let db = self.db.lock();
        db.query_row("SELECT COUNT(*) FROM cache_entries", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(persist_err)
    }

    pub fn is_empty(&self) -> tiller_core::Result<bool> {
        Ok(self.len()? == 0)
    }
}
