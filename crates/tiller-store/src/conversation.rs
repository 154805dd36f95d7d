use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use tiller_config::ConfirmationConfig;
use tiller_core::{ConversationId, PendingAction};

use crate::store::{fmt_ts, now_ts, parse_ts, persist_err};

/// Where a conversation sits in the confirmation state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConversationStatus {
    Normal,
    AwaitingConfirmation,
}

impl ConversationStatus {
    fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::Normal => "NORMAL",
            ConversationStatus::AwaitingConfirmation => "AWAITING_CONFIRMATION",
        }
    }
}

/// Outcome of a confirmation attempt.
#[derive(Debug, Clone)]
pub enum ConfirmOutcome {
    /// Token matched and was consumed — dispatch the action now.
    /// The token can never confirm again: consumption and the state
    /// transition happen in one guarded UPDATE.
    Confirmed(PendingAction),
    /// Token mismatched. Zero attempts remaining means the pending action
    /// was invalidated and must be re-issued.
    Denied { attempts_remaining: u32 },
    /// No live pending action (never issued, already consumed, or TTL
    /// elapsed). A new token must be issued.
    Expired,
}

/// Durable conversation/confirmation state.
///
/// Transitions for one conversation_id are serialized through a per-key
/// async mutex, so two near-simultaneous confirms cannot both succeed.
/// The SQLite row is the source of truth; a restarted process sees every
/// non-expired pending action without any warm-up step.
pub struct ConversationStore {
    db: Arc<Mutex<Connection>>,
    config: ConfirmationConfig,
    key_locks: Arc<Mutex<HashMap<ConversationId, Arc<TokioMutex<()>>>>>,
}

impl ConversationStore {
    pub(crate) fn new(db: Arc<Mutex<Connection>>, config: ConfirmationConfig) -> Self {
        Self {
            db,
            config,
            key_locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn key_lock(&self, conversation_id: ConversationId) -> Arc<TokioMutex<()>> {
        let mut locks = self.key_locks.lock();
        Arc::clone(
            locks
                .entry(conversation_id)
                .or_insert_with(|| Arc::new(TokioMutex::new(()))),
        )
    }

    /// Park a hazardous action behind a fresh confirmation token.
    ///
    /// At most one pending action exists per conversation: if a live one
    /// is already parked, it is returned unchanged (same token). An
    /// expired one is replaced with a new token.
    pub async fn begin_confirmation(
        &self,
        conversation_id: ConversationId,
        action_name: &str,
        action_args: &serde_json::Value,
    ) -> tiller_core::Result<PendingAction> {
        let guard = self.key_lock(conversation_id);
        let _held = guard.lock().await;

        if let Some(existing) = self.read_pending(conversation_id)? {
            if !existing.is_expired(Utc::now()) {
                debug!(
                    conversation = %conversation_id,
                    action = action_name,
                    "pending action already parked — reusing token"
                );
                return Ok(existing);
            }
        }

        let now = Utc::now();
        let pending = PendingAction {
            name: action_name.to_string(),
            args: action_args.clone(),
            issued_at: now,
            expires_at: now + Duration::seconds(self.config.ttl_secs as i64),
            confirmation_token: generate_token(),
            attempt_count: 0,
        };

        let db = self.db.lock();
        db.execute(
            "INSERT INTO conversation_state
                (conversation_id, status, action_name, action_args, issued_at,
                 expires_at, confirmation_token, attempt_count, updated_at)
             VALUES (?1, 'AWAITING_CONFIRMATION', ?2, ?3, ?4, ?5, ?6, 0, ?7)
             ON CONFLICT(conversation_id) DO UPDATE SET
                status = 'AWAITING_CONFIRMATION',
                action_name = excluded.action_name,
                action_args = excluded.action_args,
                issued_at = excluded.issued_at,
                expires_at = excluded.expires_at,
                confirmation_token = excluded.confirmation_token,
                attempt_count = 0,
                updated_at = excluded.updated_at",
            rusqlite::params![
                conversation_id.to_string(),
                pending.name,
                pending.args.to_string(),
                fmt_ts(pending.issued_at),
                fmt_ts(pending.expires_at),
                pending.confirmation_token,
                now_ts(),
            ],
        )
        .map_err(persist_err)?;

        info!(
            conversation = %conversation_id,
            action = action_name,
            expires_at = %pending.expires_at,
            "hazardous action parked awaiting confirmation"
        );
        Ok(pending)
    }

    /// Attempt to confirm the pending action with a token.
    pub async fn confirm(
        &self,
        conversation_id: ConversationId,
        token: &str,
    ) -> tiller_core::Result<ConfirmOutcome> {
        let guard = self.key_lock(conversation_id);
        let _held = guard.lock().await;

        let pending = match self.read_pending(conversation_id)? {
            Some(p) => p,
            None => return Ok(ConfirmOutcome::Expired),
        };

        if pending.is_expired(Utc::now()) {
            // Silent invalidation: back to NORMAL, action must be re-issued.
            self.reset_to_normal(conversation_id)?;
            info!(conversation = %conversation_id, "confirmation token expired");
            return Ok(ConfirmOutcome::Expired);
        }

        if pending.confirmation_token != token {
            let attempts = pending.attempt_count + 1;
            if attempts >= self.config.max_attempts {
                self.reset_to_normal(conversation_id)?;
                warn!(
                    conversation = %conversation_id,
                    attempts,
                    "confirmation attempts exhausted — pending action invalidated"
                );
                return Ok(ConfirmOutcome::Denied {
                    attempts_remaining: 0,
                });
            }
            let db = self.db.lock();
            db.execute(
                "UPDATE conversation_state SET attempt_count = ?2, updated_at = ?3
                 WHERE conversation_id = ?1",
                rusqlite::params![conversation_id.to_string(), attempts, now_ts()],
            )
            .map_err(persist_err)?;
            return Ok(ConfirmOutcome::Denied {
                attempts_remaining: self.config.max_attempts - attempts,
            });
        }

        // Consume the token. The WHERE guard keeps this exactly-once even
        // if a duplicate confirm slips past the per-key mutex (e.g. from
        // another process sharing the database).
        let consumed = {
            let db = self.db.lock();
            db.execute(
                "UPDATE conversation_state
                 SET status = 'NORMAL', action_name = NULL, action_args = NULL,
                     issued_at = NULL, expires_at = NULL, confirmation_token = NULL,
                     attempt_count = 0, updated_at = ?3
                 WHERE conversation_id = ?1
                   AND confirmation_token = ?2
                   AND status = 'AWAITING_CONFIRMATION'",
                rusqlite::params![conversation_id.to_string(), token, now_ts()],
            )
            .map_err(persist_err)?
        };

        if consumed == 0 {
            // Someone else consumed it between our read and write.
            return Ok(ConfirmOutcome::Expired);
        }

        info!(
            conversation = %conversation_id,
            action = %pending.name,
            "confirmation token consumed"
        );
        Ok(ConfirmOutcome::Confirmed(pending))
    }

    /// Current status of a conversation.
    pub fn status(&self, conversation_id: ConversationId) -> tiller_core::Result<ConversationStatus> {
        match self.read_pending(conversation_id)? {
            Some(p) if !p.is_expired(Utc::now()) => Ok(ConversationStatus::AwaitingConfirmation),
            _ => Ok(ConversationStatus::Normal),
        }
    }

    /// The live pending action, if any. Expired rows read as absent.
    pub fn pending(
        &self,
        conversation_id: ConversationId,
    ) -> tiller_core::Result<Option<PendingAction>> {
        Ok(self
            .read_pending(conversation_id)?
            .filter(|p| !p.is_expired(Utc::now())))
    }

    /// All non-expired pending actions — read at startup so a restarted
    /// process never re-confirms from scratch while an old token is live.
    pub fn load_pending(&self) -> tiller_core::Result<Vec<(ConversationId, PendingAction)>> {
        let now = now_ts();
        let db = self.db.lock();
        let mut stmt = db
            .prepare(
                "SELECT conversation_id, action_name, action_args, issued_at,
                        expires_at, confirmation_token, attempt_count
                 FROM conversation_state
                 WHERE status = 'AWAITING_CONFIRMATION' AND expires_at > ?1",
            )
            .map_err(persist_err)?;

        let rows = stmt
            .query_map(rusqlite::params![now], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, i64>(6)?,
                ))
            })
            .map_err(persist_err)?
            .filter_map(|r| r.ok())
            .collect::<Vec<_>>();
        drop(stmt);
        drop(db);

        let mut out = Vec::with_capacity(rows.len());
        for (id, name, args, issued, expires, token, attempts) in rows {
            let conversation_id = id
                .parse::<Uuid>()
                .map_err(|e| tiller_core::TillerError::Persistence(format!("bad uuid: {e}")))?;
            out.push((
                conversation_id,
                PendingAction {
                    name,
                    args: serde_json::from_str(&args).unwrap_or(serde_json::Value::Null),
                    issued_at: parse_ts(&issued)?,
                    expires_at: parse_ts(&expires)?,
                    confirmation_token: token,
                    attempt_count: attempts as u32,
                },
            ));
        }
        Ok(out)
    }

    /// Return expired AWAITING rows to NORMAL. Run periodically by the
    /// maintenance job. Returns the number of rows swept.
    pub fn sweep_expired(&self) -> tiller_core::Result<usize> {
        let db = self.db.lock();
        let swept = db
            .execute(
                "UPDATE conversation_state
                 SET status = 'NORMAL', action_name = NULL, action_args = NULL,
                     issued_at = NULL, expires_at = NULL, confirmation_token = NULL,
                     attempt_count = 0, updated_at = ?1
                 WHERE status = 'AWAITING_CONFIRMATION' AND expires_at <= ?1",
                rusqlite::params![now_ts()],
            )
            .map_err(persist_err)?;
        if swept > 0 {
            debug!(swept, "swept expired confirmations");
        }
        drop(db);

        // Shed per-conversation mutexes nobody is holding. The map must
        // not grow with every conversation ever seen.
        self.key_locks.lock().retain(|_, l| Arc::strong_count(l) > 1);
        Ok(swept)
    }

    /// Number of per-conversation mutexes currently retained. Bounded by
    /// the sweep, which drops entries with no outstanding holder.
    pub fn key_lock_count(&self) -> usize {
        self.key_locks.lock().len()
    }

    fn read_pending(
        &self,
        conversation_id: ConversationId,
    ) -> tiller_core::Result<Option<PendingAction>> {
        let db = self.db.lock();
        let row = db
            .query_row(
                "SELECT action_name, action_args, issued_at, expires_at,
                        confirmation_token, attempt_count
                 FROM conversation_state
                 WHERE conversation_id = ?1 AND status = 'AWAITING_CONFIRMATION'",
                rusqlite::params![conversation_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(persist_err)?;

        match row {
            None => Ok(None),
            Some((name, args, issued, expires, token, attempts)) => Ok(Some(PendingAction {
                name,
                args: serde_json::from_str(&args).unwrap_or(serde_json::Value::Null),
                issued_at: parse_ts(&issued)?,
                expires_at: parse_ts(&expires)?,
                confirmation_token: token,
                attempt_count: attempts as u32,
            })),
        }
    }

    fn reset_to_normal(&self, conversation_id: ConversationId) -> tiller_core::Result<()> {
        let db = self.db.lock();
        db.execute(
            "UPDATE conversation_state
             SET status = 'NORMAL', action_name = NULL, action_args = NULL,
                 issued_at = NULL, expires_at = NULL, confirmation_token = NULL,
                 attempt_count = 0, updated_at = ?2
             WHERE conversation_id = ?1",
            rusqlite::params![conversation_id.to_string(), now_ts()],
        )
        .map_err(persist_err)?;
        Ok(())
    }
}

/// Six uppercase alphanumerics — short enough to read over voice, sparse
/// enough that guessing within max_attempts is hopeless.
fn generate_token() -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
    let mut rng = rand::thread_rng();
    (0..6)
        .map(|_| ALPHABET[rng.gen_range(0..ALPHABET.len())] as char)
        .collect()
}

impl std::fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
