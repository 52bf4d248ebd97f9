//! Session registry - server-held transactions addressed by id.
//!
//! The registry:
//! - Opens a transaction on `Begin` and hands back its id
//! - Resolves ids for later calls, extending the expiry on success
//! - Tears down sessions on commit, rollback, fatal errors and expiry

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::context::CallContext;
use crate::error::ServerError;
use crate::session::id::TxId;
use crate::tx::handle::TxInterrupter;
use crate::tx::{is_fatal, Command, LockMode, Reply, TxEngine, TxHandle};

/// One server-held transaction.
pub struct TxSession {
    id: TxId,
    database: String,
    created_at: Instant,
    /// Serializes calls on the session; `None` once torn down.
    slot: Mutex<Option<TxHandle>>,
    /// Reaches a statement that is running while `slot` is locked.
    interrupt: TxInterrupter,
}

impl TxSession {
    pub fn id(&self) -> &TxId {
        &self.id
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Roll the session back. With `interrupt`, a statement still running on
    /// the session is stopped first so the slot frees up promptly.
    async fn teardown(&self, reason: &str, interrupt: bool) {
        if interrupt {
            self.interrupt.interrupt();
        }
        let tx = self.slot.lock().await.take();
        if let Some(tx) = tx {
            info!(session_id = %self.id, database = %self.database, reason, "rolling back session");
            let _ = tx.rollback().await;
        }
    }
}

struct SessionEntry {
    session: Arc<TxSession>,
    expires_at: Instant,
    timeout: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionRegistrySnapshot {
    pub total_sessions: usize,
    pub default_timeout_seconds: u64,
    pub max_timeout_seconds: u64,
    pub oldest_age_ms: u64,
    pub soonest_expiry_ms: Option<u64>,
}

pub struct TxSessionRegistry {
    engine: Arc<TxEngine>,
    sessions: RwLock<HashMap<TxId, SessionEntry>>,
    default_timeout: Duration,
    max_timeout: Duration,
}

impl TxSessionRegistry {
    pub fn new(engine: Arc<TxEngine>, default_timeout: Duration, max_timeout: Duration) -> Self {
        let max_timeout = max_timeout.max(default_timeout);
        info!(
            default_timeout_ms = default_timeout.as_millis() as u64,
            max_timeout_ms = max_timeout.as_millis() as u64,
            "session registry initialized"
        );
        Self {
            engine,
            sessions: RwLock::new(HashMap::new()),
            default_timeout,
            max_timeout,
        }
    }

    pub fn from_config(engine: Arc<TxEngine>, config: &ServerConfig) -> Self {
        Self::new(
            engine,
            config.transaction_timeout(),
            config.transaction_max_timeout(),
        )
    }

    pub fn engine(&self) -> &Arc<TxEngine> {
        &self.engine
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<TxId, SessionEntry>> {
        self.sessions
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<TxId, SessionEntry>> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Requested timeout, or the default when none (or zero) is given, capped
    /// at the configured maximum.
    pub fn effective_timeout(&self, requested: Option<Duration>) -> Duration {
        requested
            .filter(|t| !t.is_zero())
            .unwrap_or(self.default_timeout)
            .min(self.max_timeout)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open a transaction and register it. The reply carries the new id.
    #[instrument(skip(self, ctx), fields(role = %ctx.caller().role))]
    pub async fn begin(
        &self,
        ctx: &CallContext,
        database: &str,
        lock_mode: LockMode,
        timeout: Option<Duration>,
    ) -> Result<Reply, ServerError> {
        let timeout = self.effective_timeout(timeout);
        let tx = self.engine.begin(ctx, database, lock_mode).await?;
        let mode = tx.mode();
        let id = TxId::new();
        let session = Arc::new(TxSession {
            id: id.clone(),
            database: database.to_string(),
            created_at: Instant::now(),
            interrupt: tx.interrupter(),
            slot: Mutex::new(Some(tx)),
        });

        let total = {
            let mut sessions = self.write();
            sessions.insert(
                id.clone(),
                SessionEntry {
                    session,
                    expires_at: Instant::now() + timeout,
                    timeout,
                },
            );
            sessions.len()
        };
        info!(session_id = %id, total_sessions = total, "session opened");
        Ok(Reply::Begun {
            id: Some(id.to_string()),
            database: database.to_string(),
            mode,
        })
    }

    /// Live session for `id`. An expired session is torn down and reported
    /// as not found.
    async fn lookup(&self, id: &TxId) -> Result<Arc<TxSession>, ServerError> {
        let found = {
            let sessions = self.read();
            sessions
                .get(id)
                .map(|entry| (entry.session.clone(), entry.expires_at))
        };
        match found {
            Some((session, expires_at)) if Instant::now() < expires_at => Ok(session),
            Some(_) => {
                self.expire(id).await;
                Err(ServerError::TransactionNotFound(id.to_string()))
            }
            None => Err(ServerError::TransactionNotFound(id.to_string())),
        }
    }

    async fn expire(&self, id: &TxId) {
        let removed = {
            let mut sessions = self.write();
            match sessions.get(id) {
                Some(entry) if Instant::now() >= entry.expires_at => sessions.remove(id),
                _ => None,
            }
        };
        if let Some(entry) = removed {
            entry.session.teardown("expired", true).await;
        }
    }

    fn extend(&self, id: &TxId) {
        let mut sessions = self.write();
        if let Some(entry) = sessions.get_mut(id) {
            entry.expires_at = Instant::now() + entry.timeout;
        }
    }

    fn remove(&self, id: &TxId) -> Option<Arc<TxSession>> {
        self.write().remove(id).map(|entry| entry.session)
    }

    /// Run one command inside the session `id`.
    ///
    /// Statement errors come back as `Reply::StatementError` and keep the
    /// session alive. Fatal errors remove the session after rolling back.
    #[instrument(skip(self, ctx, command), fields(session_id = %id, command = command.name()))]
    pub async fn execute(
        &self,
        ctx: &CallContext,
        id: &TxId,
        command: Command,
    ) -> Result<Reply, ServerError> {
        match command {
            Command::Begin { .. } => {
                self.lookup(id).await?;
                Err(ServerError::ProtocolViolation(
                    "session already holds a transaction".to_string(),
                ))
            }
            Command::Commit => self.commit(ctx, id).await,
            Command::Rollback => self.rollback(id).await,
            command => {
                let session = self.lookup(id).await?;
                let mut slot = session.slot.lock().await;
                if slot.is_none() {
                    return Err(ServerError::TransactionNotFound(id.to_string()));
                }
                let outcome = self.engine.dispatch(ctx, &mut slot, command).await;
                match outcome {
                    Ok(reply) => {
                        self.extend(id);
                        Ok(reply)
                    }
                    Err(err) if err.is_soft() => {
                        self.extend(id);
                        Ok(Reply::statement_error(&err))
                    }
                    Err(err) if is_fatal(&err) => {
                        drop(slot);
                        self.remove(id);
                        session.teardown("fatal error", false).await;
                        Err(err)
                    }
                    Err(err) => Err(err),
                }
            }
        }
    }

    /// Commit and forget the session. The entry is removed before the commit
    /// runs, so the id is gone whatever the outcome.
    pub async fn commit(&self, ctx: &CallContext, id: &TxId) -> Result<Reply, ServerError> {
        let session = self.lookup(id).await?;
        if self.remove(id).is_none() {
            return Err(ServerError::TransactionNotFound(id.to_string()));
        }
        let mut slot = session.slot.lock().await;
        if slot.is_none() {
            return Err(ServerError::TransactionNotFound(id.to_string()));
        }
        let reply = self.engine.dispatch(ctx, &mut slot, Command::Commit).await?;
        info!(session_id = %id, "session committed");
        Ok(reply)
    }

    /// Roll back and forget the session. Unknown or expired ids succeed.
    pub async fn rollback(&self, id: &TxId) -> Result<Reply, ServerError> {
        match self.remove(id) {
            Some(session) => session.teardown("rollback", true).await,
            None => debug!(session_id = %id, "rollback of unknown session"),
        }
        Ok(Reply::RolledBack)
    }

    /// Remove and roll back every expired session. The registry lock is
    /// released before any rollback runs. Rollbacks run concurrently and
    /// interrupt statements still in flight, so one busy session cannot hold
    /// up the others.
    #[instrument(skip(self))]
    pub async fn reap_expired(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Arc<TxSession>> = {
            let mut sessions = self.write();
            let ids: Vec<TxId> = sessions
                .iter()
                .filter(|(_, entry)| entry.expires_at <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter()
                .filter_map(|id| sessions.remove(id))
                .map(|entry| entry.session)
                .collect()
        };
        let count = expired.len();
        join_all(expired.iter().map(|session| {
            warn!(session_id = %session.id(), age_ms = session.age().as_millis() as u64, "session expired");
            session.teardown("expired", true)
        }))
        .await;
        if count > 0 {
            info!(reaped = count, remaining = self.len(), "reaped expired sessions");
        }
        count
    }

    /// Roll back every session (shutdown).
    pub async fn close_all(&self) -> usize {
        let all: Vec<Arc<TxSession>> = {
            let mut sessions = self.write();
            sessions.drain().map(|(_, entry)| entry.session).collect()
        };
        let count = all.len();
        join_all(all.iter().map(|session| session.teardown("shutdown", true))).await;
        if count > 0 {
            info!(closed = count, "closed all sessions");
        }
        count
    }

    pub fn snapshot(&self) -> SessionRegistrySnapshot {
        let sessions = self.read();
        let now = Instant::now();
        let oldest_age_ms = sessions
            .values()
            .map(|entry| entry.session.age().as_millis() as u64)
            .max()
            .unwrap_or(0);
        let soonest_expiry_ms = sessions
            .values()
            .map(|entry| entry.expires_at.saturating_duration_since(now).as_millis() as u64)
            .min();
        SessionRegistrySnapshot {
            total_sessions: sessions.len(),
            default_timeout_seconds: self.default_timeout.as_secs(),
            max_timeout_seconds: self.max_timeout.as_secs(),
            oldest_age_ms,
            soonest_expiry_ms,
        }
    }
}
