//! Transaction handle owning one checked-out connection.
//!
//! The handle is the safety net for every front-end: if it is dropped while
//! the transaction is still open, the transaction is rolled back before the
//! connection goes back to the pool.

use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use std::time::{Duration, Instant};

use r2d2::PooledConnection;
use rusqlite::{Connection, InterruptHandle};
use tracing::{debug, info, instrument, warn};

use crate::blocking::run_blocking;
use crate::context::CallContext;
use crate::engine::{quote_identifier, AccessMode, SqliteHandle, SqliteManager};
use crate::error::ServerError;
use crate::tx::command::{LockMode, SavepointAction};

type Slot = Arc<Mutex<Option<PooledConnection<SqliteManager>>>>;

pub struct TxHandle {
    database: String,
    mode: AccessMode,
    lock_mode: LockMode,
    /// `None` once the transaction reached a terminal state.
    conn: Slot,
    interrupt: Arc<InterruptHandle>,
    started_at: Instant,
}

fn lock_slot(slot: &Slot) -> MutexGuard<'_, Option<PooledConnection<SqliteManager>>> {
    slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TxHandle {
    /// Check out a connection from `handle` and open a transaction on it.
    /// Read-only handles always begin deferred.
    #[instrument(skip(ctx, handle), fields(database = %handle.database(), mode = %handle.mode()))]
    pub(crate) async fn begin(
        ctx: &CallContext,
        handle: SqliteHandle,
        lock_mode: LockMode,
    ) -> Result<Self, ServerError> {
        let mode = handle.mode();
        let lock_mode = match mode {
            AccessMode::ReadOnly => LockMode::Deferred,
            AccessMode::ReadWrite => lock_mode,
        };
        let database = handle.database().to_string();

        let conn = run_blocking(ctx, None, move || {
            let conn = handle.checkout()?;
            conn.execute_batch(lock_mode.begin_sql()).map_err(|err| {
                ServerError::ResourceFailure(format!("could not begin transaction: {err}"))
            })?;
            Ok(conn)
        })
        .await?;

        let interrupt = Arc::new(conn.get_interrupt_handle());
        info!(?lock_mode, "transaction started");
        Ok(Self {
            database,
            mode,
            lock_mode,
            conn: Arc::new(Mutex::new(Some(conn))),
            interrupt,
            started_at: Instant::now(),
        })
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn lock_mode(&self) -> LockMode {
        self.lock_mode
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_open(&self) -> bool {
        lock_slot(&self.conn).is_some()
    }

    /// Stops a statement running inside this transaction. Usable while
    /// another task holds the handle.
    pub(crate) fn interrupter(&self) -> TxInterrupter {
        TxInterrupter {
            slot: Arc::clone(&self.conn),
            interrupt: Arc::clone(&self.interrupt),
        }
    }

    /// Run `work` against the transaction's connection on the blocking pool.
    /// Calls on one handle are serialized by the connection mutex.
    ///
    /// A failure after which sqlite has already left the transaction (an
    /// `OR ROLLBACK` conflict, `RAISE(ROLLBACK)`, a full disk or an I/O error)
    /// is reported as a resource failure and the connection is released.
    pub(crate) async fn run<T, F>(&self, ctx: &CallContext, work: F) -> Result<T, ServerError>
    where
        F: FnOnce(&Connection) -> Result<T, ServerError> + Send + 'static,
        T: Send + 'static,
    {
        let slot = Arc::clone(&self.conn);
        run_blocking(ctx, Some(self.interrupt.as_ref()), move || {
            let mut guard = lock_slot(&slot);
            let conn = guard
                .as_ref()
                .ok_or_else(|| ServerError::Internal("transaction already finished".to_string()))?;
            let result = work(conn);
            match result {
                Err(err) if err.is_soft() && conn.is_autocommit() => {
                    warn!(error = %err, "sqlite aborted the transaction");
                    // back to the pool only once the slot is unlocked
                    let released = guard.take();
                    drop(guard);
                    drop(released);
                    Err(ServerError::ResourceFailure(format!(
                        "transaction aborted by sqlite: {err}"
                    )))
                }
                other => other,
            }
        })
        .await
    }

    pub(crate) async fn savepoint(
        &self,
        ctx: &CallContext,
        name: &str,
        action: SavepointAction,
    ) -> Result<(), ServerError> {
        if name.trim().is_empty() {
            return Err(ServerError::InvalidParameter(
                "savepoint name must not be empty".to_string(),
            ));
        }
        let ident = quote_identifier(name);
        let sql = match action {
            SavepointAction::Create => format!("SAVEPOINT {ident}"),
            SavepointAction::RollbackTo => format!("ROLLBACK TO SAVEPOINT {ident}"),
            SavepointAction::Release => format!("RELEASE SAVEPOINT {ident}"),
        };
        self.run(ctx, move |conn| {
            conn.execute_batch(&sql)?;
            if conn.is_autocommit() {
                // releasing the outermost savepoint would end the transaction
                return Err(ServerError::Internal(
                    "savepoint release ended the transaction".to_string(),
                ));
            }
            Ok(())
        })
        .await
    }

    /// Commit. On failure the connection is discarded without a rollback
    /// attempt; the pool closes it because it is still inside a transaction.
    #[instrument(skip(self, ctx), fields(database = %self.database))]
    pub async fn commit(self, ctx: &CallContext) -> Result<(), ServerError> {
        ctx.check()?;
        let slot = Arc::clone(&self.conn);
        let age = self.age();
        let result = run_blocking(ctx, Some(self.interrupt.as_ref()), move || {
            let conn = lock_slot(&slot)
                .take()
                .ok_or_else(|| ServerError::Internal("transaction already finished".to_string()))?;
            conn.execute_batch("COMMIT").map_err(|err| {
                ServerError::ResourceFailure(format!("commit failed, transaction discarded: {err}"))
            })
        })
        .await;
        match &result {
            Ok(()) => info!(elapsed_ms = age.as_millis() as u64, "transaction committed"),
            Err(err) => warn!(error = %err, "commit failed"),
        }
        result
    }

    /// Roll back. Always succeeds from the caller's point of view; failures
    /// are logged and the connection is discarded by the pool.
    #[instrument(skip(self), fields(database = %self.database))]
    pub async fn rollback(self) -> Result<(), ServerError> {
        let slot = Arc::clone(&self.conn);
        let taken = tokio::task::spawn_blocking(move || {
            if let Some(conn) = lock_slot(&slot).take() {
                rollback_connection(conn);
            }
        })
        .await;
        if let Err(err) = taken {
            warn!(error = %err, "rollback task failed");
        }
        info!("transaction rolled back");
        Ok(())
    }
}

/// Interrupt access detached from a [`TxHandle`].
pub(crate) struct TxInterrupter {
    slot: Slot,
    interrupt: Arc<InterruptHandle>,
}

impl TxInterrupter {
    /// Interrupts only while a statement holds the transaction's connection.
    /// Once the transaction has ended the connection may serve someone else,
    /// so nothing is interrupted then.
    pub(crate) fn interrupt(&self) {
        if let Err(TryLockError::WouldBlock) = self.slot.try_lock() {
            debug!("interrupting running statement");
            self.interrupt.interrupt();
        }
    }
}

fn rollback_connection(conn: PooledConnection<SqliteManager>) {
    if conn.is_autocommit() {
        // sqlite already rolled back (interrupt, full disk)
        debug!("transaction already closed by sqlite");
        return;
    }
    if let Err(err) = conn.execute_batch("ROLLBACK") {
        warn!(error = %err, "rollback failed, connection will be discarded");
    }
}

impl Drop for TxHandle {
    fn drop(&mut self) {
        match self.conn.try_lock() {
            Ok(mut guard) => {
                if let Some(conn) = guard.take() {
                    warn!(database = %self.database, "transaction abandoned, rolling back");
                    rollback_connection(conn);
                }
            }
            Err(TryLockError::Poisoned(poisoned)) => {
                if let Some(conn) = poisoned.into_inner().take() {
                    warn!(database = %self.database, "transaction abandoned after panic, rolling back");
                    rollback_connection(conn);
                }
            }
            Err(TryLockError::WouldBlock) => {
                // a statement is still running; stop it and finish once it lets go
                warn!(database = %self.database, "transaction abandoned mid-statement, interrupting");
                self.interrupt.interrupt();
                let slot = Arc::clone(&self.conn);
                let finish = move || {
                    if let Some(conn) = lock_slot(&slot).take() {
                        rollback_connection(conn);
                    }
                };
                match tokio::runtime::Handle::try_current() {
                    Ok(runtime) => {
                        runtime.spawn_blocking(finish);
                    }
                    Err(_) => {
                        std::thread::spawn(finish);
                    }
                }
            }
        }
    }
}
