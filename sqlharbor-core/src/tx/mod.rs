//! Transaction engine.
//!
//! One state machine, `Idle -> Active -> Idle`, driven by [`Command`]s. The
//! stream, session and script front-ends only differ in how commands reach
//! [`TxEngine::dispatch`] and how replies leave it.

pub mod command;
pub mod handle;
pub mod script;
pub mod stream;

use std::sync::Arc;

use rusqlite::Connection;
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use crate::context::CallContext;
use crate::engine::connection as sql;
use crate::engine::RowBatch;
use crate::error::{ErrorKind, ServerError};
use crate::manager::ConnectionManager;
use crate::sql_parser::reject_transaction_control;

pub use command::{Command, LockMode, Reply, SavepointAction, Statement};
pub use handle::TxHandle;
pub use script::{run_script, ScriptFailure};
pub use stream::{run_stream, Inbound};

/// Errors after which the open transaction cannot be trusted any more.
pub(crate) fn is_fatal(err: &ServerError) -> bool {
    matches!(
        err.kind(),
        ErrorKind::Cancelled | ErrorKind::ResourceFailure | ErrorKind::Internal
    )
}

/// Where a streamed query sends its batches while rows are still being read.
pub(crate) struct BatchSink {
    replies: mpsc::Sender<Reply>,
    ctx: CallContext,
}

impl BatchSink {
    /// Blocking send, for use on the blocking pool. Gives up when the call is
    /// cancelled or the receiver has gone away.
    fn send(&self, batch: RowBatch) -> Result<(), ServerError> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|err| ServerError::Internal(format!("no runtime for batch delivery: {err}")))?;
        runtime.block_on(async {
            tokio::select! {
                sent = self.replies.send(Reply::Batch(batch)) => sent.map_err(|_| {
                    debug!("batch receiver went away");
                    ServerError::Cancelled
                }),
                _ = self.ctx.done() => Err(ServerError::Cancelled),
            }
        })
    }
}

pub struct TxEngine {
    manager: Arc<ConnectionManager>,
    batch_rows: usize,
}

impl TxEngine {
    pub fn new(manager: Arc<ConnectionManager>, batch_rows: usize) -> Self {
        Self {
            manager,
            batch_rows: batch_rows.max(1),
        }
    }

    pub fn manager(&self) -> &Arc<ConnectionManager> {
        &self.manager
    }

    pub fn batch_rows(&self) -> usize {
        self.batch_rows
    }

    /// Open a transaction on `database`. Read-only callers get a read-only
    /// handle regardless of the requested lock mode.
    pub async fn begin(
        &self,
        ctx: &CallContext,
        database: &str,
        lock_mode: LockMode,
    ) -> Result<TxHandle, ServerError> {
        let handle = self
            .manager
            .get_connection(ctx, database, ctx.access_mode())
            .await?;
        TxHandle::begin(ctx, handle, lock_mode).await
    }

    /// Apply one command to the transaction held in `slot`.
    ///
    /// Statement failures come back as soft errors and leave the transaction
    /// open. Fatal failures roll the transaction back before returning.
    /// Protocol violations leave `slot` untouched.
    pub async fn dispatch(
        &self,
        ctx: &CallContext,
        slot: &mut Option<TxHandle>,
        command: Command,
    ) -> Result<Reply, ServerError> {
        self.apply(ctx, slot, command, None)
            .await?
            .ok_or_else(|| ServerError::Internal("streamed reply without a sink".to_string()))
    }

    /// Same as [`TxEngine::dispatch`], except that streamed queries send each
    /// batch to `sink` as a `Reply::Batch` while rows are still being read,
    /// and return `None` once the last one is out.
    pub async fn dispatch_streaming(
        &self,
        ctx: &CallContext,
        slot: &mut Option<TxHandle>,
        command: Command,
        sink: &mpsc::Sender<Reply>,
    ) -> Result<Option<Reply>, ServerError> {
        let sink = BatchSink {
            replies: sink.clone(),
            ctx: ctx.clone(),
        };
        self.apply(ctx, slot, command, Some(sink)).await
    }

    #[instrument(skip(self, ctx, slot, command, sink), fields(command = command.name()))]
    async fn apply(
        &self,
        ctx: &CallContext,
        slot: &mut Option<TxHandle>,
        command: Command,
        sink: Option<BatchSink>,
    ) -> Result<Option<Reply>, ServerError> {
        match command {
            Command::Begin {
                database,
                lock_mode,
                ..
            } => {
                if slot.is_some() {
                    return Err(ServerError::ProtocolViolation(
                        "a transaction is already open".to_string(),
                    ));
                }
                let tx = self.begin(ctx, &database, lock_mode).await?;
                let reply = Reply::Begun {
                    id: None,
                    database,
                    mode: tx.mode(),
                };
                *slot = Some(tx);
                Ok(Some(reply))
            }
            Command::Commit => {
                let tx = slot.take().ok_or_else(|| {
                    ServerError::ProtocolViolation("no open transaction to commit".to_string())
                })?;
                tx.commit(ctx).await?;
                Ok(Some(Reply::Committed))
            }
            Command::Rollback => {
                match slot.take() {
                    Some(tx) => tx.rollback().await?,
                    None => debug!("rollback without an open transaction"),
                }
                Ok(Some(Reply::RolledBack))
            }
            command => {
                let tx = slot.as_ref().ok_or_else(|| {
                    ServerError::ProtocolViolation(format!(
                        "{} requires an open transaction",
                        command.name()
                    ))
                })?;
                if let Some(text) = command.sql() {
                    reject_transaction_control(text)?;
                }
                let result = match command {
                    Command::Savepoint { name, action } => {
                        let outcome = tx.savepoint(ctx, &name, action).await;
                        outcome.map(|()| Some(Reply::Savepoint { name, action }))
                    }
                    statement => {
                        let batch_rows = self.batch_rows;
                        tx.run(ctx, move |conn| {
                            run_statement(conn, statement, batch_rows, sink.as_ref())
                        })
                        .await
                    }
                };
                if let Err(err) = &result {
                    if is_fatal(err) {
                        warn!(error = %err, "fatal error inside transaction, rolling back");
                        if let Some(tx) = slot.take() {
                            tx.rollback().await?;
                        }
                    }
                }
                result
            }
        }
    }
}

/// Execute one statement command on `conn`. Shared by transactions and
/// one-shot statements.
///
/// With a `sink`, streamed queries push their batches into it as they are
/// read and `None` is returned. Without one they come back buffered.
pub(crate) fn run_statement(
    conn: &Connection,
    command: Command,
    batch_rows: usize,
    sink: Option<&BatchSink>,
) -> Result<Option<Reply>, ServerError> {
    let reply = match command {
        Command::Query(s) => sql::query(conn, &s.sql, &s.params).map(Reply::Query),
        Command::TypedQuery(s) => sql::typed_query(conn, &s.sql, &s.params).map(Reply::TypedQuery),
        Command::Exec(s) => sql::exec(conn, &s.sql, &s.params).map(Reply::Exec),
        Command::QueryStream(s) => return stream_statement(conn, &s, batch_rows, false, sink),
        Command::TypedQueryStream(s) => return stream_statement(conn, &s, batch_rows, true, sink),
        Command::ExecStream { sql, params } => {
            sql::exec_many(conn, &sql, &params).map(|results| Reply::ExecStream { results })
        }
        other => Err(ServerError::ProtocolViolation(format!(
            "{} is not a statement",
            other.name()
        ))),
    };
    reply.map(Some)
}

fn stream_statement(
    conn: &Connection,
    statement: &Statement,
    batch_rows: usize,
    typed: bool,
    sink: Option<&BatchSink>,
) -> Result<Option<Reply>, ServerError> {
    let sink = match sink {
        Some(sink) => sink,
        None => {
            return sql::query_batches(conn, &statement.sql, &statement.params, batch_rows, typed)
                .map(|batches| Some(Reply::Batches { batches }))
        }
    };
    sql::stream_batches(conn, &statement.sql, &statement.params, batch_rows, typed, |batch| {
        sink.send(batch)
    })?;
    Ok(None)
}
