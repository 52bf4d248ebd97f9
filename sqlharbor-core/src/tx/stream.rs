//! Stream front-end: one transaction state per bidirectional stream.

use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};

use crate::context::CallContext;
use crate::error::ServerError;
use crate::tx::command::{Command, Reply};
use crate::tx::{is_fatal, TxEngine, TxHandle};

/// Per-stream state. Dropping it rolls back an open transaction.
#[derive(Default)]
struct StreamTransactionState {
    tx: Option<TxHandle>,
}

impl StreamTransactionState {
    fn database(&self) -> Option<&str> {
        self.tx.as_ref().map(TxHandle::database)
    }
}

/// One item read from a stream peer.
#[derive(Debug)]
pub enum Inbound {
    Command(Command),
    /// Transport-level liveness signal. Resets the idle timer and nothing else.
    KeepAlive,
}

impl From<Command> for Inbound {
    fn from(command: Command) -> Self {
        Inbound::Command(command)
    }
}

async fn send(outbound: &mpsc::Sender<Reply>, reply: Reply) -> Result<(), ServerError> {
    outbound.send(reply).await.map_err(|_| {
        debug!("stream peer went away");
        ServerError::Cancelled
    })
}

/// Drive one stream until the peer closes it, the idle timer fires, the
/// context is cancelled, or a protocol violation or fatal error ends it.
///
/// Streamed queries are delivered as one `Reply::Batch` per batch, sent while
/// the query is still reading rows. Statement errors are reported in-band and
/// the stream continues. Any inbound item, keep-alives included, resets the
/// idle timer.
#[instrument(skip_all, fields(role = %ctx.caller().role))]
pub async fn run_stream<S, I>(
    engine: &TxEngine,
    ctx: CallContext,
    idle_timeout: Duration,
    mut inbound: S,
    outbound: mpsc::Sender<Reply>,
) -> Result<(), ServerError>
where
    S: Stream<Item = Result<I, ServerError>> + Unpin,
    I: Into<Inbound>,
{
    let mut state = StreamTransactionState::default();
    info!("stream opened");

    loop {
        let next = tokio::select! {
            biased;
            _ = ctx.done() => {
                warn!(database = ?state.database(), "stream cancelled");
                return Err(ServerError::Cancelled);
            }
            next = tokio::time::timeout(idle_timeout, inbound.next()) => next,
        };

        let command = match next {
            Err(_) => {
                warn!(database = ?state.database(), ?idle_timeout, "stream idle, cancelling");
                ctx.cancellation().cancel();
                let err = ServerError::IdleTimeout(idle_timeout);
                let _ = send(&outbound, Reply::error(&err)).await;
                return Err(err);
            }
            Ok(None) => {
                if let Some(database) = state.database() {
                    info!(database, "stream closed with an open transaction, rolling back");
                } else {
                    info!("stream closed");
                }
                return Ok(());
            }
            Ok(Some(Err(err))) => {
                let _ = send(&outbound, Reply::error(&err)).await;
                return Err(err);
            }
            Ok(Some(Ok(item))) => match Into::<Inbound>::into(item) {
                Inbound::Command(command) => command,
                Inbound::KeepAlive => {
                    trace!("keep-alive");
                    continue;
                }
            },
        };

        match engine
            .dispatch_streaming(&ctx, &mut state.tx, command, &outbound)
            .await
        {
            Ok(Some(reply)) => send(&outbound, reply).await?,
            Ok(None) => {}
            Err(err) if err.is_soft() => send(&outbound, Reply::statement_error(&err)).await?,
            Err(err) => {
                if is_fatal(&err) {
                    warn!(error = %err, "fatal error, closing stream");
                } else {
                    debug!(error = %err, "protocol error, closing stream");
                }
                let _ = send(&outbound, Reply::error(&err)).await;
                return Err(err);
            }
        }
    }
}
