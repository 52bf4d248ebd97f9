//! Script front-end: an ordered command list executed in one call.

use std::fmt;

use tracing::{info, instrument, warn};

use crate::context::CallContext;
use crate::error::ServerError;
use crate::tx::command::{Command, Reply};
use crate::tx::{TxEngine, TxHandle};

/// Replies produced before the failing command, plus the failure itself.
#[derive(Debug)]
pub struct ScriptFailure {
    pub replies: Vec<Reply>,
    /// Zero-based position of the failing command, if one was reached.
    pub index: Option<usize>,
    pub error: ServerError,
}

impl fmt::Display for ScriptFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.index {
            Some(index) => write!(f, "script failed at command {index}: {}", self.error),
            None => write!(f, "script failed: {}", self.error),
        }
    }
}

impl std::error::Error for ScriptFailure {}

/// Run `commands` in order against one transaction state, stopping at the
/// first failure (statement errors included). Whatever transaction is still
/// open when the script stops is rolled back, never committed.
#[instrument(skip_all, fields(role = %ctx.caller().role, commands = commands.len()))]
pub async fn run_script(
    engine: &TxEngine,
    ctx: &CallContext,
    commands: Vec<Command>,
) -> Result<Vec<Reply>, ScriptFailure> {
    if commands.is_empty() {
        return Err(ScriptFailure {
            replies: Vec::new(),
            index: None,
            error: ServerError::ProtocolViolation("script contains no commands".to_string()),
        });
    }

    let mut slot: Option<TxHandle> = None;
    let mut replies = Vec::with_capacity(commands.len());
    for (index, command) in commands.into_iter().enumerate() {
        match engine.dispatch(ctx, &mut slot, command).await {
            Ok(reply) => replies.push(reply),
            Err(error) => {
                warn!(index, error = %error, "script stopped");
                // `slot` drops here and rolls back whatever is still open
                return Err(ScriptFailure {
                    replies,
                    index: Some(index),
                    error,
                });
            }
        }
    }

    if let Some(tx) = slot.take() {
        let _ = tx.rollback().await;
        return Err(ScriptFailure {
            replies,
            index: None,
            error: ServerError::ProtocolViolation(
                "script ended with an open transaction; it was rolled back".to_string(),
            ),
        });
    }

    info!(replies = replies.len(), "script completed");
    Ok(replies)
}
