use rusqlite::InterruptHandle;
use tracing::debug;

use crate::context::CallContext;
use crate::error::ServerError;

/// Run SQLite work on the blocking pool while honouring the call context.
///
/// The context is checked before the work starts. If it is cancelled while
/// the work runs, the connection is interrupted (when a handle is given) and
/// `Cancelled` is returned without waiting for the blocking task.
pub(crate) async fn run_blocking<T, F>(
    ctx: &CallContext,
    interrupt: Option<&InterruptHandle>,
    work: F,
) -> Result<T, ServerError>
where
    F: FnOnce() -> Result<T, ServerError> + Send + 'static,
    T: Send + 'static,
{
    ctx.check()?;
    let task = tokio::task::spawn_blocking(work);
    tokio::select! {
        biased;
        joined = task => joined.map_err(ServerError::from_join)?,
        _ = ctx.done() => {
            if let Some(handle) = interrupt {
                handle.interrupt();
            }
            debug!("call cancelled while sqlite work was running");
            Err(ServerError::Cancelled)
        }
    }
}
