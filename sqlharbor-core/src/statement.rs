//! One-shot statements executed outside any transaction.

use std::sync::Arc;

use tracing::{debug, instrument};

use crate::blocking::run_blocking;
use crate::context::CallContext;
use crate::error::ServerError;
use crate::manager::ConnectionManager;
use crate::sql_parser::reject_transaction_control;
use crate::tx::{run_statement, Command, Reply};

/// Runs single statements on a connection borrowed for the duration of the
/// statement. SQLite autocommits each one.
pub struct StatementRunner {
    manager: Arc<ConnectionManager>,
    batch_rows: usize,
}

impl StatementRunner {
    pub fn new(manager: Arc<ConnectionManager>, batch_rows: usize) -> Self {
        Self {
            manager,
            batch_rows: batch_rows.max(1),
        }
    }

    #[instrument(skip(self, ctx, command), fields(role = %ctx.caller().role, command = command.name()))]
    pub async fn run(
        &self,
        ctx: &CallContext,
        database: &str,
        command: Command,
    ) -> Result<Reply, ServerError> {
        if !command.is_one_shot() {
            return Err(ServerError::ProtocolViolation(format!(
                "{} cannot run outside a transaction",
                command.name()
            )));
        }
        if let Some(text) = command.sql() {
            reject_transaction_control(text)?;
        }

        let handle = self
            .manager
            .get_connection(ctx, database, ctx.access_mode())
            .await?;
        let conn = run_blocking(ctx, None, move || handle.checkout()).await?;
        let interrupt = conn.get_interrupt_handle();
        let batch_rows = self.batch_rows;
        let reply = run_blocking(ctx, Some(&interrupt), move || {
            run_statement(&conn, command, batch_rows, None)
        })
        .await?
        .ok_or_else(|| ServerError::Internal("streamed reply without a sink".to_string()))?;
        debug!(database, "statement finished");
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::DatabaseConfig;
    use crate::context::Caller;
    use crate::engine::SqlValue;
    use crate::error::ErrorKind;
    use crate::tx::Statement;

    async fn runner(dir: &std::path::Path) -> anyhow::Result<StatementRunner> {
        let manager = Arc::new(ConnectionManager::in_memory(Duration::from_secs(60)));
        let ctx = CallContext::new(Caller::read_write("admin"));
        manager
            .mount(&ctx, DatabaseConfig::new("db", dir.join("db.sqlite")))
            .await?;
        let runner = StatementRunner::new(manager, 8);
        runner
            .run(&ctx, "db", Command::exec("CREATE TABLE t (v TEXT)"))
            .await?;
        Ok(runner)
    }

    #[tokio::test]
    async fn statements_autocommit() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path()).await?;
        let ctx = CallContext::new(Caller::read_write("writer"));
        let insert = Command::Exec(
            Statement::with_params("INSERT INTO t VALUES (?)", vec![SqlValue::from("a")]),
        );
        match runner.run(&ctx, "db", insert).await? {
            Reply::Exec(result) => assert_eq!(result.rows_affected, 1),
            other => anyhow::bail!("unexpected reply {other:?}"),
        }
        match runner.run(&ctx, "db", Command::query("SELECT v FROM t")).await? {
            Reply::Query(result) => {
                assert_eq!(result.rows, vec![vec![SqlValue::from("a")]]);
            }
            other => anyhow::bail!("unexpected reply {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn transaction_commands_are_rejected() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path()).await?;
        let ctx = CallContext::new(Caller::read_write("writer"));
        for command in [
            Command::begin("db"),
            Command::Commit,
            Command::exec("BEGIN; INSERT INTO t VALUES ('x')"),
        ] {
            let err = runner
                .run(&ctx, "db", command)
                .await
                .err()
                .ok_or_else(|| anyhow::anyhow!("expected violation"))?;
            assert_eq!(err.kind(), ErrorKind::ProtocolViolation);
        }
        Ok(())
    }

    #[tokio::test]
    async fn unknown_databases_are_not_found() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path()).await?;
        let ctx = CallContext::new(Caller::read_write("writer"));
        let err = runner
            .run(&ctx, "nope", Command::query("SELECT 1"))
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected not found"))?;
        assert_eq!(err.kind(), ErrorKind::NotFound);
        Ok(())
    }

    #[tokio::test]
    async fn read_only_callers_get_statement_errors_on_writes() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let runner = runner(dir.path()).await?;
        let ctx = CallContext::new(Caller::read_only("viewer"));
        let err = runner
            .run(&ctx, "db", Command::exec("INSERT INTO t VALUES ('x')"))
            .await
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected read-only failure"))?;
        assert!(err.is_soft());
        Ok(())
    }
}
