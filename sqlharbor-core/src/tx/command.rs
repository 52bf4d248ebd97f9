//! Command and reply shapes shared by every front-end.

use serde::{Deserialize, Serialize};

use crate::engine::{AccessMode, ExecResult, Params, QueryResult, RowBatch, TypedQueryResult};
use crate::error::{ErrorKind, ServerError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    #[default]
    Deferred,
    Immediate,
    Exclusive,
}

impl LockMode {
    pub(crate) fn begin_sql(self) -> &'static str {
        match self {
            LockMode::Deferred => "BEGIN DEFERRED",
            LockMode::Immediate => "BEGIN IMMEDIATE",
            LockMode::Exclusive => "BEGIN EXCLUSIVE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SavepointAction {
    Create,
    RollbackTo,
    Release,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statement {
    pub sql: String,
    #[serde(default)]
    pub params: Params,
}

impl Statement {
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Params::default(),
        }
    }

    pub fn with_params(sql: impl Into<String>, params: impl Into<Params>) -> Self {
        Self {
            sql: sql.into(),
            params: params.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    Begin {
        database: String,
        #[serde(default)]
        lock_mode: LockMode,
        /// Session lifetime between calls; only meaningful for sessions.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Query(Statement),
    Exec(Statement),
    TypedQuery(Statement),
    QueryStream(Statement),
    TypedQueryStream(Statement),
    ExecStream {
        sql: String,
        #[serde(default)]
        params: Vec<Params>,
    },
    Savepoint {
        name: String,
        action: SavepointAction,
    },
    Commit,
    Rollback,
}

impl Command {
    pub fn begin(database: impl Into<String>) -> Self {
        Command::Begin {
            database: database.into(),
            lock_mode: LockMode::default(),
            timeout_ms: None,
        }
    }

    pub fn query(sql: impl Into<String>) -> Self {
        Command::Query(Statement::new(sql))
    }

    pub fn exec(sql: impl Into<String>) -> Self {
        Command::Exec(Statement::new(sql))
    }

    pub fn savepoint(name: impl Into<String>, action: SavepointAction) -> Self {
        Command::Savepoint {
            name: name.into(),
            action,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Command::Begin { .. } => "begin",
            Command::Query(_) => "query",
            Command::Exec(_) => "exec",
            Command::TypedQuery(_) => "typed_query",
            Command::QueryStream(_) => "query_stream",
            Command::TypedQueryStream(_) => "typed_query_stream",
            Command::ExecStream { .. } => "exec_stream",
            Command::Savepoint { .. } => "savepoint",
            Command::Commit => "commit",
            Command::Rollback => "rollback",
        }
    }

    /// SQL text carried by the command, if any.
    pub(crate) fn sql(&self) -> Option<&str> {
        match self {
            Command::Query(s)
            | Command::Exec(s)
            | Command::TypedQuery(s)
            | Command::QueryStream(s)
            | Command::TypedQueryStream(s) => Some(&s.sql),
            Command::ExecStream { sql, .. } => Some(sql),
            _ => None,
        }
    }

    /// Statement commands that may run outside a transaction.
    pub fn is_one_shot(&self) -> bool {
        self.sql().is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reply {
    Begun {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<String>,
        database: String,
        mode: AccessMode,
    },
    Query(QueryResult),
    TypedQuery(TypedQueryResult),
    Exec(ExecResult),
    ExecStream {
        results: Vec<ExecResult>,
    },
    /// All batches of a streamed query, for front-ends that answer in one message.
    Batches {
        batches: Vec<RowBatch>,
    },
    /// One batch of a streamed query, as sent on a stream.
    Batch(RowBatch),
    Savepoint {
        name: String,
        action: SavepointAction,
    },
    Committed,
    RolledBack,
    /// Statement failed; the transaction is still open.
    StatementError {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<i32>,
    },
    /// Terminal failure; the stream closes after this reply.
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Reply {
    pub fn statement_error(err: &ServerError) -> Self {
        Reply::StatementError {
            message: err.to_string(),
            code: err.sqlite_code(),
        }
    }

    pub fn error(err: &ServerError) -> Self {
        Reply::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::SqlValue;

    #[test]
    fn commands_decode_from_tagged_json() -> anyhow::Result<()> {
        let begin: Command =
            serde_json::from_str(r#"{"type":"begin","database":"db1","lock_mode":"immediate"}"#)?;
        assert_eq!(
            begin,
            Command::Begin {
                database: "db1".into(),
                lock_mode: LockMode::Immediate,
                timeout_ms: None,
            }
        );

        let query: Command = serde_json::from_str(
            r#"{"type":"query","sql":"SELECT ?","params":[{"type":"integer","value":3}]}"#,
        )?;
        assert_eq!(
            query,
            Command::Query(Statement::with_params("SELECT ?", vec![SqlValue::Integer(3)]))
        );

        let savepoint: Command =
            serde_json::from_str(r#"{"type":"savepoint","name":"sp1","action":"rollback_to"}"#)?;
        assert_eq!(savepoint, Command::savepoint("sp1", SavepointAction::RollbackTo));

        let commit: Command = serde_json::from_str(r#"{"type":"commit"}"#)?;
        assert_eq!(commit, Command::Commit);
        Ok(())
    }

    #[test]
    fn unknown_commands_fail_to_decode() {
        assert!(serde_json::from_str::<Command>(r#"{"type":"vacuum"}"#).is_err());
    }

    #[test]
    fn error_replies_decode_back_with_their_kind() -> anyhow::Result<()> {
        let reply = Reply::error(&ServerError::ResourceFailure("disk full".into()));
        let text = serde_json::to_string(&reply)?;
        let decoded: Reply = serde_json::from_str(&text)?;
        assert_eq!(decoded, reply);
        match decoded {
            Reply::Error { kind, .. } => assert_eq!(kind, ErrorKind::ResourceFailure),
            other => anyhow::bail!("unexpected reply {other:?}"),
        }
        let kind: ErrorKind = serde_json::from_str(r#""protocol_violation""#)?;
        assert_eq!(kind, ErrorKind::ProtocolViolation);
        Ok(())
    }

    #[test]
    fn statement_errors_carry_the_sqlite_code() -> anyhow::Result<()> {
        let conn = rusqlite::Connection::open_in_memory()?;
        let err = match conn.execute_batch("INSERT INTO missing VALUES (1)") {
            Ok(()) => anyhow::bail!("expected failure"),
            Err(err) => ServerError::from(err),
        };
        let json = serde_json::to_value(Reply::statement_error(&err))?;
        assert_eq!(json["type"], "statement_error");
        assert!(json["code"].is_number());
        Ok(())
    }
}
