use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("database not found: {0}")]
    DatabaseNotFound(String),
    #[error("transaction not found or expired: {0}")]
    TransactionNotFound(String),
    #[error("attachment '{alias}' not found on database {database}")]
    AttachmentNotFound { database: String, alias: String },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),
    #[error("resource failure: {0}")]
    ResourceFailure(String),
    #[error("operation cancelled")]
    Cancelled,
    #[error("stream idle for longer than {0:?}")]
    IdleTimeout(Duration),
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse classification used by front-ends to decide how an error is
/// delivered and whether the enclosing transaction survives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    ProtocolViolation,
    Conflict,
    ResourceFailure,
    Statement,
    Cancelled,
    Internal,
}

impl ServerError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServerError::DatabaseNotFound(_)
            | ServerError::TransactionNotFound(_)
            | ServerError::AttachmentNotFound { .. } => ErrorKind::NotFound,
            ServerError::ProtocolViolation(_) | ServerError::InvalidConfig(_) => {
                ErrorKind::ProtocolViolation
            }
            ServerError::Conflict(_) => ErrorKind::Conflict,
            ServerError::ResourceFailure(_) => ErrorKind::ResourceFailure,
            ServerError::Sqlite(_) | ServerError::InvalidParameter(_) => ErrorKind::Statement,
            ServerError::Cancelled | ServerError::IdleTimeout(_) => ErrorKind::Cancelled,
            ServerError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Statement-level failures are reported in-band while a transaction
    /// stays open.
    pub fn is_soft(&self) -> bool {
        self.kind() == ErrorKind::Statement
    }

    pub(crate) fn from_join(err: tokio::task::JoinError) -> Self {
        if err.is_panic() {
            ServerError::Internal("blocking task panicked".to_string())
        } else {
            ServerError::Internal(format!("blocking task cancelled: {err}"))
        }
    }

    pub(crate) fn from_pool(err: r2d2::Error) -> Self {
        ServerError::ResourceFailure(format!("connection unavailable: {err}"))
    }

    pub(crate) fn sqlite_code(&self) -> Option<i32> {
        match self {
            ServerError::Sqlite(rusqlite::Error::SqliteFailure(ffi, _)) => Some(ffi.extended_code),
            _ => None,
        }
    }
}
