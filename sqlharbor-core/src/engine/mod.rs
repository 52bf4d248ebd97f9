//! SQLite engine module - pooled physical handles and statement execution.
//!
//! This module provides:
//! - `SqliteHandle`: one r2d2 pool per (database, mode)
//! - statement helpers shared by one-shot statements and transactions
//! - wire values and result shapes

pub mod connection;
mod factory;
pub mod value;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use connection::SqliteHandle;
pub(crate) use factory::{check_connectivity, open_pool, quote_identifier, ResolvedAttachment};
pub use factory::SqliteManager;
pub use value::{
    ColumnInfo, ExecResult, Params, QueryResult, RowBatch, SqlValue, TypedQueryResult,
};

/// Which of the two per-database caches a handle belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

impl fmt::Display for AccessMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AccessMode::ReadWrite => f.write_str("read_write"),
            AccessMode::ReadOnly => f.write_str("read_only"),
        }
    }
}
