mod blocking;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod manager;
pub mod metadata;
pub mod reaper;
pub mod session;
pub mod sql_parser;
pub mod statement;
pub mod tx;

pub use context::{CallContext, Caller};
pub use error::{ErrorKind, ServerError};
