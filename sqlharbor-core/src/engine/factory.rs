//! Pooled SQLite connection factory.
//!
//! Each logical database gets one pool per access mode. Every physical
//! connection in a pool is opened with the mode's flags and then initialized
//! with the database's pragmas, extensions and attachments, so callers check
//! out ready-to-use connections without re-running setup.

use std::path::{Path, PathBuf};
use std::time::Duration;

use r2d2::{CustomizeConnection, ManageConnection, Pool};
use rusqlite::{Connection, LoadExtensionGuard, OpenFlags};
use tracing::{debug, info, instrument};

use crate::config::DatabaseConfig;
use crate::engine::AccessMode;
use crate::error::ServerError;

/// Attachment with its target resolved to a file path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAttachment {
    pub alias: String,
    pub path: PathBuf,
}

/// r2d2 manager that opens SQLite connections with mode-appropriate flags.
#[derive(Debug, Clone)]
pub struct SqliteManager {
    path: PathBuf,
    flags: OpenFlags,
}

impl SqliteManager {
    fn new(path: &Path, mode: AccessMode) -> Self {
        Self {
            path: path.to_path_buf(),
            flags: open_flags(mode),
        }
    }
}

fn open_flags(mode: AccessMode) -> OpenFlags {
    let base = OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    match mode {
        AccessMode::ReadWrite => {
            base | OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE
        }
        AccessMode::ReadOnly => base | OpenFlags::SQLITE_OPEN_READ_ONLY,
    }
}

impl ManageConnection for SqliteManager {
    type Connection = Connection;
    type Error = ServerError;

    fn connect(&self) -> Result<Self::Connection, Self::Error> {
        Ok(Connection::open_with_flags(&self.path, self.flags)?)
    }

    fn is_valid(&self, conn: &mut Self::Connection) -> Result<(), Self::Error> {
        ping(conn)
    }

    /// A connection returned while still inside a transaction (failed commit,
    /// interrupted rollback) is not trustworthy and is closed instead of reused.
    fn has_broken(&self, conn: &mut Self::Connection) -> bool {
        !conn.is_autocommit()
    }
}

/// Applies per-database settings to each freshly opened connection.
#[derive(Debug, Clone)]
struct ApplyDatabaseSettings {
    mode: AccessMode,
    busy_timeout: Duration,
    pragmas: Vec<(String, String)>,
    extensions: Vec<PathBuf>,
    attachments: Vec<ResolvedAttachment>,
}

impl CustomizeConnection<Connection, ServerError> for ApplyDatabaseSettings {
    fn on_acquire(&self, conn: &mut Connection) -> Result<(), ServerError> {
        conn.busy_timeout(self.busy_timeout)?;

        for (key, value) in &self.pragmas {
            if self.mode == AccessMode::ReadOnly && key.eq_ignore_ascii_case("journal_mode") {
                // journal mode is persistent and owned by the writer side
                continue;
            }
            match value.parse::<i64>() {
                Ok(number) => conn.pragma_update(None, key, number)?,
                Err(_) => conn.pragma_update(None, key, value)?,
            }
        }

        if !self.extensions.is_empty() {
            // SAFETY: extension paths come from operator-controlled database
            // configuration, never from client requests.
            unsafe {
                let _guard = LoadExtensionGuard::new(conn)?;
                for extension in &self.extensions {
                    conn.load_extension(extension, None::<&str>)?;
                }
            }
        }

        for attachment in &self.attachments {
            let uri = attachment_uri(&attachment.path, self.mode);
            conn.execute(
                &format!("ATTACH DATABASE ?1 AS {}", quote_identifier(&attachment.alias)),
                [uri],
            )?;
        }

        if self.mode == AccessMode::ReadOnly {
            conn.pragma_update(None, "query_only", true)?;
        }
        Ok(())
    }
}

/// Build the pool for one (database, mode) pair and verify it with a
/// liveness check before handing it out.
#[instrument(skip(config, attachments), fields(database = %config.name, mode = %mode))]
pub(crate) fn open_pool(
    config: &DatabaseConfig,
    mode: AccessMode,
    attachments: Vec<ResolvedAttachment>,
) -> Result<Pool<SqliteManager>, ServerError> {
    let manager = SqliteManager::new(&config.path, mode);
    let customizer = ApplyDatabaseSettings {
        mode,
        busy_timeout: config.pool.busy_timeout(),
        pragmas: config
            .pragmas
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect(),
        extensions: config.extensions.clone(),
        attachments,
    };

    let pool = Pool::builder()
        .max_size(config.pool.max_size)
        .min_idle(Some(config.pool.min_idle))
        .idle_timeout(config.pool.idle_lifetime())
        .max_lifetime(config.pool.max_lifetime())
        .connection_timeout(config.pool.connection_timeout())
        .connection_customizer(Box::new(customizer))
        .build_unchecked(manager);

    let mut conn = pool.get().map_err(ServerError::from_pool)?;
    ping(&mut conn).map_err(|err| {
        ServerError::ResourceFailure(format!(
            "liveness check failed for {}: {err}",
            config.name
        ))
    })?;

    info!(path = %config.path.display(), "opened connection pool");
    Ok(pool)
}

/// One-off connectivity check used before a database is registered.
pub(crate) fn check_connectivity(config: &DatabaseConfig) -> Result<(), ServerError> {
    let mode = if config.read_only {
        AccessMode::ReadOnly
    } else {
        AccessMode::ReadWrite
    };
    let mut conn = Connection::open_with_flags(&config.path, open_flags(mode)).map_err(|err| {
        ServerError::ResourceFailure(format!(
            "cannot open {} at {}: {err}",
            config.name,
            config.path.display()
        ))
    })?;
    ping(&mut conn)
        .map_err(|err| ServerError::ResourceFailure(format!("connectivity check failed: {err}")))?;
    debug!(database = %config.name, "connectivity check succeeded");
    Ok(())
}

fn ping(conn: &mut Connection) -> Result<(), ServerError> {
    conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
    Ok(())
}

fn attachment_uri(path: &Path, mode: AccessMode) -> String {
    let mut encoded = String::new();
    for c in path.to_string_lossy().chars() {
        match c {
            '%' => encoded.push_str("%25"),
            '?' => encoded.push_str("%3f"),
            '#' => encoded.push_str("%23"),
            other => encoded.push(other),
        }
    }
    match mode {
        AccessMode::ReadWrite => format!("file:{encoded}"),
        AccessMode::ReadOnly => format!("file:{encoded}?mode=ro"),
    }
}

pub(crate) fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use anyhow::Result;

    use super::*;
    use crate::config::DatabaseConfig;

    #[test]
    fn read_only_pool_rejects_writes_at_the_engine() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DatabaseConfig::new("ro", dir.path().join("ro.db"));
        let rw = open_pool(&config, AccessMode::ReadWrite, Vec::new())?;
        rw.get()?.execute_batch("CREATE TABLE t (id INTEGER)")?;

        let ro = open_pool(&config, AccessMode::ReadOnly, Vec::new())?;
        let conn = ro.get()?;
        assert!(conn.execute_batch("INSERT INTO t VALUES (1)").is_err());
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM t", [], |r| r.get(0))?;
        assert_eq!(count, 0);
        Ok(())
    }

    #[test]
    fn pragmas_and_attachments_apply_to_new_connections() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let aux_path = dir.path().join("aux file?.db");
        Connection::open(&aux_path)?.execute_batch("CREATE TABLE aux_t (v TEXT)")?;

        let config =
            DatabaseConfig::new("main_db", dir.path().join("main.db")).with_pragma("user_version", "7");
        let pool = open_pool(
            &config,
            AccessMode::ReadWrite,
            vec![ResolvedAttachment {
                alias: "aux".to_string(),
                path: aux_path,
            }],
        )?;
        let conn = pool.get()?;
        let version: i64 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
        assert_eq!(version, 7);
        conn.execute_batch("INSERT INTO aux.aux_t VALUES ('x')")?;
        Ok(())
    }

    #[test]
    fn connections_left_in_a_transaction_are_broken() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = SqliteManager::new(&dir.path().join("b.db"), AccessMode::ReadWrite);
        let mut conn = manager.connect()?;
        assert!(!manager.has_broken(&mut conn));
        conn.execute_batch("BEGIN")?;
        assert!(manager.has_broken(&mut conn));
        Ok(())
    }

    #[test]
    fn connectivity_check_fails_for_missing_read_only_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DatabaseConfig::new("missing", dir.path().join("nope.db")).read_only();
        assert!(matches!(
            check_connectivity(&config),
            Err(ServerError::ResourceFailure(_))
        ));
        Ok(())
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_identifier("sp1"), "\"sp1\"");
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
