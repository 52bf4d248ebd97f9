use std::collections::{BTreeMap, HashSet};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Process-level settings, loaded from defaults, an optional file named by
/// `SQLHARBOR_CONFIG`, and `SQLHARBOR_*` environment variables.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Log format: "compact" or "json".
    pub log_format: String,
    /// Cached connections unused for longer than this are evicted.
    pub connection_idle_ttl_seconds: u64,
    /// Period of the connection evictor.
    pub eviction_interval_seconds: u64,
    /// Session transaction timeout applied when `Begin` carries none.
    pub transaction_timeout_seconds: u64,
    /// Upper bound for a caller-supplied session transaction timeout.
    pub transaction_max_timeout_seconds: u64,
    /// Period of the session reaper.
    pub session_reap_interval_seconds: u64,
    /// A stream receiving nothing for this long is cancelled.
    pub stream_idle_timeout_seconds: u64,
    /// Rows per batch for the streaming query variants.
    pub stream_batch_rows: usize,
    /// JSON file holding mounted database configs; in-memory only when unset.
    pub metadata_path: Option<String>,
    /// Databases mounted at startup when the metadata store is empty.
    #[serde(default)]
    pub databases: Vec<DatabaseConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 4280,
            log_format: "compact".to_string(),
            connection_idle_ttl_seconds: 300,
            eviction_interval_seconds: 30,
            transaction_timeout_seconds: 30,
            transaction_max_timeout_seconds: 600,
            session_reap_interval_seconds: 5,
            stream_idle_timeout_seconds: 60,
            stream_batch_rows: 256,
            metadata_path: None,
            databases: Vec::new(),
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let defaults_json = serde_json::to_string(&Self::default())
            .with_context(|| "failed to serialize defaults")?;
        let mut builder = config::Config::builder().add_source(
            config::File::from_str(&defaults_json, config::FileFormat::Json).required(false),
        );
        if let Ok(path) = std::env::var("SQLHARBOR_CONFIG") {
            builder = builder.add_source(config::File::with_name(&path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("SQLHARBOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .with_context(|| "failed to load configuration")?;
        let cfg: ServerConfig = settings
            .try_deserialize()
            .with_context(|| "failed to deserialize configuration")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.to_socket_addrs()?
            .next()
            .ok_or_else(|| anyhow::anyhow!("unable to resolve bind address for {addr}"))
    }

    pub fn connection_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.connection_idle_ttl_seconds)
    }

    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_seconds.max(1))
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout_seconds.max(1))
    }

    pub fn transaction_max_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_max_timeout_seconds.max(1))
    }

    pub fn session_reap_interval(&self) -> Duration {
        Duration::from_secs(self.session_reap_interval_seconds.max(1))
    }

    pub fn stream_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.stream_idle_timeout_seconds.max(1))
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.transaction_timeout_seconds > self.transaction_max_timeout_seconds {
            anyhow::bail!(
                "transaction_timeout_seconds ({}) exceeds transaction_max_timeout_seconds ({})",
                self.transaction_timeout_seconds,
                self.transaction_max_timeout_seconds
            );
        }
        if self.stream_batch_rows == 0 {
            anyhow::bail!("stream_batch_rows must be positive");
        }
        for db in &self.databases {
            db.validate()
                .with_context(|| format!("invalid database config '{}'", db.name))?;
        }
        Ok(())
    }
}

/// Connection parameters for one logical database.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
    /// Applied in key order to every new physical connection.
    #[serde(default)]
    pub pragmas: BTreeMap<String, String>,
    #[serde(default)]
    pub pool: PoolLimits,
    /// Loadable extensions, loaded on every new physical connection.
    #[serde(default)]
    pub extensions: Vec<PathBuf>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Attachment {
    pub alias: String,
    /// Logical name of the attached database.
    pub database: String,
}

impl Attachment {
    pub fn new(alias: impl Into<String>, database: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            database: database.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolLimits {
    pub max_size: u32,
    pub min_idle: u32,
    pub connection_timeout_ms: u64,
    pub busy_timeout_ms: u64,
    /// Pooled physical connections idle for longer than this are closed.
    pub idle_lifetime_seconds: Option<u64>,
    pub max_lifetime_seconds: Option<u64>,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_size: 4,
            min_idle: 0,
            connection_timeout_ms: 5_000,
            busy_timeout_ms: 5_000,
            idle_lifetime_seconds: Some(600),
            max_lifetime_seconds: None,
        }
    }
}

impl PoolLimits {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms.max(1))
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn idle_lifetime(&self) -> Option<Duration> {
        self.idle_lifetime_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    pub fn max_lifetime(&self) -> Option<Duration> {
        self.max_lifetime_seconds
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

impl DatabaseConfig {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            read_only: false,
            pragmas: BTreeMap::new(),
            pool: PoolLimits::default(),
            extensions: Vec::new(),
            attachments: Vec::new(),
        }
    }

    pub fn with_pragma(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pragmas.insert(key.into(), value.into());
        self
    }

    pub fn with_attachment(mut self, attachment: Attachment) -> Self {
        self.attachments.push(attachment);
        self
    }

    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }

    /// Shape checks that need no knowledge of other databases.
    pub fn validate(&self) -> Result<(), ServerError> {
        if !is_valid_name(&self.name) {
            return Err(ServerError::InvalidConfig(format!(
                "database name '{}' must be non-empty and contain only [A-Za-z0-9_-]",
                self.name
            )));
        }
        if self.path.as_os_str().is_empty() {
            return Err(ServerError::InvalidConfig(format!(
                "database '{}' has an empty path",
                self.name
            )));
        }
        if self.pool.max_size == 0 {
            return Err(ServerError::InvalidConfig(
                "pool.max_size must be at least 1".to_string(),
            ));
        }
        if self.pool.min_idle > self.pool.max_size {
            return Err(ServerError::InvalidConfig(format!(
                "pool.min_idle ({}) exceeds pool.max_size ({})",
                self.pool.min_idle, self.pool.max_size
            )));
        }
        for key in self.pragmas.keys() {
            if !is_identifier(key) {
                return Err(ServerError::InvalidConfig(format!(
                    "invalid pragma name '{key}'"
                )));
            }
        }
        let mut aliases = HashSet::new();
        for attachment in &self.attachments {
            validate_alias(&attachment.alias)?;
            if attachment.database == self.name {
                return Err(ServerError::InvalidConfig(format!(
                    "database '{}' cannot attach itself",
                    self.name
                )));
            }
            if !aliases.insert(attachment.alias.to_ascii_lowercase()) {
                return Err(ServerError::Conflict(format!(
                    "duplicate attachment alias '{}' on database '{}'",
                    attachment.alias, self.name
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn validate_alias(alias: &str) -> Result<(), ServerError> {
    if !is_identifier(alias) {
        return Err(ServerError::InvalidConfig(format!(
            "invalid attachment alias '{alias}'"
        )));
    }
    if alias.eq_ignore_ascii_case("main") || alias.eq_ignore_ascii_case("temp") {
        return Err(ServerError::InvalidConfig(format!(
            "attachment alias '{alias}' is reserved"
        )));
    }
    Ok(())
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_identifier(value: &str) -> bool {
    let mut chars = value.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
