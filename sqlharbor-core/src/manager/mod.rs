//! Connection resource manager.
//!
//! This module provides:
//! - `ConfigRegistry`: logical name to `DatabaseConfig`
//! - `ConnectionManager`: lazily opened, cached physical handles per
//!   (database, mode), invalidated on config changes and evicted when idle

mod cache;
pub mod registry;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::blocking::run_blocking;
use crate::config::{Attachment, DatabaseConfig, ServerConfig};
use crate::context::CallContext;
use crate::engine::{self, AccessMode, SqliteHandle};
use crate::error::ServerError;
use crate::metadata::{JsonFileStore, MetadataStore, NoopMetadataStore};

pub use cache::CacheSnapshot;
use cache::ConnectionCache;
pub use registry::{AttachOutcome, ConfigRegistry};

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub databases: Vec<String>,
    pub idle_ttl_seconds: u64,
    pub read_write: CacheSnapshot,
    pub read_only: CacheSnapshot,
}

pub struct ConnectionManager {
    registry: ConfigRegistry,
    read_write: ConnectionCache,
    read_only: ConnectionCache,
    store: Arc<dyn MetadataStore>,
    idle_ttl: Duration,
}

impl ConnectionManager {
    pub fn new(idle_ttl: Duration, store: Arc<dyn MetadataStore>) -> Self {
        Self {
            registry: ConfigRegistry::new(),
            read_write: ConnectionCache::new(AccessMode::ReadWrite),
            read_only: ConnectionCache::new(AccessMode::ReadOnly),
            store,
            idle_ttl,
        }
    }

    /// In-memory manager without persistence.
    pub fn in_memory(idle_ttl: Duration) -> Self {
        Self::new(idle_ttl, Arc::new(NoopMetadataStore))
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        let store: Arc<dyn MetadataStore> = match config.metadata_path.as_deref() {
            Some(path) if !path.is_empty() => Arc::new(JsonFileStore::new(path)),
            _ => Arc::new(NoopMetadataStore),
        };
        Self::new(config.connection_idle_ttl(), store)
    }

    fn cache(&self, mode: AccessMode) -> &ConnectionCache {
        match mode {
            AccessMode::ReadWrite => &self.read_write,
            AccessMode::ReadOnly => &self.read_only,
        }
    }

    fn invalidate(&self, name: &str) {
        self.read_write.invalidate(name);
        self.read_only.invalidate(name);
    }

    fn persist(&self) {
        if let Err(err) = self.store.save(&self.registry.list()) {
            warn!(error = %err, "failed to persist database metadata");
        }
    }

    pub fn database(&self, name: &str) -> Option<Arc<DatabaseConfig>> {
        self.registry.get(name)
    }

    pub fn databases(&self) -> Vec<DatabaseConfig> {
        self.registry.list()
    }

    async fn check_connectivity(&self, ctx: &CallContext, config: &DatabaseConfig) -> Result<(), ServerError> {
        let candidate = config.clone();
        run_blocking(ctx, None, move || engine::check_connectivity(&candidate)).await
    }

    /// Validate, check and register a new database.
    #[instrument(skip(self, ctx, config), fields(database = %config.name))]
    pub async fn mount(&self, ctx: &CallContext, config: DatabaseConfig) -> Result<(), ServerError> {
        config.validate()?;
        if self.registry.contains(&config.name) {
            return Err(ServerError::Conflict(format!(
                "database '{}' is already mounted",
                config.name
            )));
        }
        self.registry.resolve_attachments(&config)?;
        self.check_connectivity(ctx, &config).await?;
        self.registry.insert(config)?;
        self.persist();
        info!("database mounted");
        Ok(())
    }

    /// Replace an existing database config; both cached handles are dropped
    /// so the next access opens with the new settings.
    #[instrument(skip(self, ctx, config), fields(database = %config.name))]
    pub async fn update(&self, ctx: &CallContext, config: DatabaseConfig) -> Result<(), ServerError> {
        config.validate()?;
        if !self.registry.contains(&config.name) {
            return Err(ServerError::DatabaseNotFound(config.name.clone()));
        }
        self.registry.resolve_attachments(&config)?;
        self.check_connectivity(ctx, &config).await?;
        let name = config.name.clone();
        self.registry.replace(config)?;
        self.invalidate(&name);
        self.persist();
        info!("database updated");
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn unmount(&self, name: &str) -> Result<(), ServerError> {
        self.registry.remove(name)?;
        self.invalidate(name);
        self.persist();
        info!("database unmounted");
        Ok(())
    }

    /// Attach `attachment` to `parent`. The parent's handles are dropped so
    /// new connections re-apply the attachment list.
    #[instrument(skip(self, attachment), fields(alias = %attachment.alias, target = %attachment.database))]
    pub fn attach(&self, parent: &str, attachment: Attachment) -> Result<AttachOutcome, ServerError> {
        let outcome = self.registry.attach(parent, attachment)?;
        if outcome == AttachOutcome::Added {
            self.invalidate(parent);
            self.persist();
            info!("attachment added");
        }
        Ok(outcome)
    }

    #[instrument(skip(self))]
    pub fn detach(&self, parent: &str, alias: &str) -> Result<(), ServerError> {
        self.registry.detach(parent, alias)?;
        self.invalidate(parent);
        self.persist();
        info!("attachment removed");
        Ok(())
    }

    /// Handle for `name` in `mode`, opening and caching it on first use.
    /// Databases configured read-only always get a read-only handle.
    pub async fn get_connection(
        &self,
        ctx: &CallContext,
        name: &str,
        mode: AccessMode,
    ) -> Result<SqliteHandle, ServerError> {
        if let Some(handle) = self.cache(mode).get(name) {
            return Ok(handle);
        }

        let config = self
            .registry
            .get(name)
            .ok_or_else(|| ServerError::DatabaseNotFound(name.to_string()))?;
        let mode = if config.read_only {
            AccessMode::ReadOnly
        } else {
            mode
        };
        if let Some(handle) = self.cache(mode).get(name) {
            return Ok(handle);
        }
        ctx.check()?;

        let attachments = self.registry.resolve_attachments(&config)?;
        let open_config = Arc::clone(&config);
        let handle = run_blocking(ctx, None, move || {
            let pool = engine::open_pool(&open_config, mode, attachments)?;
            Ok(SqliteHandle::new(open_config.name.clone(), mode, pool))
        })
        .await?;
        Ok(self.cache(mode).insert_or_reuse(name, handle))
    }

    /// Evict idle handles from both caches.
    pub fn evict_idle(&self) -> usize {
        self.read_write.evict_idle(self.idle_ttl) + self.read_only.evict_idle(self.idle_ttl)
    }

    /// Drain both caches. Handles still lent out close when their last user
    /// drops them.
    pub fn close_all(&self) -> usize {
        let closed = self.read_write.drain() + self.read_only.drain();
        info!(closed, "closed all cached handles");
        closed
    }

    /// Mount every persisted database, or `fallback` when nothing is
    /// persisted. Mount order follows attachment dependencies; databases that
    /// fail to mount are logged and skipped.
    pub async fn restore(
        &self,
        ctx: &CallContext,
        fallback: &[DatabaseConfig],
    ) -> Result<usize, ServerError> {
        let persisted = self.store.load()?;
        let mut pending = if persisted.is_empty() {
            fallback.to_vec()
        } else {
            persisted
        };

        let mut mounted = 0;
        loop {
            let (ready, blocked): (Vec<_>, Vec<_>) = pending.into_iter().partition(|config| {
                config
                    .attachments
                    .iter()
                    .all(|a| self.registry.contains(&a.database))
            });
            if ready.is_empty() {
                for config in &blocked {
                    warn!(database = %config.name, "skipping database with unresolved attachments");
                }
                break;
            }
            for config in ready {
                let name = config.name.clone();
                match self.mount(ctx, config).await {
                    Ok(()) => mounted += 1,
                    Err(err) => warn!(database = %name, error = %err, "failed to mount database"),
                }
            }
            pending = blocked;
            if pending.is_empty() {
                break;
            }
        }
        info!(mounted, "restored databases");
        Ok(mounted)
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            databases: self.registry.list().into_iter().map(|c| c.name).collect(),
            idle_ttl_seconds: self.idle_ttl.as_secs(),
            read_write: self.read_write.snapshot(),
            read_only: self.read_only.snapshot(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Caller;

    fn ctx() -> CallContext {
        CallContext::new(Caller::read_write("admin"))
    }

    #[tokio::test]
    async fn mount_conflicts_and_missing_databases() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = ConnectionManager::in_memory(Duration::from_secs(60));
        manager
            .mount(&ctx(), DatabaseConfig::new("db", dir.path().join("db.sqlite")))
            .await?;
        assert!(matches!(
            manager
                .mount(&ctx(), DatabaseConfig::new("db", dir.path().join("other.sqlite")))
                .await,
            Err(ServerError::Conflict(_))
        ));
        assert!(matches!(
            manager.get_connection(&ctx(), "nope", AccessMode::ReadWrite).await,
            Err(ServerError::DatabaseNotFound(_))
        ));
        assert!(matches!(
            manager.unmount("nope"),
            Err(ServerError::DatabaseNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn read_write_and_read_only_handles_are_separate() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = ConnectionManager::in_memory(Duration::from_secs(60));
        manager
            .mount(&ctx(), DatabaseConfig::new("db", dir.path().join("db.sqlite")))
            .await?;
        let rw = manager.get_connection(&ctx(), "db", AccessMode::ReadWrite).await?;
        let ro = manager.get_connection(&ctx(), "db", AccessMode::ReadOnly).await?;
        assert_ne!(rw.id(), ro.id());
        assert_eq!(ro.mode(), AccessMode::ReadOnly);

        let again = manager.get_connection(&ctx(), "db", AccessMode::ReadWrite).await?;
        assert_eq!(rw.id(), again.id());
        Ok(())
    }

    #[tokio::test]
    async fn read_only_databases_never_hand_out_writers() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ro.sqlite");
        rusqlite::Connection::open(&path)?.execute_batch("CREATE TABLE t (v INTEGER)")?;
        let manager = ConnectionManager::in_memory(Duration::from_secs(60));
        manager
            .mount(&ctx(), DatabaseConfig::new("ro", &path).read_only())
            .await?;
        let handle = manager.get_connection(&ctx(), "ro", AccessMode::ReadWrite).await?;
        assert_eq!(handle.mode(), AccessMode::ReadOnly);
        Ok(())
    }

    #[tokio::test]
    async fn config_changes_invalidate_cached_handles() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = ConnectionManager::in_memory(Duration::from_secs(60));
        manager
            .mount(&ctx(), DatabaseConfig::new("main_db", dir.path().join("main.sqlite")))
            .await?;
        manager
            .mount(&ctx(), DatabaseConfig::new("aux_db", dir.path().join("aux.sqlite")))
            .await?;
        let before = manager.get_connection(&ctx(), "main_db", AccessMode::ReadWrite).await?;

        manager.attach("main_db", Attachment::new("aux", "aux_db"))?;
        let after = manager.get_connection(&ctx(), "main_db", AccessMode::ReadWrite).await?;
        assert_ne!(before.id(), after.id());
        after.checkout()?.execute_batch("CREATE TABLE aux.t (v INTEGER)")?;

        // idempotent attach keeps the cached handle
        manager.attach("main_db", Attachment::new("aux", "aux_db"))?;
        let same = manager.get_connection(&ctx(), "main_db", AccessMode::ReadWrite).await?;
        assert_eq!(after.id(), same.id());

        manager.detach("main_db", "aux")?;
        let detached = manager.get_connection(&ctx(), "main_db", AccessMode::ReadWrite).await?;
        assert_ne!(same.id(), detached.id());
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_context_stops_before_opening() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = ConnectionManager::in_memory(Duration::from_secs(60));
        manager
            .mount(&ctx(), DatabaseConfig::new("db", dir.path().join("db.sqlite")))
            .await?;
        let cancelled = ctx();
        cancelled.cancellation().cancel();
        assert!(matches!(
            manager.get_connection(&cancelled, "db", AccessMode::ReadWrite).await,
            Err(ServerError::Cancelled)
        ));
        assert_eq!(manager.snapshot().read_write.entries, 0);
        Ok(())
    }

    #[tokio::test]
    async fn restore_mounts_in_dependency_order() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = Arc::new(JsonFileStore::new(dir.path().join("meta.json")));
        let manager = ConnectionManager::new(Duration::from_secs(60), store.clone());
        manager
            .mount(&ctx(), DatabaseConfig::new("target", dir.path().join("t.sqlite")))
            .await?;
        manager
            .mount(&ctx(), DatabaseConfig::new("parent", dir.path().join("p.sqlite")))
            .await?;
        manager.attach("parent", Attachment::new("t", "target"))?;

        // alphabetical order puts the parent first
        let restored = ConnectionManager::new(Duration::from_secs(60), store);
        assert_eq!(restored.restore(&ctx(), &[]).await?, 2);
        let parent = restored.database("parent").ok_or_else(|| anyhow::anyhow!("missing"))?;
        assert_eq!(parent.attachments, vec![Attachment::new("t", "target")]);
        Ok(())
    }

    #[tokio::test]
    async fn eviction_and_close_all_empty_the_caches() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let manager = ConnectionManager::in_memory(Duration::ZERO);
        manager
            .mount(&ctx(), DatabaseConfig::new("db", dir.path().join("db.sqlite")))
            .await?;
        manager.get_connection(&ctx(), "db", AccessMode::ReadWrite).await?;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(manager.evict_idle(), 1);

        manager.get_connection(&ctx(), "db", AccessMode::ReadOnly).await?;
        assert_eq!(manager.close_all(), 1);
        assert_eq!(manager.snapshot().read_only.entries, 0);
        Ok(())
    }
}
