//! Per-mode cache of physical handles keyed by logical database name.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info};

use crate::engine::{AccessMode, SqliteHandle};

/// Timestamp writes closer together than this are skipped.
const TOUCH_DEBOUNCE_MS: u64 = 1_000;

pub(crate) struct CachedConnection {
    handle: SqliteHandle,
    /// Milliseconds since the owning cache's epoch.
    last_used_ms: AtomicU64,
}

impl CachedConnection {
    fn idle_for(&self, now_ms: u64) -> Duration {
        Duration::from_millis(now_ms.saturating_sub(self.last_used_ms.load(Ordering::Acquire)))
    }

    fn touch(&self, now_ms: u64) {
        let last = self.last_used_ms.load(Ordering::Relaxed);
        if now_ms.saturating_sub(last) > TOUCH_DEBOUNCE_MS {
            self.last_used_ms.store(now_ms, Ordering::Release);
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheSnapshot {
    pub mode: AccessMode,
    pub entries: usize,
    pub handles_opened: u64,
    pub handles_discarded: u64,
    pub open_connections: u64,
    pub idle_connections: u64,
}

pub(crate) struct ConnectionCache {
    mode: AccessMode,
    entries: DashMap<String, Arc<CachedConnection>>,
    epoch: Instant,
    opened: AtomicU64,
    discarded: AtomicU64,
}

impl ConnectionCache {
    pub(crate) fn new(mode: AccessMode) -> Self {
        Self {
            mode,
            entries: DashMap::new(),
            epoch: Instant::now(),
            opened: AtomicU64::new(0),
            discarded: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Fast path: a cached handle, with a debounced last-used refresh.
    pub(crate) fn get(&self, name: &str) -> Option<SqliteHandle> {
        self.get_at(name, self.now_ms())
    }

    fn get_at(&self, name: &str, now_ms: u64) -> Option<SqliteHandle> {
        let entry = self.entries.get(name)?;
        entry.touch(now_ms);
        Some(entry.handle.clone())
    }

    /// Insert a freshly opened handle unless another caller won the race, in
    /// which case `handle` is dropped and the winner is returned.
    pub(crate) fn insert_or_reuse(&self, name: &str, handle: SqliteHandle) -> SqliteHandle {
        self.opened.fetch_add(1, Ordering::Relaxed);
        let now_ms = self.now_ms();
        match self.entries.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let existing = existing.get().clone();
                existing.last_used_ms.store(now_ms, Ordering::Release);
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(database = name, mode = %self.mode, "lost open race, reusing cached handle");
                existing.handle.clone()
            }
            Entry::Vacant(slot) => {
                let cached = Arc::new(CachedConnection {
                    handle: handle.clone(),
                    last_used_ms: AtomicU64::new(now_ms),
                });
                slot.insert(cached);
                debug!(database = name, mode = %self.mode, "cached new handle");
                handle
            }
        }
    }

    /// Drop the cached handle for `name`. In-flight users keep their clone.
    pub(crate) fn invalidate(&self, name: &str) -> bool {
        match self.entries.remove(name) {
            Some(_) => {
                self.discarded.fetch_add(1, Ordering::Relaxed);
                debug!(database = name, mode = %self.mode, "invalidated cached handle");
                true
            }
            None => false,
        }
    }

    /// Remove entries idle for longer than `ttl`. Removal is conditional so a
    /// refresh racing with the scan keeps its entry; removed handles are
    /// closed only after the scan completes.
    pub(crate) fn evict_idle(&self, ttl: Duration) -> usize {
        self.evict_idle_at(ttl, self.now_ms())
    }

    fn evict_idle_at(&self, ttl: Duration, now_ms: u64) -> usize {
        let candidates: Vec<String> = self
            .entries
            .iter()
            .filter(|entry| entry.value().idle_for(now_ms) > ttl)
            .map(|entry| entry.key().clone())
            .collect();

        let mut evicted = Vec::with_capacity(candidates.len());
        for name in candidates {
            if let Some(removed) = self
                .entries
                .remove_if(&name, |_, cached| cached.idle_for(now_ms) > ttl)
            {
                evicted.push(removed);
            }
        }

        let count = evicted.len();
        if count > 0 {
            self.discarded.fetch_add(count as u64, Ordering::Relaxed);
            info!(mode = %self.mode, evicted = count, remaining = self.entries.len(), "evicted idle handles");
        }
        drop(evicted);
        count
    }

    pub(crate) fn drain(&self) -> usize {
        let names: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        let drained: Vec<_> = names
            .iter()
            .filter_map(|name| self.entries.remove(name))
            .collect();
        self.discarded
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn handles_opened(&self) -> u64 {
        self.opened.load(Ordering::Relaxed)
    }

    pub(crate) fn handles_discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    pub(crate) fn snapshot(&self) -> CacheSnapshot {
        let (open, idle) = self.entries.iter().fold((0u64, 0u64), |(open, idle), e| {
            (
                open + u64::from(e.value().handle.open_connections()),
                idle + u64::from(e.value().handle.idle_connections()),
            )
        });
        CacheSnapshot {
            mode: self.mode,
            entries: self.entries.len(),
            handles_opened: self.handles_opened(),
            handles_discarded: self.handles_discarded(),
            open_connections: open,
            idle_connections: idle,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::engine::open_pool;

    fn handle(dir: &std::path::Path, name: &str) -> anyhow::Result<SqliteHandle> {
        let config = DatabaseConfig::new(name, dir.join(format!("{name}.db")));
        let pool = open_pool(&config, AccessMode::ReadWrite, Vec::new())?;
        Ok(SqliteHandle::new(name.to_string(), AccessMode::ReadWrite, pool))
    }

    #[test]
    fn losing_racer_reuses_the_winner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ConnectionCache::new(AccessMode::ReadWrite);
        let first = cache.insert_or_reuse("db", handle(dir.path(), "db")?);
        let second = cache.insert_or_reuse("db", handle(dir.path(), "db")?);
        assert_eq!(first.id(), second.id());
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.handles_opened(), 2);
        assert_eq!(cache.handles_discarded(), 1);
        Ok(())
    }

    #[test]
    fn eviction_only_removes_idle_entries() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ConnectionCache::new(AccessMode::ReadWrite);
        cache.insert_or_reuse("old", handle(dir.path(), "old")?);
        let later = cache.now_ms() + 120_000;
        cache.insert_or_reuse("fresh", handle(dir.path(), "fresh")?);
        cache.get_at("fresh", later);

        assert_eq!(cache.evict_idle_at(Duration::from_secs(60), later), 1);
        assert!(cache.get("old").is_none());
        assert!(cache.get("fresh").is_some());
        Ok(())
    }

    #[test]
    fn touch_is_debounced() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ConnectionCache::new(AccessMode::ReadWrite);
        cache.insert_or_reuse("db", handle(dir.path(), "db")?);
        let start = cache.now_ms();
        // within the debounce window the timestamp is left alone
        cache.get_at("db", start + 500);
        assert_eq!(cache.evict_idle_at(Duration::from_millis(400), start + 500), 1);

        cache.insert_or_reuse("db", handle(dir.path(), "db")?);
        let start = cache.now_ms();
        cache.get_at("db", start + 5_000);
        assert_eq!(cache.evict_idle_at(Duration::from_secs(1), start + 5_000), 0);
        Ok(())
    }

    #[test]
    fn invalidate_and_drain_empty_the_cache() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let cache = ConnectionCache::new(AccessMode::ReadWrite);
        cache.insert_or_reuse("a", handle(dir.path(), "a")?);
        cache.insert_or_reuse("b", handle(dir.path(), "b")?);
        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.drain(), 1);
        assert_eq!(cache.len(), 0);
        Ok(())
    }
}
