//! Configuration registry - logical database name to `DatabaseConfig`.
//!
//! Reads take a cheap snapshot of the current map. Every mutation replaces the
//! map under the write lock, so readers never observe a half-applied change.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config::{validate_alias, Attachment, DatabaseConfig};
use crate::engine::ResolvedAttachment;
use crate::error::ServerError;

type ConfigMap = HashMap<String, Arc<DatabaseConfig>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachOutcome {
    Added,
    /// Same alias already pointed at the same target.
    Unchanged,
}

#[derive(Default)]
pub struct ConfigRegistry {
    inner: RwLock<Arc<ConfigMap>>,
}

impl ConfigRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn snapshot(&self) -> Arc<ConfigMap> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn mutate<T>(
        &self,
        apply: impl FnOnce(&mut ConfigMap) -> Result<T, ServerError>,
    ) -> Result<T, ServerError> {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut next = ConfigMap::clone(&guard);
        let out = apply(&mut next)?;
        *guard = Arc::new(next);
        Ok(out)
    }

    pub fn get(&self, name: &str) -> Option<Arc<DatabaseConfig>> {
        self.snapshot().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.snapshot().contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All configs, ordered by name.
    pub fn list(&self) -> Vec<DatabaseConfig> {
        let snapshot = self.snapshot();
        let mut all: Vec<DatabaseConfig> = snapshot.values().map(|c| (**c).clone()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Resolve every attachment of `config` to its target's file path.
    pub(crate) fn resolve_attachments(
        &self,
        config: &DatabaseConfig,
    ) -> Result<Vec<ResolvedAttachment>, ServerError> {
        let snapshot = self.snapshot();
        resolve_in(&snapshot, config)
    }

    #[tracing::instrument(skip(self, config), fields(database = %config.name))]
    pub fn insert(&self, config: DatabaseConfig) -> Result<(), ServerError> {
        config.validate()?;
        self.mutate(|map| {
            if map.contains_key(&config.name) {
                return Err(ServerError::Conflict(format!(
                    "database '{}' is already mounted",
                    config.name
                )));
            }
            resolve_in(map, &config)?;
            map.insert(config.name.clone(), Arc::new(config));
            Ok(())
        })?;
        info!(databases = self.len(), "database registered");
        Ok(())
    }

    /// Replace an existing config, returning the previous one.
    pub fn replace(&self, config: DatabaseConfig) -> Result<Arc<DatabaseConfig>, ServerError> {
        config.validate()?;
        self.mutate(|map| {
            let previous = map
                .get(&config.name)
                .cloned()
                .ok_or_else(|| ServerError::DatabaseNotFound(config.name.clone()))?;
            resolve_in(map, &config)?;
            map.insert(config.name.clone(), Arc::new(config));
            Ok(previous)
        })
    }

    /// Remove a config. Databases still attached by another database cannot be
    /// removed until they are detached.
    pub fn remove(&self, name: &str) -> Result<Arc<DatabaseConfig>, ServerError> {
        self.mutate(|map| {
            if !map.contains_key(name) {
                return Err(ServerError::DatabaseNotFound(name.to_string()));
            }
            if let Some(parent) = map.values().find(|c| {
                c.attachments.iter().any(|a| a.database == name)
            }) {
                return Err(ServerError::Conflict(format!(
                    "database '{name}' is attached by '{}'",
                    parent.name
                )));
            }
            map.remove(name)
                .ok_or_else(|| ServerError::DatabaseNotFound(name.to_string()))
        })
    }

    pub fn attach(&self, parent: &str, attachment: Attachment) -> Result<AttachOutcome, ServerError> {
        validate_alias(&attachment.alias)?;
        self.mutate(|map| {
            let current = map
                .get(parent)
                .cloned()
                .ok_or_else(|| ServerError::DatabaseNotFound(parent.to_string()))?;
            if !map.contains_key(&attachment.database) {
                return Err(ServerError::DatabaseNotFound(attachment.database.clone()));
            }
            if attachment.database == parent {
                return Err(ServerError::InvalidConfig(format!(
                    "database '{parent}' cannot attach itself"
                )));
            }
            if let Some(existing) = current
                .attachments
                .iter()
                .find(|a| a.alias.eq_ignore_ascii_case(&attachment.alias))
            {
                if existing.database == attachment.database {
                    return Ok(AttachOutcome::Unchanged);
                }
                return Err(ServerError::Conflict(format!(
                    "alias '{}' on '{parent}' already attaches '{}'",
                    existing.alias, existing.database
                )));
            }
            let mut updated = (*current).clone();
            updated.attachments.push(attachment);
            map.insert(parent.to_string(), Arc::new(updated));
            Ok(AttachOutcome::Added)
        })
    }

    pub fn detach(&self, parent: &str, alias: &str) -> Result<(), ServerError> {
        self.mutate(|map| {
            let current = map
                .get(parent)
                .cloned()
                .ok_or_else(|| ServerError::DatabaseNotFound(parent.to_string()))?;
            let mut updated = (*current).clone();
            let before = updated.attachments.len();
            updated
                .attachments
                .retain(|a| !a.alias.eq_ignore_ascii_case(alias));
            if updated.attachments.len() == before {
                return Err(ServerError::AttachmentNotFound {
                    database: parent.to_string(),
                    alias: alias.to_string(),
                });
            }
            map.insert(parent.to_string(), Arc::new(updated));
            debug!(database = parent, alias, "attachment removed");
            Ok(())
        })
    }
}

fn resolve_in(
    map: &ConfigMap,
    config: &DatabaseConfig,
) -> Result<Vec<ResolvedAttachment>, ServerError> {
    config
        .attachments
        .iter()
        .map(|attachment| {
            map.get(&attachment.database)
                .map(|target| ResolvedAttachment {
                    alias: attachment.alias.clone(),
                    path: target.path.clone(),
                })
                .ok_or_else(|| ServerError::DatabaseNotFound(attachment.database.clone()))
        })
        .collect()
}
