//! Persisted database registry.
//!
//! The manager reads the store once at startup and writes the full list of
//! configs back after every successful registry mutation.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::ServerError;

pub trait MetadataStore: Send + Sync {
    fn load(&self) -> Result<Vec<DatabaseConfig>, ServerError>;
    fn save(&self, databases: &[DatabaseConfig]) -> Result<(), ServerError>;
}

/// Keeps nothing; used when no metadata path is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetadataStore;

impl MetadataStore for NoopMetadataStore {
    fn load(&self) -> Result<Vec<DatabaseConfig>, ServerError> {
        Ok(Vec::new())
    }

    fn save(&self, _databases: &[DatabaseConfig]) -> Result<(), ServerError> {
        Ok(())
    }
}

const FORMAT_VERSION: u32 = 1;

#[derive(Serialize, Deserialize)]
struct StoredRegistry {
    version: u32,
    databases: Vec<DatabaseConfig>,
}

/// JSON document on local disk, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "metadata.json".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

fn io_failure(action: &str, path: &Path, err: impl std::fmt::Display) -> ServerError {
    ServerError::ResourceFailure(format!(
        "failed to {action} metadata at {}: {err}",
        path.display()
    ))
}

impl MetadataStore for JsonFileStore {
    fn load(&self) -> Result<Vec<DatabaseConfig>, ServerError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no metadata file yet");
                return Ok(Vec::new());
            }
            Err(err) => return Err(io_failure("read", &self.path, err)),
        };
        let stored: StoredRegistry =
            serde_json::from_slice(&raw).map_err(|err| io_failure("parse", &self.path, err))?;
        if stored.version != FORMAT_VERSION {
            return Err(ServerError::InvalidConfig(format!(
                "unsupported metadata version {} in {}",
                stored.version,
                self.path.display()
            )));
        }
        info!(
            path = %self.path.display(),
            databases = stored.databases.len(),
            "loaded metadata"
        );
        Ok(stored.databases)
    }

    fn save(&self, databases: &[DatabaseConfig]) -> Result<(), ServerError> {
        let doc = StoredRegistry {
            version: FORMAT_VERSION,
            databases: databases.to_vec(),
        };
        let body = serde_json::to_vec_pretty(&doc)
            .map_err(|err| io_failure("encode", &self.path, err))?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|err| io_failure("create", parent, err))?;
        }
        let tmp = self.temp_path();
        let mut file = fs::File::create(&tmp).map_err(|err| io_failure("write", &tmp, err))?;
        file.write_all(&body)
            .and_then(|_| file.sync_all())
            .map_err(|err| io_failure("write", &tmp, err))?;
        fs::rename(&tmp, &self.path).map_err(|err| io_failure("replace", &self.path, err))?;
        debug!(path = %self.path.display(), databases = databases.len(), "saved metadata");
        Ok(())
    }
}
