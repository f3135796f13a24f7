//! Engine configuration document.
//!
//! The document is a single JSON file holding the registry of backups alongside the engine
//! settings:
//!
//! ```json
//! {
//!     "next_id": 3,
//!     "backup_list": [ { "id": 1, "filename": "docs", ... } ],
//!     "backup_dir": "/var/backups/vaultkeep",
//!     "cloud_mount_path": "/mnt/cloud/vaultkeep",
//!     "enable_auto_update": true
//! }
//! ```

use crate::types::{BackupFile, BackupFileId, BackupList, normalize_path};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const DEFAULT_MONITOR_LATENCY_MS: u64 = 1000;

fn default_monitor_latency_ms() -> u64 {
    DEFAULT_MONITOR_LATENCY_MS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub next_id: BackupFileId,
    #[serde(with = "backup_list_format")]
    pub backup_list: BackupList,
    pub backup_dir: PathBuf,
    pub cloud_mount_path: PathBuf,
    pub enable_auto_update: bool,
    #[serde(default = "default_monitor_latency_ms")]
    pub monitor_latency_ms: u64,
}

impl Config {
    pub fn new<P: Into<PathBuf>, Q: Into<PathBuf>>(backup_dir: P, cloud_mount_path: Q) -> Self {
        Self {
            next_id: 1,
            backup_list: BackupList::new(),
            backup_dir: backup_dir.into(),
            cloud_mount_path: cloud_mount_path.into(),
            enable_auto_update: false,
            monitor_latency_ms: DEFAULT_MONITOR_LATENCY_MS,
        }
    }

    pub fn with_auto_update(mut self, enabled: bool) -> Self {
        self.enable_auto_update = enabled;
        self
    }

    /// Parses and validates the document at `path`. Directory settings are lexically
    /// normalized and the backup directory is created if it does not exist.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                Error::not_found(format!("config file {}", path.display()))
            }
            _ => Error::Io(e),
        })?;

        let mut config: Config = serde_json::from_str(&data)?;
        config.backup_dir = normalize_path(&config.backup_dir);
        if !config.cloud_mount_path.as_os_str().is_empty() {
            config.cloud_mount_path = normalize_path(&config.cloud_mount_path);
        }

        if let Some(max_id) = config.backup_list.keys().next_back().copied() {
            if config.next_id <= max_id {
                warn!(
                    next_id = config.next_id,
                    max_id, "next_id does not exceed the largest backup id, raising it"
                );
                config.next_id = max_id + 1;
            }
        }

        fs::create_dir_all(&config.backup_dir)?;
        if !config.backup_dir.is_dir() {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("backup_dir is not a directory: {}", config.backup_dir.display()),
            )));
        }

        debug!(
            path = %path.display(),
            backups = config.backup_list.len(),
            "loaded config"
        );
        Ok(config)
    }

    /// Writes the document atomically: a temp file in the same directory is fsynced and
    /// renamed over `path`.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let json = serde_json::to_string_pretty(self)?;
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        // The temp file is created 0600; keep whatever mode the existing document has.
        if let Some(existing) = fs::metadata(path).ok().filter(|m| m.is_file()) {
            temp.as_file().set_permissions(existing.permissions())?;
        }
        temp.write_all(json.as_bytes())?;
        temp.as_file().sync_all()?;
        temp.persist(path).map_err(|e| Error::Io(e.error))?;

        debug!(path = %path.display(), "saved config");
        Ok(())
    }

    /// Hands out the next id. Ids are never reused.
    pub fn allocate_id(&mut self) -> BackupFileId {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    pub fn get(&self, id: BackupFileId) -> Result<&BackupFile> {
        self.backup_list.get(&id).ok_or(Error::BackupNotFound { id })
    }

    pub fn get_mut(&mut self, id: BackupFileId) -> Result<&mut BackupFile> {
        self.backup_list.get_mut(&id).ok_or(Error::BackupNotFound { id })
    }
}

/// `backup_list` is written as an array of entries. Reading also accepts `[id, entry]` pairs
/// and an object keyed by id.
mod backup_list_format {
    use super::*;
    use serde::{Deserializer, Serializer};
    use std::collections::BTreeMap;

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Item {
        Entry(BackupFile),
        Pair(BackupFileId, BackupFile),
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        List(Vec<Item>),
        Map(BTreeMap<String, BackupFile>),
    }

    pub fn serialize<S: Serializer>(list: &BackupList, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_seq(list.values())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<BackupList, D::Error> {
        let files: Vec<BackupFile> = match Repr::deserialize(deserializer)? {
            Repr::List(items) => items
                .into_iter()
                .map(|item| match item {
                    Item::Entry(file) => Ok(file),
                    Item::Pair(id, file) if id == file.id => Ok(file),
                    Item::Pair(id, file) => Err(serde::de::Error::custom(format!(
                        "backup list key {} does not match entry id {}",
                        id, file.id
                    ))),
                })
                .collect::<std::result::Result<_, D::Error>>()?,
            Repr::Map(map) => map.into_values().collect(),
        };

        let mut list = BackupList::new();
        for file in files {
            let id = file.id;
            if list.insert(id, file).is_some() {
                return Err(serde::de::Error::custom(format!("duplicate backup id {}", id)));
            }
        }
        Ok(list)
    }
}
