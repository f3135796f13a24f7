use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};
use vaultkeep_core::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendType {
    Local,
    CloudMount,
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendType::Local => write!(f, "local"),
            BackendType::CloudMount => write!(f, "cloud"),
        }
    }
}

/// Destination for finished artifacts.
///
/// An artifact is either a single file or a directory tree. `store` must leave `dest`
/// untouched when it fails and replace it as a whole when it succeeds.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn init(&self) -> Result<()>;

    /// Location of the artifact named `name` inside this backend.
    fn artifact_path(&self, name: &str) -> PathBuf;

    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Copies `staged` (file or directory) over `dest`.
    async fn store(&self, staged: &Path, dest: &Path) -> Result<()>;

    /// Deletes an artifact. `NotFound` if there is nothing at `path`.
    async fn delete(&self, path: &Path) -> Result<()>;

    async fn stat(&self, path: &Path) -> Result<ObjectInfo>;

    fn backend_type(&self) -> BackendType;
}

#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub path: PathBuf,
    /// Total bytes; for a directory, the sum of its regular files.
    pub size: u64,
    pub modified: chrono::DateTime<chrono::Utc>,
    pub is_dir: bool,
}
