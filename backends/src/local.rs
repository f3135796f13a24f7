use crate::backend::{Backend, BackendType, ObjectInfo};
use crate::retry::{RetryConfig, retry_with_backoff};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use vaultkeep_core::{Error, Result};
use walkdir::WalkDir;

/// Artifacts kept in a directory on a locally visible filesystem.
///
/// The cloud variant is the same directory logic pointed at a mounted remote share, with
/// every operation retried with backoff.
pub struct LocalBackend {
    base_path: PathBuf,
    retry: Option<RetryConfig>,
}

impl LocalBackend {
    pub fn new<P: AsRef<Path>>(base_path: P) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
            retry: None,
        }
    }

    pub fn cloud_mount<P: AsRef<Path>>(mount_path: P) -> Self {
        Self::cloud_mount_with_retry(mount_path, RetryConfig::mount())
    }

    pub fn cloud_mount_with_retry<P: AsRef<Path>>(mount_path: P, retry: RetryConfig) -> Self {
        Self {
            base_path: mount_path.as_ref().to_path_buf(),
            retry: Some(retry),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    async fn run<T, F>(&self, operation_name: &str, op: F) -> Result<T>
    where
        F: Fn() -> Result<T> + Clone + Send + Sync + 'static,
        T: Send + 'static,
    {
        match &self.retry {
            Some(config) => retry_with_backoff(config, operation_name, || blocking(op.clone())).await,
            None => blocking(op).await,
        }
    }
}

async fn blocking<T, F>(op: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(op)
        .await
        .map_err(|e| Error::Task(e.to_string()))?
}

#[async_trait]
impl Backend for LocalBackend {
    async fn init(&self) -> Result<()> {
        if self.base_path.as_os_str().is_empty() {
            return Err(Error::Backend("artifact directory is not configured".to_string()));
        }
        let base = self.base_path.clone();
        self.run("init", move || Ok(fs::create_dir_all(&base)?)).await
    }

    fn artifact_path(&self, name: &str) -> PathBuf {
        self.base_path.join(name)
    }

    async fn exists(&self, path: &Path) -> Result<bool> {
        let path = path.to_path_buf();
        self.run("exists", move || match fs::symlink_metadata(&path) {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        })
        .await
    }

    async fn store(&self, staged: &Path, dest: &Path) -> Result<()> {
        let (staged, dest) = (staged.to_path_buf(), dest.to_path_buf());
        self.run("store", move || place(&staged, &dest)).await
    }

    async fn delete(&self, path: &Path) -> Result<()> {
        let path = path.to_path_buf();
        self.run("delete", move || {
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(Error::not_found(path.display()));
                }
                Err(e) => return Err(e.into()),
            };
            if meta.is_dir() {
                fs::remove_dir_all(&path)?;
            } else {
                fs::remove_file(&path)?;
            }
            debug!(path = %path.display(), "deleted artifact");
            Ok(())
        })
        .await
    }

    async fn stat(&self, path: &Path) -> Result<ObjectInfo> {
        let path = path.to_path_buf();
        self.run("stat", move || {
            let meta = fs::metadata(&path).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => Error::not_found(path.display()),
                _ => Error::Io(e),
            })?;
            let modified: DateTime<Utc> = meta.modified()?.into();

            let size = if meta.is_dir() {
                let mut total = 0;
                for entry in WalkDir::new(&path) {
                    let entry = entry.map_err(io::Error::from)?;
                    if entry.file_type().is_file() {
                        total += entry.metadata().map_err(io::Error::from)?.len();
                    }
                }
                total
            } else {
                meta.len()
            };

            Ok(ObjectInfo {
                path: path.clone(),
                size,
                modified,
                is_dir: meta.is_dir(),
            })
        })
        .await
    }

    fn backend_type(&self) -> BackendType {
        if self.retry.is_some() {
            BackendType::CloudMount
        } else {
            BackendType::Local
        }
    }
}

/// Copies `staged` into a temp sibling of `dest` and renames it into place, so `dest` is
/// either the old artifact or the complete new one.
fn place(staged: &Path, dest: &Path) -> Result<()> {
    let parent = dest
        .parent()
        .ok_or_else(|| Error::Backend(format!("artifact path has no parent: {}", dest.display())))?;
    fs::create_dir_all(parent)?;

    let staged_meta = fs::symlink_metadata(staged).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => Error::not_found(staged.display()),
        _ => Error::Io(e),
    })?;

    if staged_meta.is_dir() {
        let temp = tempfile::Builder::new()
            .prefix(".vaultkeep-stage-")
            .tempdir_in(parent)?;
        copy_tree(staged, temp.path())?;
        replace_dir(temp.path(), dest)?;
    } else if staged_meta.is_file() {
        let mut temp = tempfile::Builder::new()
            .prefix(".vaultkeep-stage-")
            .tempfile_in(parent)?;
        io::copy(&mut BufReader::new(File::open(staged)?), temp.as_file_mut())?;
        temp.as_file().set_permissions(staged_meta.permissions())?;
        temp.as_file().sync_all()?;
        if dest.is_dir() {
            fs::remove_dir_all(dest)?;
        }
        temp.persist(dest).map_err(|e| Error::Io(e.error))?;
    } else {
        return Err(Error::UnsupportedType {
            path: staged.display().to_string(),
        });
    }

    debug!(staged = %staged.display(), dest = %dest.display(), "stored artifact");
    Ok(())
}

/// Renames the directory `ready` over `dest`, parking an existing `dest` aside until the
/// rename has succeeded.
fn replace_dir(ready: &Path, dest: &Path) -> Result<()> {
    let existing = match fs::symlink_metadata(dest) {
        Ok(meta) => Some(meta),
        Err(e) if e.kind() == io::ErrorKind::NotFound => None,
        Err(e) => return Err(e.into()),
    };

    let Some(existing) = existing else {
        fs::rename(ready, dest)?;
        return Ok(());
    };

    let mut parked = dest.as_os_str().to_owned();
    parked.push(format!(".old-{}", std::process::id()));
    let parked = PathBuf::from(parked);
    fs::rename(dest, &parked)?;

    if let Err(e) = fs::rename(ready, dest) {
        if let Err(restore) = fs::rename(&parked, dest) {
            warn!(path = %dest.display(), error = %restore, "could not restore previous artifact");
        }
        return Err(e.into());
    }

    let removed = if existing.is_dir() {
        fs::remove_dir_all(&parked)
    } else {
        fs::remove_file(&parked)
    };
    if let Err(e) = removed {
        warn!(path = %parked.display(), error = %e, "could not remove previous artifact");
    }
    Ok(())
}

/// Copies a file, or mirrors a directory tree, from `src` to `dst`. Permission bits are
/// carried over; directory permissions are applied after their contents are written.
/// Symlinks and special files are refused.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    let mut directories = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(io::Error::from)?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| Error::Backend(e.to_string()))?;
        let target = if rel.as_os_str().is_empty() {
            dst.to_path_buf()
        } else {
            dst.join(rel)
        };
        let meta = entry.metadata().map_err(io::Error::from)?;

        if meta.is_dir() {
            fs::create_dir_all(&target)?;
            directories.push((target, meta.permissions()));
        } else if meta.is_file() {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        } else {
            return Err(Error::UnsupportedType {
                path: entry.path().display().to_string(),
            });
        }
    }

    for (path, permissions) in directories.into_iter().rev() {
        fs::set_permissions(&path, permissions)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    fn tree(root: &Path) -> PathBuf {
        let src = root.join("photos");
        fs::create_dir_all(src.join("2024/summer")).unwrap();
        fs::write(src.join("index.txt"), b"album index").unwrap();
        fs::write(src.join("2024/summer/beach.raw"), vec![9u8; 70_000]).unwrap();
        fs::write(src.join("2024/empty"), b"").unwrap();
        src
    }

    fn read_tree(root: &Path) -> Vec<(String, Vec<u8>)> {
        let mut files = Vec::new();
        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.unwrap();
            if entry.file_type().is_file() {
                let rel = entry.path().strip_prefix(root).unwrap().display().to_string();
                files.push((rel, fs::read(entry.path()).unwrap()));
            }
        }
        files
    }

    #[tokio::test]
    async fn test_store_file_and_replace() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path().join("store"));
        backend.init().await.unwrap();

        let staged = dir.path().join("staged");
        fs::write(&staged, b"first").unwrap();
        let dest = backend.artifact_path("1notes.txt");
        assert!(!backend.exists(&dest).await.unwrap());

        backend.store(&staged, &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"first");

        fs::write(&staged, b"second, longer").unwrap();
        backend.store(&staged, &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"second, longer");

        let info = backend.stat(&dest).await.unwrap();
        assert_eq!(info.size, 14);
        assert!(!info.is_dir);

        // No temp siblings left behind.
        let names: Vec<_> = fs::read_dir(backend.base_path()).unwrap().collect();
        assert_eq!(names.len(), 1);
    }

    #[tokio::test]
    async fn test_store_directory_and_replace() {
        let dir = TempDir::new().unwrap();
        let src = tree(dir.path());
        let backend = LocalBackend::new(dir.path().join("store"));
        backend.init().await.unwrap();

        let dest = backend.artifact_path("2photos");
        backend.store(&src, &dest).await.unwrap();
        assert_eq!(read_tree(&dest), read_tree(&src));

        fs::remove_file(src.join("index.txt")).unwrap();
        fs::write(src.join("2024/new.txt"), b"fresh").unwrap();
        backend.store(&src, &dest).await.unwrap();
        assert_eq!(read_tree(&dest), read_tree(&src));

        let info = backend.stat(&dest).await.unwrap();
        assert!(info.is_dir);
        assert_eq!(info.size, 70_005);
        assert_eq!(fs::read_dir(backend.base_path()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let src = tree(dir.path());
        let backend = LocalBackend::new(dir.path().join("store"));
        backend.init().await.unwrap();

        let dest = backend.artifact_path("3photos");
        backend.store(&src, &dest).await.unwrap();
        backend.delete(&dest).await.unwrap();
        assert!(!dest.exists());

        let err = backend.delete(&dest).await.unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_store_missing_staged() {
        let dir = TempDir::new().unwrap();
        let backend = LocalBackend::new(dir.path());
        let err = backend
            .store(&dir.path().join("absent"), &dir.path().join("dest"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert!(!dir.path().join("dest").exists());
    }

    #[tokio::test]
    async fn test_cloud_mount() {
        let dir = TempDir::new().unwrap();
        let retry = RetryConfig {
            max_attempts: 2,
            initial_backoff: Duration::from_millis(1),
            ..RetryConfig::mount()
        };
        let backend = LocalBackend::cloud_mount_with_retry(dir.path().join("mnt"), retry);
        assert_eq!(backend.backend_type(), BackendType::CloudMount);
        backend.init().await.unwrap();

        let staged = dir.path().join("report.pdf");
        fs::write(&staged, b"%PDF").unwrap();
        let dest = backend.artifact_path("4report.pdf");
        backend.store(&staged, &dest).await.unwrap();
        assert_eq!(fs::read(&dest).unwrap(), b"%PDF");

        assert!(LocalBackend::cloud_mount("").init().await.is_err());
    }

    #[test]
    fn test_copy_tree_single_file() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, b"alpha").unwrap();
        copy_tree(&src, &dir.path().join("b.txt")).unwrap();
        assert_eq!(fs::read(dir.path().join("b.txt")).unwrap(), b"alpha");
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_keeps_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let src = tree(dir.path());
        fs::set_permissions(src.join("index.txt"), fs::Permissions::from_mode(0o600)).unwrap();
        fs::set_permissions(src.join("2024/summer"), fs::Permissions::from_mode(0o555)).unwrap();

        let dst = dir.path().join("copy");
        copy_tree(&src, &dst).unwrap();

        let mode = |p: PathBuf| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(dst.join("index.txt")), 0o600);
        assert_eq!(mode(dst.join("2024/summer")), 0o555);
        assert_eq!(read_tree(&dst), read_tree(&src));

        for root in [&src, &dst] {
            fs::set_permissions(root.join("2024/summer"), fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_copy_tree_refuses_symlinks() {
        let dir = TempDir::new().unwrap();
        let src = tree(dir.path());
        std::os::unix::fs::symlink(src.join("index.txt"), src.join("link")).unwrap();
        let err = copy_tree(&src, &dir.path().join("copy")).unwrap_err();
        assert!(matches!(err, Error::UnsupportedType { .. }));
    }
}
