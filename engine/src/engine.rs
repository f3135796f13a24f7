use crate::monitor::Monitor;
use crate::pipeline;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vaultkeep_backends::{Backend, LocalBackend, ObjectInfo};
use vaultkeep_core::{
    BackupFile, BackupFileId, Config, Error, Result, absolute_path, now_millis,
};

/// Policy flags for a new backup. They are fixed for the lifetime of the entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackupOptions {
    pub compress: bool,
    pub encrypt: bool,
    pub cloud: bool,
}

impl BackupOptions {
    pub fn compressed(mut self) -> Self {
        self.compress = true;
        self
    }

    pub fn encrypted(mut self) -> Self {
        self.encrypt = true;
        self
    }

    pub fn in_cloud(mut self) -> Self {
        self.cloud = true;
        self
    }
}

/// The backup orchestrator.
///
/// Cloning is cheap; all clones share one registry. Every public operation holds the registry
/// lock from its first read to its last write, so front-end calls and refreshes requested by
/// the change monitor are applied one at a time.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

struct Inner {
    config_path: PathBuf,
    state: Mutex<State>,
    refresh_tx: mpsc::UnboundedSender<BackupFileId>,
}

struct State {
    config: Config,
    local: Arc<dyn Backend>,
    cloud: Arc<dyn Backend>,
    monitor: Option<Monitor>,
    refresher: Option<JoinHandle<()>>,
    /// Watch sources for this session even when auto-update is off in the config.
    monitor_forced: bool,
    shut_down: bool,
}

impl State {
    fn backend(&self, cloud: bool) -> Arc<dyn Backend> {
        if cloud {
            self.cloud.clone()
        } else {
            self.local.clone()
        }
    }

    fn wants_monitor(&self) -> bool {
        !self.shut_down && (self.config.enable_auto_update || self.monitor_forced)
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

impl Engine {
    /// Loads the config document at `path` and starts the change monitor when auto-update is
    /// enabled. Any load error is returned and no engine is built.
    pub async fn load_from_config<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config_path = absolute_path(path.as_ref())?;
        let config = {
            let path = config_path.clone();
            blocking(move || Config::load(&path)).await?
        };

        let local: Arc<dyn Backend> = Arc::new(LocalBackend::new(&config.backup_dir));
        let cloud: Arc<dyn Backend> = Arc::new(LocalBackend::cloud_mount(&config.cloud_mount_path));
        local.init().await?;

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config_path,
            state: Mutex::new(State {
                config,
                local,
                cloud,
                monitor: None,
                refresher: None,
                monitor_forced: false,
                shut_down: false,
            }),
            refresh_tx,
        });

        let refresher = tokio::spawn(refresh_loop(Arc::downgrade(&inner), refresh_rx));
        let engine = Engine { inner };
        {
            let mut state = engine.inner.state.lock().await;
            state.refresher = Some(refresher);
            engine.restart_monitor(&mut state).await;
            info!(
                config = %engine.inner.config_path.display(),
                backups = state.config.backup_list.len(),
                auto_update = state.config.enable_auto_update,
                "engine loaded"
            );
        }
        Ok(engine)
    }

    pub fn config_path(&self) -> &Path {
        &self.inner.config_path
    }

    /// Backs up `source` under a freshly allocated id and returns the committed entry.
    pub async fn backup<P: AsRef<Path>>(
        &self,
        source: P,
        options: BackupOptions,
        key: &str,
    ) -> Result<BackupFile> {
        if options.encrypt && key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let source = absolute_path(source.as_ref())?;
        if std::fs::symlink_metadata(&source).is_err() {
            return Err(Error::not_found(source.display()));
        }
        let filename = source
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .ok_or_else(|| Error::UnsupportedType {
                path: source.display().to_string(),
            })?;

        let mut state = self.inner.state.lock().await;
        let backend = state.backend(options.cloud);
        backend.init().await?;

        let id = state.config.next_id;
        let artifact_path = backend.artifact_path(&format!("{id}{filename}"));
        if backend.exists(&artifact_path).await? {
            return Err(Error::Conflict {
                path: artifact_path.display().to_string(),
            });
        }

        let file = BackupFile {
            id: state.config.allocate_id(),
            filename,
            source_path: source,
            artifact_path,
            timestamp: now_millis(),
            is_compressed: options.compress,
            is_encrypted: options.encrypt,
            is_in_cloud: options.cloud,
        };
        state.config.backup_list.insert(id, file.clone());
        debug!(id, source = %file.source_path.display(), "provisional entry");

        let committed = match build_and_store(backend.as_ref(), &file, key).await {
            Ok(()) => self.persist(&state.config).await,
            Err(e) => Err(e),
        };

        if let Err(e) = committed {
            state.config.backup_list.remove(&id);
            state.config.next_id = id;
            match backend.delete(&file.artifact_path).await {
                Ok(()) | Err(Error::NotFound { .. }) => {}
                Err(cleanup) => warn!(
                    id,
                    path = %file.artifact_path.display(),
                    error = %cleanup,
                    "could not remove artifact of failed backup"
                ),
            }
            warn!(id, error = %e, "backup rolled back");
            return Err(e);
        }

        info!(
            id,
            source = %file.source_path.display(),
            artifact = %file.artifact_path.display(),
            flags = %file.flags(),
            "backup created"
        );
        self.restart_monitor(&mut state).await;
        Ok(file)
    }

    /// Rebuilds the artifact of `id` from its source and bumps its timestamp.
    pub async fn update(&self, id: BackupFileId, key: &str) -> Result<BackupFile> {
        let mut state = self.inner.state.lock().await;
        let file = state.config.get(id)?.clone();
        if file.is_encrypted && key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let backend = state.backend(file.is_in_cloud);
        build_and_store(backend.as_ref(), &file, key).await?;

        let previous = file.timestamp;
        let timestamp = now_millis().max(previous + 1);
        state.config.get_mut(id)?.timestamp = timestamp;
        if let Err(e) = self.persist(&state.config).await {
            state.config.get_mut(id)?.timestamp = previous;
            return Err(e);
        }

        info!(id, timestamp, "backup updated");
        let updated = state.config.get(id)?.clone();
        self.restart_monitor(&mut state).await;
        Ok(updated)
    }

    /// Deletes the artifact and the entry of `id`. A missing artifact only logs a warning.
    pub async fn remove(&self, id: BackupFileId) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        let file = state.config.get(id)?.clone();

        let backend = state.backend(file.is_in_cloud);
        match backend.delete(&file.artifact_path).await {
            Ok(()) => {}
            Err(Error::NotFound { .. }) => {
                warn!(id, path = %file.artifact_path.display(), "artifact already missing");
            }
            Err(e) => return Err(e),
        }

        // The artifact is gone, so the entry stays erased in memory even if persisting fails.
        state.config.backup_list.remove(&id);
        self.persist(&state.config).await?;

        info!(id, filename = %file.filename, "backup removed");
        self.restart_monitor(&mut state).await;
        Ok(())
    }

    /// Restores `id` as `restore_dir/<filename>`.
    pub async fn restore<P: AsRef<Path>>(
        &self,
        id: BackupFileId,
        restore_dir: P,
        key: &str,
    ) -> Result<()> {
        let restore_dir = restore_dir.as_ref().to_path_buf();
        let state = self.inner.state.lock().await;
        let file = state.config.get(id)?.clone();

        let backend = state.backend(file.is_in_cloud);
        if !backend.exists(&file.artifact_path).await? {
            return Err(Error::not_found(file.artifact_path.display()));
        }

        match std::fs::metadata(&restore_dir) {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("not a directory: {}", restore_dir.display()),
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(restore_dir.display()));
            }
            Err(e) => return Err(e.into()),
        }

        let target = restore_dir.join(&file.filename);
        if std::fs::symlink_metadata(&target).is_ok() {
            return Err(Error::Conflict {
                path: target.display().to_string(),
            });
        }
        if file.is_encrypted && key.is_empty() {
            return Err(Error::EmptyKey);
        }

        let key = key.to_string();
        let job = file.clone();
        let dir = restore_dir.clone();
        blocking(move || {
            pipeline::reverse(
                &job.artifact_path,
                job.is_compressed,
                job.is_encrypted,
                &key,
                &dir,
                &job.filename,
            )
        })
        .await?;

        info!(id, target = %target.display(), "backup restored");
        Ok(())
    }

    pub async fn get_backup_file(&self, id: BackupFileId) -> Option<BackupFile> {
        self.inner.state.lock().await.config.backup_list.get(&id).cloned()
    }

    /// All entries, ordered by id.
    pub async fn list_backup_files(&self) -> Vec<BackupFile> {
        self.inner
            .state
            .lock()
            .await
            .config
            .backup_list
            .values()
            .cloned()
            .collect()
    }

    /// Size and modification time of the artifact of `id`.
    pub async fn artifact_info(&self, id: BackupFileId) -> Result<ObjectInfo> {
        let state = self.inner.state.lock().await;
        let file = state.config.get(id)?;
        state.backend(file.is_in_cloud).stat(&file.artifact_path).await
    }

    /// Watches sources for this session regardless of the auto-update setting.
    pub async fn start_monitor(&self) {
        let mut state = self.inner.state.lock().await;
        state.monitor_forced = true;
        self.restart_monitor(&mut state).await;
    }

    /// Number of paths currently watched; zero when the monitor is not running.
    pub async fn watched_paths(&self) -> usize {
        let state = self.inner.state.lock().await;
        state.monitor.as_ref().map_or(0, Monitor::watched)
    }

    /// Stops the monitor and the refresh task. Operations still work afterwards, but no
    /// further automatic refreshes happen.
    pub async fn shutdown(&self) {
        let mut state = self.inner.state.lock().await;
        state.shut_down = true;
        if let Some(monitor) = state.monitor.take() {
            monitor.stop().await;
        }
        if let Some(refresher) = state.refresher.take() {
            refresher.abort();
        }
        debug!("engine shut down");
    }

    async fn persist(&self, config: &Config) -> Result<()> {
        let config = config.clone();
        let path = self.inner.config_path.clone();
        blocking(move || config.save(&path)).await
    }

    async fn restart_monitor(&self, state: &mut State) {
        if let Some(monitor) = state.monitor.take() {
            monitor.stop().await;
        }
        if !state.wants_monitor() {
            return;
        }

        let latency = Duration::from_millis(state.config.monitor_latency_ms);
        match Monitor::start(&state.config.backup_list, latency, self.inner.refresh_tx.clone()) {
            Ok(monitor) => state.monitor = monitor,
            Err(e) => warn!(error = %e, "could not start change monitor"),
        }
    }
}

/// Runs the forward pipeline off the async runtime and hands the result to `backend`.
async fn build_and_store(backend: &dyn Backend, file: &BackupFile, key: &str) -> Result<()> {
    let source = file.source_path.clone();
    let (compress, encrypt) = (file.is_compressed, file.is_encrypted);
    let key = key.to_string();

    let staged = blocking(move || pipeline::forward(&source, compress, encrypt, &key)).await?;
    backend.store(staged.path(), &file.artifact_path).await
}

async fn refresh_loop(inner: Weak<Inner>, mut requests: mpsc::UnboundedReceiver<BackupFileId>) {
    while let Some(id) = requests.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        let engine = Engine { inner };
        match engine.update(id, "").await {
            Ok(file) => info!(id, filename = %file.filename, "refreshed after change"),
            Err(e) => error!(id, error = %e, "automatic refresh failed"),
        }
    }
    debug!("refresher stopped");
}
