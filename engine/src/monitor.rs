//! Filesystem change monitor.
//!
//! A [`Monitor`] owns one recursive watch per tracked source path and a forwarding task.
//! The task collects event paths for one latency window, matches them against the sources it
//! was started with, and sends the ids that need a refresh down a channel. It never touches
//! the registry, so it can be stopped while the engine lock is held.

use notify::event::EventKind;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher, recommended_watcher};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use vaultkeep_core::{BackupFileId, BackupList, Error, Result, normalize_path};

/// A source path that should trigger a refresh of `id` when anything below it changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchTarget {
    pub id: BackupFileId,
    pub source: PathBuf,
}

/// Sources of every unencrypted entry in id order. Encrypted entries need a passphrase to
/// refresh and are never watched.
pub fn watch_targets(list: &BackupList) -> Vec<WatchTarget> {
    list.values()
        .filter(|file| !file.is_encrypted)
        .map(|file| WatchTarget {
            id: file.id,
            source: normalize_path(&file.source_path),
        })
        .collect()
}

/// Ids to refresh for a batch of event paths. A source path is considered once, for the
/// first target that names it.
pub fn match_events(targets: &[WatchTarget], events: &[PathBuf]) -> Vec<BackupFileId> {
    let events: Vec<PathBuf> = events.iter().map(|p| normalize_path(p)).collect();
    let mut seen: HashSet<&Path> = HashSet::new();
    let mut ids = Vec::new();

    for target in targets {
        if !seen.insert(target.source.as_path()) {
            continue;
        }
        if events.iter().any(|event| event.starts_with(&target.source)) {
            ids.push(target.id);
        }
    }
    ids
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
    )
}

pub struct Monitor {
    watcher: RecommendedWatcher,
    stop: Option<oneshot::Sender<()>>,
    worker: Option<JoinHandle<()>>,
    watched: usize,
}

impl Monitor {
    /// Starts watching the sources of `list`. Returns `None` when there is nothing to watch.
    pub fn start(
        list: &BackupList,
        latency: Duration,
        refresh: mpsc::UnboundedSender<BackupFileId>,
    ) -> Result<Option<Self>> {
        let targets = watch_targets(list);
        if targets.is_empty() {
            debug!("no unencrypted backups, monitor not started");
            return Ok(None);
        }

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let _ = event_tx.send(event);
            }
            Err(e) => warn!(error = %e, "watch error"),
        })
        .map_err(|e| Error::Monitor(e.to_string()))?;

        let mut watched = 0;
        let sources: BTreeSet<&Path> = targets.iter().map(|t| t.source.as_path()).collect();
        for source in sources {
            match watcher.watch(source, RecursiveMode::Recursive) {
                Ok(()) => watched += 1,
                Err(e) => warn!(path = %source.display(), error = %e, "cannot watch, skipping"),
            }
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        let worker = tokio::spawn(forward(targets, latency, event_rx, stop_rx, refresh));

        info!(paths = watched, latency_ms = latency.as_millis() as u64, "monitor started");
        Ok(Some(Self {
            watcher,
            stop: Some(stop_tx),
            worker: Some(worker),
            watched,
        }))
    }

    pub fn watched(&self) -> usize {
        self.watched
    }

    /// Drops the watch and waits for the forwarding task to finish.
    pub async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(worker) = self.worker.take() {
            if let Err(e) = worker.await {
                warn!(error = %e, "monitor worker ended abnormally");
            }
        }
        drop(self.watcher);
        debug!("monitor stopped");
    }
}

async fn forward(
    targets: Vec<WatchTarget>,
    latency: Duration,
    mut events: mpsc::UnboundedReceiver<Event>,
    mut stop: oneshot::Receiver<()>,
    refresh: mpsc::UnboundedSender<BackupFileId>,
) {
    loop {
        // Wait for the first event of a batch.
        let first = tokio::select! {
            _ = &mut stop => return,
            event = events.recv() => match event {
                Some(event) => event,
                None => return,
            },
        };

        let mut batch = Vec::new();
        if is_relevant(&first.kind) {
            batch.extend(first.paths);
        }

        let window = tokio::time::sleep(latency);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut stop => return,
                _ = &mut window => break,
                event = events.recv() => match event {
                    Some(event) if is_relevant(&event.kind) => batch.extend(event.paths),
                    Some(_) => {}
                    None => break,
                },
            }
        }

        if batch.is_empty() {
            continue;
        }
        for id in match_events(&targets, &batch) {
            debug!(id, "change detected");
            if refresh.send(id).is_err() {
                return;
            }
        }
    }
}
