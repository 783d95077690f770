//! Directory watching.
//!
//! [`PathWatcher`] keeps one registry of watched directories keyed by path.
//! Each directory level gets its own native watch, so adding a sub-directory
//! to a watched tree means registering it explicitly; the event loop does that
//! whenever a directory appears. Files found on registration or reported by a
//! change event are offered to the [`ScanPipeline`] without forcing.

pub mod backend;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::PipelineEvent;
use crate::pipeline::ScanPipeline;

pub use backend::{
    NotifyBackend, RecordingBackend, WatchBackend, WatchEvent, WatchEventKind, WatchMessage,
    classify,
};

/// A registered directory and the parent it was recorded under.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchedDirectory {
    pub parent: Option<PathBuf>,
}

struct Registry {
    backend: Box<dyn WatchBackend>,
    directories: BTreeMap<PathBuf, WatchedDirectory>,
}

impl Registry {
    fn roots(&self) -> Vec<PathBuf> {
        self.directories
            .iter()
            .filter(|(_, entry)| {
                entry
                    .parent
                    .as_ref()
                    .is_none_or(|parent| !self.directories.contains_key(parent))
            })
            .map(|(path, _)| path.clone())
            .collect()
    }

    fn children_of(&self, dir: &Path) -> Vec<PathBuf> {
        self.directories
            .iter()
            .filter(|(_, entry)| entry.parent.as_deref() == Some(dir))
            .map(|(path, _)| path.clone())
            .collect()
    }
}

pub struct PathWatcher {
    pipeline: Arc<ScanPipeline>,
    registry: Mutex<Registry>,
}

impl fmt::Debug for PathWatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut debug = f.debug_struct("PathWatcher");
        match self.registry.try_lock() {
            Ok(registry) => {
                debug.field("directories", &registry.directories.len());
            }
            Err(_) => {
                debug.field("directories", &"<locked>");
            }
        }
        debug.finish()
    }
}

impl PathWatcher {
    pub fn new(pipeline: Arc<ScanPipeline>, backend: Box<dyn WatchBackend>) -> Self {
        Self {
            pipeline,
            registry: Mutex::new(Registry {
                backend,
                directories: BTreeMap::new(),
            }),
        }
    }

    /// Register `dir` and every sub-directory beneath it, then submit the
    /// files found there. Returns true when at least one directory was added.
    pub async fn register(&self, dir: &Path) -> bool {
        let fs = Arc::clone(self.pipeline.fs());
        let mut files = Vec::new();
        let mut added = 0usize;

        let roots = {
            let mut registry = self.registry.lock().await;
            let mut stack = vec![dir.to_path_buf()];

            while let Some(current) = stack.pop() {
                if registry.directories.contains_key(&current) {
                    continue;
                }
                match fs.metadata(&current).await {
                    Ok(metadata) if metadata.is_dir => {}
                    _ => continue,
                }
                if let Err(err) = registry.backend.watch(&current) {
                    warn!(target: "smartfolder::watch", path = %current.display(), error = %err, "skipping directory");
                    continue;
                }
                registry.directories.insert(
                    current.clone(),
                    WatchedDirectory {
                        parent: current.parent().map(Path::to_path_buf),
                    },
                );
                added += 1;

                let entries = match fs.read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) => {
                        debug!(target: "smartfolder::watch", path = %current.display(), error = %err, "cannot list directory");
                        continue;
                    }
                };
                for entry in entries {
                    match fs.metadata(&entry).await {
                        Ok(metadata) if metadata.is_dir => stack.push(entry),
                        Ok(metadata) if metadata.is_file => files.push(entry),
                        _ => {}
                    }
                }
            }

            (added > 0).then(|| registry.roots())
        };

        let Some(roots) = roots else {
            return false;
        };

        info!(target: "smartfolder::watch", path = %dir.display(), directories = added, files = files.len(), "registered");
        self.announce(roots);
        for file in files {
            self.pipeline.submit_file(&file, false).await;
        }
        true
    }

    /// Stop watching `dir` and every registered directory below it.
    ///
    /// Only acts when `dir` is itself a root, or when it has vanished from
    /// disk; a live sub-directory of a watched tree stays registered.
    pub async fn unregister(&self, dir: &Path) -> bool {
        let fs = Arc::clone(self.pipeline.fs());
        let mut registry = self.registry.lock().await;

        let Some(entry) = registry.directories.get(dir) else {
            return false;
        };
        let parent_registered = entry
            .parent
            .as_ref()
            .is_some_and(|parent| registry.directories.contains_key(parent));
        if parent_registered && fs.path_exists(dir).await {
            return false;
        }

        let mut removed = 0usize;
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            if registry.directories.remove(&current).is_none() {
                continue;
            }
            removed += 1;
            if let Err(err) = registry.backend.unwatch(&current) {
                // Deleted directories lose their native watch on their own.
                debug!(target: "smartfolder::watch", path = %current.display(), error = %err, "unwatch failed");
            }
            let children = registry.children_of(&current);
            stack.extend(children);
        }

        let roots = registry.roots();
        drop(registry);

        info!(target: "smartfolder::watch", path = %dir.display(), directories = removed, "unregistered");
        self.announce(roots);
        true
    }

    pub async fn is_registered(&self, dir: &Path) -> bool {
        self.registry.lock().await.directories.contains_key(dir)
    }

    /// Registered directories whose parent is not registered.
    pub async fn roots(&self) -> Vec<PathBuf> {
        self.registry.lock().await.roots()
    }

    pub async fn directories(&self) -> Vec<PathBuf> {
        self.registry
            .lock()
            .await
            .directories
            .keys()
            .cloned()
            .collect()
    }

    /// React to one change notification.
    pub async fn handle_event(&self, event: WatchEvent) {
        if event.kind == WatchEventKind::Ignored {
            return;
        }

        let fs = Arc::clone(self.pipeline.fs());
        for path in event.paths {
            if !fs.path_exists(&path).await {
                if self.is_registered(&path).await {
                    self.unregister(&path).await;
                }
                continue;
            }

            match fs.metadata(&path).await {
                Err(err) => {
                    debug!(target: "smartfolder::watch", path = %path.display(), error = %err, "cannot inspect changed path");
                }
                Ok(metadata) if metadata.is_dir => {
                    if event.kind == WatchEventKind::Created {
                        self.register(&path).await;
                    }
                }
                Ok(metadata) if metadata.is_file => {
                    self.pipeline.submit_file(&path, false).await;
                }
                Ok(_) => {}
            }
        }
    }

    /// Event loop. Ends when `shutdown` fires or every sender is gone.
    pub async fn run(
        self: Arc<Self>,
        mut events: mpsc::UnboundedReceiver<WatchMessage>,
        shutdown: CancellationToken,
    ) {
        info!(target: "smartfolder::watch", "watcher started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                message = events.recv() => match message {
                    Some(WatchMessage::Event(event)) => self.handle_event(event).await,
                    Some(WatchMessage::Error(error)) => {
                        warn!(target: "smartfolder::watch", %error, "watch error");
                    }
                    None => break,
                },
            }
        }
        info!(target: "smartfolder::watch", "watcher shutting down");
    }

    fn announce(&self, roots: Vec<PathBuf>) {
        self.pipeline
            .emit(PipelineEvent::DirectorySetChanged { roots });
    }
}
