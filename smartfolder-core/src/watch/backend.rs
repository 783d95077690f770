//! Native change notification behind a small trait so the watcher's registry
//! logic can run against a recording fake.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use notify::event::{AccessKind, AccessMode, EventKind, ModifyKind, RenameMode};
use notify::{Config as NotifyConfig, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{Result, ScanError};

/// What happened to a path, reduced to what the watcher acts on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Created,
    Modified,
    Removed,
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub paths: Vec<PathBuf>,
}

impl WatchEvent {
    pub fn new(kind: WatchEventKind, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            kind,
            paths: paths.into_iter().collect(),
        }
    }
}

pub enum WatchMessage {
    Event(WatchEvent),
    Error(String),
}

impl fmt::Debug for WatchMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchMessage::Event(event) => f
                .debug_struct("WatchMessage::Event")
                .field("kind", &event.kind)
                .field("path_count", &event.paths.len())
                .finish(),
            WatchMessage::Error(message) => f
                .debug_struct("WatchMessage::Error")
                .field("message", message)
                .finish(),
        }
    }
}

/// Renames are split into their halves: the source side counts as removed,
/// the destination side as created.
pub fn classify(kind: &EventKind) -> WatchEventKind {
    match kind {
        EventKind::Create(_) => WatchEventKind::Created,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => WatchEventKind::Removed,
        EventKind::Modify(ModifyKind::Name(_)) => WatchEventKind::Created,
        EventKind::Modify(_) => WatchEventKind::Modified,
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => WatchEventKind::Modified,
        EventKind::Access(_) => WatchEventKind::Ignored,
        EventKind::Remove(_) => WatchEventKind::Removed,
        EventKind::Any | EventKind::Other => WatchEventKind::Modified,
    }
}

/// Per-directory watch handles.
pub trait WatchBackend: Send {
    /// Start watching the direct children of `path`.
    fn watch(&mut self, path: &Path) -> Result<()>;

    fn unwatch(&mut self, path: &Path) -> Result<()>;
}

/// `notify` backed implementation. One non-recursive watch per directory;
/// the registry above decides which directories those are.
pub struct NotifyBackend {
    watcher: RecommendedWatcher,
}

impl fmt::Debug for NotifyBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NotifyBackend")
    }
}

impl NotifyBackend {
    /// Events are forwarded on an unbounded channel: the notify callback runs
    /// on its own thread and must never wait on the async side.
    pub fn new(tx: mpsc::UnboundedSender<WatchMessage>) -> Result<Self> {
        let watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| {
                let message = match res {
                    Ok(event) => WatchMessage::Event(WatchEvent {
                        kind: classify(&event.kind),
                        paths: event.paths,
                    }),
                    Err(err) => WatchMessage::Error(err.to_string()),
                };
                if tx.send(message).is_err() {
                    warn!(target: "smartfolder::watch", "watch channel closed, dropping event");
                }
            },
            NotifyConfig::default(),
        )?;
        Ok(Self { watcher })
    }
}

impl WatchBackend for NotifyBackend {
    fn watch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|err| ScanError::Watch(format!("failed to watch {}: {err}", path.display())))
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watcher
            .unwatch(path)
            .map_err(|err| ScanError::Watch(format!("failed to unwatch {}: {err}", path.display())))
    }
}

/// Backend that only records which paths are watched. Paths added with
/// [`RecordingBackend::fail_on`] refuse to be watched.
#[derive(Clone, Debug, Default)]
pub struct RecordingBackend {
    watched: Arc<Mutex<BTreeSet<PathBuf>>>,
    failing: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl RecordingBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_on(&self, path: impl Into<PathBuf>) {
        self.failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.into());
    }

    pub fn watched(&self) -> Vec<PathBuf> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

impl WatchBackend for RecordingBackend {
    fn watch(&mut self, path: &Path) -> Result<()> {
        let failing = self
            .failing
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if failing.contains(path) {
            return Err(ScanError::Watch(format!(
                "watch refused for {}",
                path.display()
            )));
        }
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&mut self, path: &Path) -> Result<()> {
        self.watched
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, RemoveKind};

    #[test]
    fn classifies_renames_as_delete_then_create() {
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            WatchEventKind::Removed
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            WatchEventKind::Created
        );
        assert_eq!(
            classify(&EventKind::Create(CreateKind::Folder)),
            WatchEventKind::Created
        );
        assert_eq!(
            classify(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            WatchEventKind::Modified
        );
        assert_eq!(
            classify(&EventKind::Remove(RemoveKind::File)),
            WatchEventKind::Removed
        );
        assert_eq!(
            classify(&EventKind::Access(AccessKind::Read)),
            WatchEventKind::Ignored
        );
    }

    #[test]
    fn recording_backend_tracks_and_refuses() {
        let mut backend = RecordingBackend::new();
        backend.fail_on("/locked");
        backend.watch(Path::new("/data")).unwrap();
        assert!(backend.watch(Path::new("/locked")).is_err());
        assert_eq!(backend.watched(), vec![PathBuf::from("/data")]);

        backend.unwatch(Path::new("/data")).unwrap();
        assert!(backend.watched().is_empty());
    }

    #[tokio::test]
    async fn notify_backend_reports_new_files() {
        let tmp = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut backend = NotifyBackend::new(tx).unwrap();
        backend.watch(tmp.path()).unwrap();

        let file = tmp.path().join("fresh.txt");
        std::fs::write(&file, b"data").unwrap();

        let seen = tokio::time::timeout(std::time::Duration::from_secs(5), async {
            while let Some(message) = rx.recv().await {
                if let WatchMessage::Event(event) = message
                    && event.paths.iter().any(|p| p.ends_with("fresh.txt"))
                {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen);
    }
}
