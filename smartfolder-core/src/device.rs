//! Removable device detection by polling a list of candidate mount points.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::events::PipelineEvent;
use crate::pipeline::ScanPipeline;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceChanges {
    pub appeared: Vec<PathBuf>,
    pub disappeared: Vec<PathBuf>,
}

impl DeviceChanges {
    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty() && self.disappeared.is_empty()
    }
}

/// Watches candidate mount paths. Anything present when the monitor starts
/// is part of the baseline and never scanned; a path that shows up later is
/// scanned in full with the ledger bypassed.
pub struct DeviceMonitor {
    pipeline: Arc<ScanPipeline>,
    candidates: Vec<PathBuf>,
    interval: Duration,
    present: BTreeSet<PathBuf>,
}

impl fmt::Debug for DeviceMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceMonitor")
            .field("candidates", &self.candidates)
            .field("present", &self.present)
            .field("interval", &self.interval)
            .finish()
    }
}

impl DeviceMonitor {
    pub fn new(pipeline: Arc<ScanPipeline>, candidates: Vec<PathBuf>, interval: Duration) -> Self {
        Self {
            pipeline,
            candidates,
            interval,
            present: BTreeSet::new(),
        }
    }

    async fn snapshot(&self) -> BTreeSet<PathBuf> {
        let fs = self.pipeline.fs();
        let mut present = BTreeSet::new();
        for candidate in &self.candidates {
            if fs.path_exists(candidate).await {
                present.insert(candidate.clone());
            }
        }
        present
    }

    /// Record the devices that are already attached.
    pub async fn baseline(&mut self) {
        self.present = self.snapshot().await;
        debug!(target: "smartfolder::device", present = self.present.len(), "device baseline taken");
    }

    /// Compare against the previous snapshot, announcing and scanning new
    /// devices.
    pub async fn check(&mut self) -> DeviceChanges {
        let current = self.snapshot().await;
        let changes = DeviceChanges {
            appeared: current.difference(&self.present).cloned().collect(),
            disappeared: self.present.difference(&current).cloned().collect(),
        };
        self.present = current;

        for path in &changes.disappeared {
            self.pipeline
                .emit(PipelineEvent::DeviceDisappeared { path: path.clone() });
        }
        for path in &changes.appeared {
            self.pipeline
                .emit(PipelineEvent::DeviceAppeared { path: path.clone() });
            let queued = self.pipeline.submit_directory(path, true).await;
            info!(target: "smartfolder::device", path = %path.display(), queued, "scanning new device");
        }

        changes
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        self.baseline().await;
        info!(target: "smartfolder::device", candidates = self.candidates.len(), "device monitor started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {
                    self.check().await;
                }
            }
        }
        info!(target: "smartfolder::device", "device monitor shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialStore;
    use crate::events::{PipelineObserver, RecordingObserver};
    use crate::fs::{FileSystem, InMemoryFs};
    use std::path::Path;

    fn monitor(fs: &Arc<InMemoryFs>, recorder: &Arc<RecordingObserver>) -> DeviceMonitor {
        let pipeline = Arc::new(ScanPipeline::new(
            Arc::clone(fs) as Arc<dyn FileSystem>,
            Arc::new(CredentialStore::new("k")),
            Arc::clone(recorder) as Arc<dyn PipelineObserver>,
        ));
        DeviceMonitor::new(
            pipeline,
            vec![PathBuf::from("/media/usb0"), PathBuf::from("/media/usb1")],
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn baseline_devices_are_not_scanned() {
        let fs = Arc::new(InMemoryFs::new());
        let recorder = Arc::new(RecordingObserver::new());
        fs.add_file("/media/usb0/old.txt", b"o");

        let mut monitor = monitor(&fs, &recorder);
        monitor.baseline().await;
        assert!(monitor.check().await.is_empty());
        assert_eq!(monitor.pipeline.outstanding_sessions(), 0);
    }

    #[tokio::test]
    async fn inserted_device_is_force_scanned() {
        let fs = Arc::new(InMemoryFs::new());
        let recorder = Arc::new(RecordingObserver::new());
        let mut monitor = monitor(&fs, &recorder);
        monitor.baseline().await;

        fs.add_file("/media/usb1/setup.exe", b"s");
        fs.add_file("/media/usb1/docs/readme.txt", b"r");
        let changes = monitor.check().await;
        assert_eq!(changes.appeared, vec![PathBuf::from("/media/usb1")]);
        assert_eq!(monitor.pipeline.queue_depths().await.pending_upload, 2);
        assert_eq!(
            recorder.count(|event| matches!(event, PipelineEvent::DeviceAppeared { .. })),
            1
        );

        // Removal is reported once; reinsertion scans again despite the ledger.
        fs.remove(Path::new("/media/usb1"));
        assert_eq!(monitor.check().await.disappeared.len(), 1);
        assert!(monitor.check().await.is_empty());
        assert_eq!(
            recorder.count(|event| matches!(event, PipelineEvent::DeviceDisappeared { .. })),
            1
        );

        while monitor.pipeline.next_for_upload().await.is_some() {}
        fs.add_file("/media/usb1/setup.exe", b"s");
        monitor.check().await;
        assert_eq!(monitor.pipeline.queue_depths().await.pending_upload, 1);
    }
}
