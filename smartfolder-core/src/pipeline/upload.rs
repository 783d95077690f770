use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ScanPipeline;
use crate::remote::ScanService;
use crate::types::{ScanSession, SessionStatus};

/// Counters for one pass over the pending-upload queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadSweep {
    pub uploaded: usize,
    pub failed: usize,
    pub dropped: usize,
}

impl UploadSweep {
    pub fn is_idle(&self) -> bool {
        self.uploaded == 0 && self.failed == 0 && self.dropped == 0
    }
}

/// Drains the pending-upload queue into the remote service.
pub struct UploadWorker {
    pipeline: Arc<ScanPipeline>,
    service: Arc<dyn ScanService>,
    interval: Duration,
}

impl fmt::Debug for UploadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UploadWorker")
            .field("interval", &self.interval)
            .finish()
    }
}

impl UploadWorker {
    pub fn new(
        pipeline: Arc<ScanPipeline>,
        service: Arc<dyn ScanService>,
        interval: Duration,
    ) -> Self {
        Self {
            pipeline,
            service,
            interval,
        }
    }

    /// Upload everything currently queued.
    ///
    /// Sessions that fail are held back until the queue is drained and only
    /// then put back at the tail, so a failing upload is retried on the next
    /// sweep rather than in a tight loop.
    pub async fn sweep(&self) -> UploadSweep {
        let mut report = UploadSweep::default();
        let mut deferred: Vec<ScanSession> = Vec::new();

        while let Some(mut session) = self.pipeline.next_for_upload().await {
            self.pipeline
                .emit_status(session.id, &session.file, SessionStatus::Uploading);
            session.upload_attempts = session.upload_attempts.saturating_add(1);

            let contents = match self.pipeline.fs().read(&session.file).await {
                Ok(contents) => contents,
                Err(err) => {
                    warn!(
                        target: "smartfolder::upload",
                        session = %session.id,
                        path = %session.file.display(),
                        error = %err,
                        "file vanished before upload, dropping session"
                    );
                    self.pipeline
                        .drop_session(session, SessionStatus::UnableToUpload);
                    report.dropped += 1;
                    continue;
                }
            };

            // Cleared between the pop and here; the next pop reports it.
            let Some(credential) = self.pipeline.credentials().current() else {
                deferred.push(session);
                continue;
            };

            let file_name = session.file_name();
            match self
                .service
                .submit(contents, &file_name, &credential)
                .await
            {
                Ok(remote_id) => {
                    debug!(
                        target: "smartfolder::upload",
                        session = %session.id,
                        remote_id = %remote_id,
                        attempts = session.upload_attempts,
                        "uploaded"
                    );
                    session.remote_id = Some(remote_id);
                    self.pipeline.requeue_for_download(session).await;
                    report.uploaded += 1;
                }
                Err(err) if err.is_unauthorized() => {
                    self.pipeline
                        .emit_status(session.id, &session.file, SessionStatus::UnableToUpload);
                    self.pipeline.reject_credential(&credential);
                    report.failed += 1;
                    deferred.push(session);
                }
                Err(err) => {
                    warn!(
                        target: "smartfolder::upload",
                        session = %session.id,
                        path = %session.file.display(),
                        attempts = session.upload_attempts,
                        error = %err,
                        "upload failed, will retry"
                    );
                    report.failed += 1;
                    deferred.push(session);
                }
            }
        }

        for session in deferred {
            self.pipeline.retry_upload(session).await;
        }

        report
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(target: "smartfolder::upload", interval_ms = self.interval.as_millis() as u64, "upload worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let report = self.sweep().await;
            if !report.is_idle() {
                debug!(
                    target: "smartfolder::upload",
                    uploaded = report.uploaded,
                    failed = report.failed,
                    dropped = report.dropped,
                    "upload sweep finished"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(target: "smartfolder::upload", "upload worker shutting down");
    }
}
