use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ScanPipeline;
use crate::events::PipelineEvent;
use crate::remote::ScanService;
use crate::types::{ScanSession, SessionStatus, Verdict};

/// Counters for one pass over the pending-download queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DownloadSweep {
    pub clean: usize,
    pub infected: usize,
    pub in_progress: usize,
    pub failed: usize,
}

impl DownloadSweep {
    pub fn finalized(&self) -> usize {
        self.clean + self.infected
    }

    pub fn is_idle(&self) -> bool {
        self.finalized() == 0 && self.in_progress == 0 && self.failed == 0
    }
}

/// Polls the remote service for every uploaded session and finalizes the
/// ones whose scan has finished.
pub struct DownloadWorker {
    pipeline: Arc<ScanPipeline>,
    service: Arc<dyn ScanService>,
    interval: Duration,
}

impl fmt::Debug for DownloadWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadWorker")
            .field("interval", &self.interval)
            .finish()
    }
}

impl DownloadWorker {
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

    /// Poll everything currently queued once. Unfinished sessions go back to
    /// the tail only after the queue has been drained.
    pub async fn sweep(&self) -> DownloadSweep {
        let mut report = DownloadSweep::default();
        let mut incomplete: Vec<ScanSession> = Vec::new();

        while let Some(mut session) = self.pipeline.next_for_download().await {
            let Some(remote_id) = session.remote_id.clone() else {
                self.pipeline.retry_upload(session).await;
                continue;
            };
            let Some(credential) = self.pipeline.credentials().current() else {
                incomplete.push(session);
                continue;
            };

            match self.service.poll(&remote_id, &credential).await {
                Ok(result) => {
                    self.pipeline.emit(PipelineEvent::ScanProgress {
                        session_id: session.id,
                        file: session.file.clone(),
                        queue_position: result.queue_position,
                        progress_percent: result.progress_percent,
                    });
                    session.result = Some(result);

                    if session.is_complete() {
                        match self.pipeline.finalize(session).await {
                            Some(Verdict::Clean) => report.clean += 1,
                            Some(Verdict::Infected) => report.infected += 1,
                            None => {}
                        }
                    } else {
                        report.in_progress += 1;
                        incomplete.push(session);
                    }
                }
                Err(err) if err.is_unauthorized() => {
                    self.pipeline.emit_status(
                        session.id,
                        &session.file,
                        SessionStatus::UnableToDownload,
                    );
                    self.pipeline.reject_credential(&credential);
                    report.failed += 1;
                    incomplete.push(session);
                }
                Err(err) => {
                    warn!(
                        target: "smartfolder::download",
                        session = %session.id,
                        remote_id = %remote_id,
                        error = %err,
                        "poll failed, will retry"
                    );
                    report.failed += 1;
                    incomplete.push(session);
                }
            }
        }

        for session in incomplete {
            self.pipeline.requeue_for_download(session).await;
        }

        report
    }

    pub async fn run(self, shutdown: CancellationToken) {
        info!(target: "smartfolder::download", interval_ms = self.interval.as_millis() as u64, "download worker started");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let report = self.sweep().await;
            if !report.is_idle() {
                debug!(
                    target: "smartfolder::download",
                    clean = report.clean,
                    infected = report.infected,
                    in_progress = report.in_progress,
                    failed = report.failed,
                    "download sweep finished"
                );
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!(target: "smartfolder::download", "download worker shutting down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential::CredentialStore;
    use crate::events::{PipelineObserver, RecordingObserver};
    use crate::fs::{FileSystem, InMemoryFs};
    use crate::remote::RemoteError;
    use crate::types::{RemoteId, ScanResult, SessionAction};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Clone, Copy)]
    enum Reply {
        Progress(i64, i64),
        Done(i64),
        Status(u16),
    }

    /// Per-remote-id scripted poll replies. The last reply repeats.
    #[derive(Default)]
    struct ScriptedPolls {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        polls: Mutex<usize>,
    }

    impl ScriptedPolls {
        fn script(&self, remote_id: &str, replies: &[Reply]) {
            self.replies
                .lock()
                .unwrap()
                .insert(remote_id.to_string(), replies.iter().copied().collect());
        }
    }

    #[async_trait]
    impl ScanService for ScriptedPolls {
        async fn submit(&self, _: Vec<u8>, _: &str, _: &str) -> Result<RemoteId, RemoteError> {
            unreachable!("download tests never upload")
        }

        async fn poll(&self, remote_id: &RemoteId, _: &str) -> Result<ScanResult, RemoteError> {
            *self.polls.lock().unwrap() += 1;
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.get_mut(remote_id.as_str()).unwrap();
            let reply = if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                *queue.front().unwrap()
            };
            let (queue_position, progress_percent, result_code) = match reply {
                Reply::Progress(position, percent) => (position, percent, 0),
                Reply::Done(code) => (0, 100, code),
                Reply::Status(401) => return Err(RemoteError::Unauthorized),
                Reply::Status(code) => return Err(RemoteError::Status(code)),
            };
            Ok(ScanResult {
                queue_position,
                progress_percent,
                result_code,
                result_label: String::new(),
                observed_at: Utc::now(),
            })
        }
    }

    struct Fixture {
        recorder: Arc<RecordingObserver>,
        pipeline: Arc<ScanPipeline>,
        service: Arc<ScriptedPolls>,
        worker: DownloadWorker,
    }

    fn fixture(key: &str) -> Fixture {
        let recorder = Arc::new(RecordingObserver::new());
        let pipeline = Arc::new(ScanPipeline::new(
            Arc::new(InMemoryFs::new()) as Arc<dyn FileSystem>,
            Arc::new(CredentialStore::new(key)),
            Arc::clone(&recorder) as Arc<dyn PipelineObserver>,
        ));
        let service = Arc::new(ScriptedPolls::default());
        let worker = DownloadWorker::new(
            Arc::clone(&pipeline),
            Arc::clone(&service) as Arc<dyn ScanService>,
            Duration::from_millis(10),
        );
        Fixture {
            recorder,
            pipeline,
            service,
            worker,
        }
    }

    async fn uploaded(pipeline: &ScanPipeline, path: &str, remote_id: &str) -> ScanSession {
        let mut session = ScanSession::new(path, Utc::now());
        session.remote_id = RemoteId::new(remote_id);
        pipeline.requeue_for_download(session.clone()).await;
        session
    }

    #[tokio::test]
    async fn incomplete_scan_is_polled_again_until_done() {
        let f = fixture("k");
        f.service
            .script("r1", &[Reply::Progress(2, 0), Reply::Progress(0, 60), Reply::Done(0)]);
        let session = uploaded(&f.pipeline, "/data/a.txt", "r1").await;

        assert_eq!(f.worker.sweep().await.in_progress, 1);
        assert_eq!(f.worker.sweep().await.in_progress, 1);
        assert_eq!(f.worker.sweep().await.clean, 1);
        assert_eq!(f.pipeline.queue_depths().await.pending_download, 0);

        let statuses = f.recorder.statuses_for(session.id);
        assert_eq!(statuses.last(), Some(&SessionStatus::Clean));
        assert_eq!(
            f.recorder
                .count(|event| matches!(event, PipelineEvent::ScanProgress { .. })),
            3
        );
    }

    #[tokio::test]
    async fn each_session_is_polled_once_per_sweep() {
        let f = fixture("k");
        f.service.script("r1", &[Reply::Progress(5, 0)]);
        f.service.script("r2", &[Reply::Progress(4, 0)]);
        uploaded(&f.pipeline, "/data/a.txt", "r1").await;
        uploaded(&f.pipeline, "/data/b.txt", "r2").await;

        let report = f.worker.sweep().await;
        assert_eq!(report.in_progress, 2);
        assert_eq!(*f.service.polls.lock().unwrap(), 2);
        assert_eq!(f.pipeline.queue_depths().await.pending_download, 2);
    }

    #[tokio::test]
    async fn infected_result_is_flagged_for_review() {
        let f = fixture("k");
        f.service.script("r9", &[Reply::Done(1)]);
        uploaded(&f.pipeline, "/data/b.exe", "r9").await;

        assert_eq!(f.worker.sweep().await.infected, 1);
        assert_eq!(
            f.recorder
                .count(|event| matches!(event, PipelineEvent::VirusDetected { .. })),
            1
        );
        assert_eq!(
            f.recorder.count(|event| matches!(
                event,
                PipelineEvent::SessionActionChanged {
                    action: SessionAction::PendingReview,
                    ..
                }
            )),
            1
        );
    }

    #[tokio::test]
    async fn unauthorized_poll_clears_key_and_keeps_session() {
        let f = fixture("bad");
        f.service.script("r1", &[Reply::Status(401)]);
        let session = uploaded(&f.pipeline, "/data/a.txt", "r1").await;

        assert_eq!(f.worker.sweep().await.failed, 1);
        assert!(!f.pipeline.credentials().is_configured());
        assert_eq!(f.pipeline.queue_depths().await.pending_download, 1);
        assert!(
            f.recorder
                .statuses_for(session.id)
                .contains(&SessionStatus::UnableToDownload)
        );
        assert!(f.worker.sweep().await.is_idle());
    }

    #[tokio::test]
    async fn server_error_is_retried() {
        let f = fixture("k");
        f.service.script("r1", &[Reply::Status(500), Reply::Done(7)]);
        uploaded(&f.pipeline, "/data/a.txt", "r1").await;

        assert_eq!(f.worker.sweep().await.failed, 1);
        assert_eq!(f.worker.sweep().await.clean, 1);
        assert!(f.pipeline.credentials().is_configured());
    }
}
