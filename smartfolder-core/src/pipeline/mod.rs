//! Submission gate, session queues and verdict handling.
//!
//! A [`ScanPipeline`] owns all mutable pipeline state behind one lock. The
//! watcher and the device monitor feed it through [`ScanPipeline::submit_file`]
//! and [`ScanPipeline::submit_directory`]; the [`UploadWorker`] and
//! [`DownloadWorker`] drain it on their own cadence.

pub mod download;
pub mod queue;
pub mod upload;

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::credential::CredentialStore;
use crate::error::{Result, ScanError};
use crate::events::{PipelineEvent, PipelineObserver};
use crate::fs::{FileSystem, FsMetadata};
use crate::types::{Resolution, ScanSession, SessionAction, SessionId, SessionStatus, Verdict};

pub use download::{DownloadSweep, DownloadWorker};
pub use queue::{Admission, QueueDepths, SessionQueue};
pub use upload::{UploadSweep, UploadWorker};

pub struct ScanPipeline {
    queue: Mutex<SessionQueue>,
    credentials: Arc<CredentialStore>,
    observer: Arc<dyn PipelineObserver>,
    fs: Arc<dyn FileSystem>,
    clock: Arc<dyn Clock>,
    outstanding: AtomicUsize,
}

impl fmt::Debug for ScanPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanPipeline")
            .field("credentials", &self.credentials)
            .field("outstanding", &self.outstanding_sessions())
            .finish()
    }
}

impl ScanPipeline {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        credentials: Arc<CredentialStore>,
        observer: Arc<dyn PipelineObserver>,
    ) -> Self {
        Self {
            queue: Mutex::new(SessionQueue::new()),
            credentials,
            observer,
            fs,
            clock: Arc::new(SystemClock),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn fs(&self) -> &Arc<dyn FileSystem> {
        &self.fs
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn observer(&self) -> &Arc<dyn PipelineObserver> {
        &self.observer
    }

    /// Offer one file to the pipeline.
    ///
    /// Returns the id of the session that will carry the file, or `None` when
    /// the file is missing, not a regular file, or unchanged since it was last
    /// queued. With `force` the ledger check is skipped.
    pub async fn submit_file(&self, path: &Path, force: bool) -> Option<SessionId> {
        let metadata = match self.fs.metadata(path).await {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(path = %path.display(), error = %err, "skipping submission, file not readable");
                return None;
            }
        };
        self.admit(path, &metadata, force).await
    }

    /// Submit every regular file beneath `dir`, recursively. Returns how many
    /// files were accepted (including ones folded into a waiting session).
    pub async fn submit_directory(&self, dir: &Path, force: bool) -> usize {
        let mut accepted = 0;
        let mut stack: Vec<PathBuf> = vec![dir.to_path_buf()];

        while let Some(current) = stack.pop() {
            let entries = match self.fs.read_dir(&current).await {
                Ok(entries) => entries,
                Err(err) => {
                    debug!(path = %current.display(), error = %err, "cannot list directory");
                    continue;
                }
            };

            for entry in entries {
                let Ok(metadata) = self.fs.metadata(&entry).await else {
                    continue;
                };
                if metadata.is_dir {
                    stack.push(entry);
                } else if self.admit(&entry, &metadata, force).await.is_some() {
                    accepted += 1;
                }
            }
        }

        accepted
    }

    async fn admit(&self, path: &Path, metadata: &FsMetadata, force: bool) -> Option<SessionId> {
        if !metadata.is_file {
            return None;
        }

        let session = ScanSession::new(path, self.clock.now());
        let snapshot = session.clone();
        let admission = {
            let mut queue = self.queue.lock().await;
            let admission = queue.admit(session, metadata.modified_or_epoch(), force);
            // Counted before the lock drops so a worker cannot release it first.
            if let Admission::Enqueued(_) = admission {
                self.outstanding.fetch_add(1, Ordering::SeqCst);
            }
            admission
        };

        match admission {
            Admission::Enqueued(id) => {
                debug!(session = %id, path = %path.display(), force, "file queued for upload");
                self.observer
                    .on_event(PipelineEvent::SessionAdded { session: snapshot });
                self.emit_status(id, path, SessionStatus::Processing);
                Some(id)
            }
            Admission::Coalesced(id) => {
                debug!(session = %id, path = %path.display(), "file already waiting for upload");
                Some(id)
            }
            Admission::Rejected => None,
        }
    }

    /// Next session to upload, or `None` when the queue is empty or no
    /// credential is configured.
    pub async fn next_for_upload(&self) -> Option<ScanSession> {
        if !self.credentials.is_configured() {
            self.notify_credential_invalid();
            return None;
        }
        self.queue.lock().await.pop_upload()
    }

    /// Next session to poll. Same credential gate as uploads.
    pub async fn next_for_download(&self) -> Option<ScanSession> {
        if !self.credentials.is_configured() {
            self.notify_credential_invalid();
            return None;
        }
        self.queue.lock().await.pop_download()
    }

    /// Queue an uploaded session for polling and mark it as scanning.
    ///
    /// The `Scanning` status is always reported. A session that never got a
    /// remote id cannot be polled and goes back to the upload queue instead.
    pub async fn requeue_for_download(&self, session: ScanSession) {
        let (id, file) = (session.id, session.file.clone());
        self.emit_status(id, &file, SessionStatus::Scanning);
        let refused = self.queue.lock().await.push_download(session);

        match refused {
            Ok(()) => {}
            Err(session) => {
                warn!(session = %id, path = %file.display(), "session has no remote id, sending back to upload");
                self.retry_upload(session).await;
            }
        }
    }

    /// Put a session back on the upload queue without announcing it again.
    pub async fn retry_upload(&self, session: ScanSession) {
        let modified = self
            .fs
            .metadata(&session.file)
            .await
            .ok()
            .map(|metadata| metadata.modified_or_epoch());
        self.queue.lock().await.requeue_upload(session, modified);
    }

    /// Apply the verdict of a completed session.
    ///
    /// A session without a result is sent back for another poll and `None`
    /// is returned.
    pub async fn finalize(&self, session: ScanSession) -> Option<Verdict> {
        let Some(result) = session.result.as_ref() else {
            warn!(session = %session.id, "finalize called before a result arrived");
            self.requeue_for_download(session).await;
            return None;
        };

        let verdict = result.verdict();
        match verdict {
            Verdict::Clean => {
                self.emit_status(session.id, &session.file, SessionStatus::Clean);
                self.emit_action(session.id, &session.file, SessionAction::Ignored);
                info!(session = %session.id, path = %session.file.display(), "file is clean");
            }
            Verdict::Infected => {
                self.emit_status(session.id, &session.file, SessionStatus::Infected);
                self.emit_action(session.id, &session.file, SessionAction::PendingReview);
                warn!(
                    session = %session.id,
                    path = %session.file.display(),
                    code = result.result_code,
                    result = %result.result_label,
                    "file flagged by remote scan"
                );
                self.observer
                    .on_event(PipelineEvent::VirusDetected { session: session.clone() });
            }
        }

        self.release();
        Some(verdict)
    }

    /// Carry out the user's decision for a flagged file.
    ///
    /// `Delete` removes the file; a file that is already gone counts as
    /// deleted. Sessions without an infected verdict are refused.
    pub async fn resolve_infected(
        &self,
        session: &ScanSession,
        resolution: Resolution,
    ) -> Result<SessionAction> {
        let flagged = session
            .result
            .as_ref()
            .is_some_and(|result| result.verdict() == Verdict::Infected);
        if !flagged {
            return Err(ScanError::Internal(format!(
                "session {} has no infected verdict",
                session.id
            )));
        }

        let action = match resolution {
            Resolution::Ignore => SessionAction::Ignored,
            Resolution::Delete => {
                match self.fs.remove_file(&session.file).await {
                    Ok(()) => {
                        info!(session = %session.id, path = %session.file.display(), "flagged file deleted");
                    }
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        debug!(session = %session.id, path = %session.file.display(), "flagged file already gone");
                    }
                    Err(err) => {
                        warn!(session = %session.id, path = %session.file.display(), error = %err, "cannot delete flagged file");
                        return Err(err.into());
                    }
                }
                SessionAction::Deleted
            }
        };

        self.emit_action(session.id, &session.file, action);
        Ok(action)
    }

    /// Give up on a session for good, reporting `status` as its last state.
    pub fn drop_session(&self, session: ScanSession, status: SessionStatus) {
        self.emit_status(session.id, &session.file, status);
        self.release();
    }

    /// React to the service rejecting `credential`: forget it (unless it was
    /// already replaced) and tell the user once.
    pub fn reject_credential(&self, credential: &str) {
        if self.credentials.clear_if_current(credential) {
            warn!("remote service rejected the API key");
        }
        self.notify_credential_invalid();
    }

    /// Install a new credential. A changed value re-arms the one-shot
    /// notification.
    pub fn set_credential(&self, key: impl Into<String>) -> bool {
        let changed = self.credentials.set(key);
        if changed {
            info!(configured = self.credentials.is_configured(), "API key updated");
        }
        changed
    }

    /// Sessions accepted but not yet finalized or dropped.
    pub fn outstanding_sessions(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    pub async fn queue_depths(&self) -> QueueDepths {
        self.queue.lock().await.depths()
    }

    pub fn emit_status(&self, session_id: SessionId, file: &Path, status: SessionStatus) {
        self.observer.on_event(PipelineEvent::SessionStatusChanged {
            session_id,
            file: file.to_path_buf(),
            status,
        });
    }

    pub(crate) fn emit(&self, event: PipelineEvent) {
        self.observer.on_event(event);
    }

    fn emit_action(&self, session_id: SessionId, file: &Path, action: SessionAction) {
        self.observer.on_event(PipelineEvent::SessionActionChanged {
            session_id,
            file: file.to_path_buf(),
            action,
        });
    }

    fn notify_credential_invalid(&self) {
        if self.credentials.claim_invalid_notification() {
            self.observer.on_event(PipelineEvent::CredentialInvalid);
        }
    }

    fn release(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                Some(count.saturating_sub(1))
            });
    }
}
