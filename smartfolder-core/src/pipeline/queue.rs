use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::Serialize;

use crate::types::{ScanSession, SessionId};

/// Outcome of offering a session to the pending-upload queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Admission {
    /// A new session was queued.
    Enqueued(SessionId),
    /// Accepted, but a session for the same file was already waiting for
    /// upload; that session will pick up the current contents.
    Coalesced(SessionId),
    /// Ledger says nothing changed.
    Rejected,
}

impl Admission {
    pub fn session_id(&self) -> Option<SessionId> {
        match self {
            Admission::Enqueued(id) | Admission::Coalesced(id) => Some(*id),
            Admission::Rejected => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepths {
    pub pending_upload: usize,
    pub pending_download: usize,
    pub ledger_entries: usize,
}

/// Two FIFO queues plus the submission ledger.
///
/// Plain data: callers wrap it in a single lock so that every method is one
/// atomic step with respect to the others.
#[derive(Debug, Default)]
pub struct SessionQueue {
    pending_upload: VecDeque<ScanSession>,
    pending_download: VecDeque<ScanSession>,
    ledger: HashMap<PathBuf, SystemTime>,
}

impl SessionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger rule for non-forced submissions.
    ///
    /// A file counts as out of date when it has never been recorded, or when
    /// the recorded time is strictly *newer* than the file's current mtime.
    /// The comparison direction is kept exactly as the agent has always
    /// applied it; an unchanged or newer mtime is treated as already seen.
    pub fn is_out_of_date(&self, file: &Path, modified: SystemTime) -> bool {
        match self.ledger.get(file) {
            None => true,
            Some(recorded) => *recorded > modified,
        }
    }

    pub fn ledger_time(&self, file: &Path) -> Option<SystemTime> {
        self.ledger.get(file).copied()
    }

    /// Gate a brand new session. The ledger is stamped at enqueue time.
    pub fn admit(&mut self, session: ScanSession, modified: SystemTime, force: bool) -> Admission {
        if !force && !self.is_out_of_date(&session.file, modified) {
            return Admission::Rejected;
        }

        self.ledger.insert(session.file.clone(), modified);

        if let Some(waiting) = self
            .pending_upload
            .iter()
            .find(|queued| queued.file == session.file)
        {
            return Admission::Coalesced(waiting.id);
        }

        let id = session.id;
        self.pending_upload.push_back(session);
        Admission::Enqueued(id)
    }

    /// Put a session that failed to upload back at the tail. Always accepted;
    /// the ledger follows the file's current mtime when it is known.
    pub fn requeue_upload(&mut self, session: ScanSession, modified: Option<SystemTime>) {
        if let Some(modified) = modified {
            self.ledger.insert(session.file.clone(), modified);
        }
        self.pending_upload.push_back(session);
    }

    /// Queue a session for polling. Sessions without a remote id are refused
    /// and handed back.
    pub fn push_download(&mut self, session: ScanSession) -> Result<(), ScanSession> {
        if session.remote_id.is_none() {
            return Err(session);
        }
        self.pending_download.push_back(session);
        Ok(())
    }

    pub fn pop_upload(&mut self) -> Option<ScanSession> {
        self.pending_upload.pop_front()
    }

    pub fn pop_download(&mut self) -> Option<ScanSession> {
        self.pending_download.pop_front()
    }

    pub fn depths(&self) -> QueueDepths {
        QueueDepths {
            pending_upload: self.pending_upload.len(),
            pending_download: self.pending_download.len(),
            ledger_entries: self.ledger.len(),
        }
    }
}
