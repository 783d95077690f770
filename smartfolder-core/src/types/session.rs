use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::result::ScanResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionId(pub Uuid);

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionId {
    pub fn new() -> Self {
        SessionId(Uuid::now_v7())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque identifier handed out by the remote service after a successful
/// upload (`data_id` on the wire).
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RemoteId(String);

impl RemoteId {
    /// Returns `None` for blank identifiers, which the service never issues
    /// for an accepted upload.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        if raw.trim().is_empty() {
            None
        } else {
            Some(RemoteId(raw))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RemoteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One file's end-to-end scan attempt.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanSession {
    pub id: SessionId,
    pub file: PathBuf,
    pub remote_id: Option<RemoteId>,
    pub result: Option<ScanResult>,
    pub created_at: DateTime<Utc>,
    /// Number of upload attempts made so far, successful or not.
    pub upload_attempts: u32,
}

impl ScanSession {
    pub fn new(file: impl Into<PathBuf>, created_at: DateTime<Utc>) -> Self {
        Self {
            id: SessionId::new(),
            file: file.into(),
            remote_id: None,
            result: None,
            created_at,
            upload_attempts: 0,
        }
    }

    pub fn file(&self) -> &Path {
        &self.file
    }

    /// File name sent alongside the upload.
    pub fn file_name(&self) -> String {
        self.file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.file.to_string_lossy().into_owned())
    }

    pub fn is_uploaded(&self) -> bool {
        self.remote_id.is_some()
    }

    pub fn is_complete(&self) -> bool {
        self.result.as_ref().is_some_and(ScanResult::is_complete)
    }
}

/// Status column shown for a session by the presentation layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionStatus {
    Processing,
    Uploading,
    Scanning,
    Clean,
    Infected,
    UnableToUpload,
    UnableToDownload,
}

impl SessionStatus {
    pub fn label(&self) -> &'static str {
        match self {
            SessionStatus::Processing => "Processing",
            SessionStatus::Uploading => "Uploading",
            SessionStatus::Scanning => "Scanning",
            SessionStatus::Clean => "Clean",
            SessionStatus::Infected => "Infected",
            SessionStatus::UnableToUpload => "Unable to Upload",
            SessionStatus::UnableToDownload => "Unable to Download",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Action column for a finalized session.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionAction {
    /// Clean file, nothing to do.
    Ignored,
    /// Suspicious file awaiting the user's decision.
    PendingReview,
    /// Suspicious file removed from disk at the user's request.
    Deleted,
}

impl SessionAction {
    pub fn label(&self) -> &'static str {
        match self {
            SessionAction::Ignored => "Ignored",
            SessionAction::PendingReview => "",
            SessionAction::Deleted => "Deleted",
        }
    }
}

/// The user's answer for a flagged file.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    /// Remove the file from disk.
    Delete,
    /// Keep the file and stop asking.
    Ignore,
}
