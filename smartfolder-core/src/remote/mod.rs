//! Contract with the remote scanning service.

pub mod metascan;

use async_trait::async_trait;

use crate::types::{RemoteId, ScanResult};

pub use metascan::MetascanClient;

#[derive(Debug, thiserror::Error)]
pub enum RemoteError {
    /// The service rejected the credential (HTTP 401).
    #[error("Invalid API key")]
    Unauthorized,

    /// Any other non-success status; treated as transient.
    #[error("Unexpected status: {0}")]
    Status(u16),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Malformed response: {0}")]
    Malformed(String),
}

impl RemoteError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized)
    }
}

/// Opaque oracle that accepts a file and eventually classifies it.
#[async_trait]
pub trait ScanService: Send + Sync {
    /// Upload file contents; returns the identifier to poll with.
    async fn submit(
        &self,
        contents: Vec<u8>,
        file_name: &str,
        credential: &str,
    ) -> Result<RemoteId, RemoteError>;

    /// Fetch the current progress snapshot for an upload.
    async fn poll(&self, remote_id: &RemoteId, credential: &str)
    -> Result<ScanResult, RemoteError>;
}
