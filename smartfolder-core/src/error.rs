use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Watch error: {0}")]
    Watch(String),

    #[error("Remote service error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<notify::Error> for ScanError {
    fn from(err: notify::Error) -> Self {
        ScanError::Watch(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ScanError>;
