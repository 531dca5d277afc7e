use crate::storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Upload already in flight: {0}")]
    AlreadyInFlight(String),

    #[error("Path {path} does not name event file {identifier}")]
    PathMismatch { identifier: String, path: String },

    #[error("Upload cancelled: {0}")]
    Cancelled(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("HTTP client error: {0}")]
    Client(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl From<reqwest::Error> for UploadError {
    fn from(err: reqwest::Error) -> Self {
        UploadError::Client(err.to_string())
    }
}

pub type UploadResult<T> = Result<T, UploadError>;
