use crate::metrics::MetricKey;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("File operation failed on {path}: {source}")]
    FileOperation {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("File I/O failed on {path}: {source}")]
    FileIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Event file not found: {0}")]
    NotFound(String),

    #[error("Event file already claimed: {0}")]
    AlreadyClaimed(String),

    #[error("Invalid event file identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Refusing to append an empty event")]
    EmptyEvent,
}

impl StorageError {
    pub(crate) fn file_operation(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::FileOperation {
            path: path.display().to_string(),
            source,
        }
    }

    pub(crate) fn file_io(path: &std::path::Path, source: std::io::Error) -> Self {
        StorageError::FileIo {
            path: path.display().to_string(),
            source,
        }
    }

    /// Counter this error is reported under, if any
    pub fn metric_key(&self) -> Option<MetricKey> {
        match self {
            StorageError::FileOperation { .. } | StorageError::NotFound(_) => {
                Some(MetricKey::NumFileOperationErrors)
            }
            StorageError::FileIo { .. } => Some(MetricKey::NumFileIoErrors),
            StorageError::EmptyEvent | StorageError::InvalidIdentifier(_) => {
                Some(MetricKey::NumMiscErrors)
            }
            // Contention, not a failure
            StorageError::AlreadyClaimed(_) => None,
        }
    }

    /// True when the file is gone, which callers deleting it may treat as success
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NotFound(_) => true,
            StorageError::FileOperation { source, .. } | StorageError::FileIo { source, .. } => {
                source.kind() == std::io::ErrorKind::NotFound
            }
            _ => false,
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
