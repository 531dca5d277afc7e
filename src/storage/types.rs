use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

/// Suffix of the batch file currently being appended to
pub const IN_PROGRESS_SUFFIX: &str = ".part";

static BATCH_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory holding pending event files
    pub root_dir: PathBuf,

    /// fsync after every append instead of only flushing
    pub sync_on_append: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("./event-files"),
            sync_on_append: false,
        }
    }
}

impl StorageConfig {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            ..Default::default()
        }
    }

    pub fn sync_on_append(mut self, enabled: bool) -> Self {
        self.sync_on_append = enabled;
        self
    }
}

/// A finalized, immutable batch of serialized events waiting for upload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEventFile {
    /// File name inside the root directory
    pub identifier: String,

    pub path: PathBuf,

    /// Size on disk when listed or finalized
    pub size: u64,

    /// Birth time where available, otherwise modification time
    pub created: SystemTime,
}

impl PendingEventFile {
    /// FIFO ordering key
    pub(crate) fn order_key(&self) -> (SystemTime, &str) {
        (self.created, self.identifier.as_str())
    }
}

/// New batch identifier. Lexical order follows creation order within a process.
pub fn new_identifier() -> String {
    let millis = chrono::Utc::now().timestamp_millis().max(0);
    let seq = BATCH_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    format!(
        "{:013}-{:06}-{}",
        millis,
        seq,
        uuid::Uuid::new_v4().simple()
    )
}

/// Identifiers must be plain file names so they cannot escape the root directory
pub fn is_valid_identifier(identifier: &str) -> bool {
    !identifier.is_empty()
        && !identifier.starts_with('.')
        && !identifier.ends_with(IN_PROGRESS_SUFFIX)
        && Path::new(identifier)
            .file_name()
            .map(|name| name == identifier)
            .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifiers_sort_by_creation() {
        let ids: Vec<String> = (0..100).map(|_| new_identifier()).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier(&new_identifier()));
        assert!(is_valid_identifier("batch-1"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier(".hidden"));
        assert!(!is_valid_identifier("../escape"));
        assert!(!is_valid_identifier("a/b"));
        assert!(!is_valid_identifier("batch-1.part"));
    }
}
