//! Event file manager
//!
//! Owns the root directory of pending event files. Events are appended to a
//! single `<identifier>.part` file; finalizing renames it to `<identifier>`,
//! after which the file is immutable and offered for upload until deleted.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::error::{StorageError, StorageResult};
use super::lease::{FileLease, LeaseTable};
use super::types::{
    is_valid_identifier, new_identifier, PendingEventFile, StorageConfig, IN_PROGRESS_SUFFIX,
};
use crate::metrics::{MetricKey, MetricsRegistry};

/// The batch currently receiving appends
struct CurrentBatch {
    identifier: String,
    path: PathBuf,
    file: File,
    size: u64,
}

impl CurrentBatch {
    async fn append(&mut self, event: &[u8], sync: bool) -> std::io::Result<()> {
        let result = async {
            self.file.write_all(event).await?;
            self.file.flush().await?;
            if sync {
                self.file.sync_data().await?;
            }
            Ok::<(), std::io::Error>(())
        }
        .await;

        match result {
            Ok(()) => {
                self.size += event.len() as u64;
                Ok(())
            }
            Err(e) => {
                // Cut off whatever part of the event made it to disk
                if let Err(trunc) = self.file.set_len(self.size).await {
                    tracing::warn!("Failed to truncate {}: {}", self.path.display(), trunc);
                }
                Err(e)
            }
        }
    }
}

pub struct EventFileManager {
    config: StorageConfig,
    metrics: Arc<MetricsRegistry>,
    current: Mutex<Option<CurrentBatch>>,
    leases: LeaseTable,
    next_lease_token: AtomicU64,
}

impl EventFileManager {
    /// Open the root directory, finalizing batches left open by a previous run
    pub async fn open(config: StorageConfig, metrics: Arc<MetricsRegistry>) -> StorageResult<Self> {
        let manager = Self {
            config,
            metrics,
            current: Mutex::new(None),
            leases: Arc::new(DashMap::new()),
            next_lease_token: AtomicU64::new(1),
        };

        if let Err(e) = fs::create_dir_all(manager.root_dir()).await {
            return Err(manager.record(StorageError::file_operation(manager.root_dir(), e)));
        }
        manager.recover_in_progress().await?;

        Ok(manager)
    }

    pub fn root_dir(&self) -> &Path {
        &self.config.root_dir
    }

    /// Append one serialized event to the current batch.
    ///
    /// On failure the event is dropped and counted; the pipeline keeps going.
    pub async fn append(&self, event: &[u8]) -> StorageResult<()> {
        if event.is_empty() {
            return Err(self.drop_event(StorageError::EmptyEvent));
        }

        let mut current = self.current.lock().await;
        let batch = match current.take() {
            Some(batch) => batch,
            None => self.open_batch().await.map_err(|e| self.drop_event(e))?,
        };
        let batch = current.insert(batch);

        if let Err(e) = batch.append(event, self.config.sync_on_append).await {
            return Err(self.drop_event(StorageError::file_io(&batch.path, e)));
        }

        self.metrics.count(MetricKey::NumEvents);
        Ok(())
    }

    /// Bytes in the open batch, 0 when none is open
    pub async fn current_batch_size(&self) -> u64 {
        self.current
            .lock()
            .await
            .as_ref()
            .map(|batch| batch.size)
            .unwrap_or(0)
    }

    /// Close the open batch and make it eligible for upload.
    ///
    /// Returns `None` when there is nothing to finalize.
    pub async fn finalize_current_batch(&self) -> StorageResult<Option<PendingEventFile>> {
        let mut current = self.current.lock().await;
        let Some(batch) = current.take() else {
            return Ok(None);
        };

        if batch.size == 0 {
            drop(batch.file);
            if let Err(e) = fs::remove_file(&batch.path).await {
                tracing::debug!("Failed to remove empty batch {}: {}", batch.path.display(), e);
            }
            return Ok(None);
        }

        if let Err(e) = batch.file.sync_all().await {
            let err = self.record(StorageError::file_io(&batch.path, e));
            *current = Some(batch);
            return Err(err);
        }

        let CurrentBatch {
            identifier,
            path: part_path,
            file,
            size,
        } = batch;
        drop(file);

        let final_path = self.path_for(&identifier);
        if let Err(e) = fs::rename(&part_path, &final_path).await {
            // The .part stays on disk and is picked up by the next open()
            tracing::warn!(
                "Failed to finalize batch {}, leaving it for recovery: {}",
                identifier,
                e
            );
            return Err(self.record(StorageError::file_operation(&part_path, e)));
        }

        let created = match fs::metadata(&final_path).await {
            Ok(metadata) => creation_time(&metadata),
            Err(_) => SystemTime::now(),
        };

        tracing::debug!("Finalized batch {} ({} bytes)", identifier, size);

        Ok(Some(PendingEventFile {
            identifier,
            path: final_path,
            size,
            created,
        }))
    }

    /// Finalized files not held by an upload, oldest first
    pub async fn list_pending(&self) -> StorageResult<Vec<PendingEventFile>> {
        let root = self.root_dir();
        let mut entries = match fs::read_dir(root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(self.record(StorageError::file_io(root, e))),
        };

        let mut pending = Vec::new();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => return Err(self.record(StorageError::file_io(root, e))),
            };

            let Ok(identifier) = entry.file_name().into_string() else {
                continue;
            };
            if !is_valid_identifier(&identifier) || self.is_claimed(&identifier) {
                continue;
            }

            let metadata = match entry.metadata().await {
                Ok(metadata) => metadata,
                // Deleted between read_dir and stat
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    self.record(StorageError::file_io(&entry.path(), e));
                    continue;
                }
            };
            if !metadata.is_file() {
                continue;
            }

            pending.push(PendingEventFile {
                identifier,
                path: entry.path(),
                size: metadata.len(),
                created: creation_time(&metadata),
            });
        }

        pending.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
        Ok(pending)
    }

    /// Remove a file after its upload was confirmed
    pub async fn delete(&self, identifier: &str) -> StorageResult<()> {
        if !is_valid_identifier(identifier) {
            return Err(self.record(StorageError::InvalidIdentifier(identifier.to_string())));
        }

        let path = self.path_for(identifier);
        match fs::remove_file(&path).await {
            Ok(()) => {
                tracing::debug!("Deleted event file {}", identifier);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(self.record(StorageError::NotFound(identifier.to_string())))
            }
            Err(e) => Err(self.record(StorageError::file_operation(&path, e))),
        }
    }

    /// Take the exclusive upload lease on a file
    pub fn claim(&self, identifier: &str) -> StorageResult<FileLease> {
        if !is_valid_identifier(identifier) {
            return Err(self.record(StorageError::InvalidIdentifier(identifier.to_string())));
        }

        let token = self.next_lease_token.fetch_add(1, Ordering::Relaxed);
        match self.leases.entry(identifier.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(StorageError::AlreadyClaimed(identifier.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(token);
                Ok(FileLease::new(
                    identifier.to_string(),
                    self.path_for(identifier),
                    token,
                    self.leases.clone(),
                ))
            }
        }
    }

    /// Force-release a lease regardless of who holds it
    pub fn release(&self, identifier: &str) {
        self.leases.remove(identifier);
    }

    pub fn is_claimed(&self, identifier: &str) -> bool {
        self.leases.contains_key(identifier)
    }

    /// Read a leased file. Returns the bytes and the size recorded on disk.
    ///
    /// Errors are returned uncounted; the uploader reports them as data corruption.
    pub async fn read_batch(&self, lease: &FileLease) -> StorageResult<(Bytes, u64)> {
        let path = lease.path();
        let metadata = fs::metadata(path).await.map_err(|e| map_read_error(lease, e))?;
        let data = fs::read(path).await.map_err(|e| map_read_error(lease, e))?;
        Ok((Bytes::from(data), metadata.len()))
    }

    fn path_for(&self, identifier: &str) -> PathBuf {
        self.config.root_dir.join(identifier)
    }

    async fn open_batch(&self) -> StorageResult<CurrentBatch> {
        let root = self.root_dir();
        fs::create_dir_all(root)
            .await
            .map_err(|e| StorageError::file_operation(root, e))?;

        let identifier = new_identifier();
        let path = root.join(format!("{}{}", identifier, IN_PROGRESS_SUFFIX));
        let file = OpenOptions::new()
            .create_new(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| StorageError::file_operation(&path, e))?;

        tracing::debug!("Opened batch {}", identifier);

        Ok(CurrentBatch {
            identifier,
            path,
            file,
            size: 0,
        })
    }

    /// Finalize `.part` files left by a crash; remove empty ones
    async fn recover_in_progress(&self) -> StorageResult<()> {
        let root = self.root_dir();
        let mut entries = fs::read_dir(root)
            .await
            .map_err(|e| self.record(StorageError::file_io(root, e)))?;

        let mut recovered = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| self.record(StorageError::file_io(root, e)))?
        {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            let Some(identifier) = name.strip_suffix(IN_PROGRESS_SUFFIX) else {
                continue;
            };
            if !is_valid_identifier(identifier) {
                continue;
            }

            let part_path = entry.path();
            let len = match entry.metadata().await {
                Ok(metadata) => metadata.len(),
                Err(e) => {
                    self.record(StorageError::file_io(&part_path, e));
                    continue;
                }
            };

            let result = if len == 0 {
                fs::remove_file(&part_path).await
            } else {
                fs::rename(&part_path, self.path_for(identifier)).await
            };

            match result {
                Ok(()) if len > 0 => recovered += 1,
                Ok(()) => {}
                Err(e) => {
                    self.record(StorageError::file_operation(&part_path, e));
                }
            }
        }

        if recovered > 0 {
            tracing::info!("Recovered {} unfinished batch(es) in {}", recovered, root.display());
        }
        Ok(())
    }

    /// Count an error under its category and hand it back
    fn record(&self, err: StorageError) -> StorageError {
        if let Some(key) = err.metric_key() {
            self.metrics.count(key);
        }
        tracing::warn!("Event file error: {}", err);
        err
    }

    fn drop_event(&self, err: StorageError) -> StorageError {
        self.metrics.count(MetricKey::NumEventsDropped);
        self.record(err)
    }
}

fn map_read_error(lease: &FileLease, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::NotFound(lease.identifier().to_string())
    } else {
        StorageError::file_io(lease.path(), e)
    }
}

fn creation_time(metadata: &std::fs::Metadata) -> SystemTime {
    metadata
        .created()
        .or_else(|_| metadata.modified())
        .unwrap_or(UNIX_EPOCH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_manager(dir: &TempDir) -> (EventFileManager, Arc<MetricsRegistry>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let manager = EventFileManager::open(
            StorageConfig::new(dir.path().join("events")),
            metrics.clone(),
        )
        .await
        .unwrap();
        (manager, metrics)
    }

    #[tokio::test]
    async fn test_append_and_finalize() {
        let dir = TempDir::new().unwrap();
        let (manager, metrics) = open_manager(&dir).await;

        manager.append(b"{\"a\":1}\n").await.unwrap();
        manager.append(b"{\"b\":2}\n").await.unwrap();
        assert_eq!(manager.current_batch_size().await, 16);

        // Not offered while still open
        assert!(manager.list_pending().await.unwrap().is_empty());

        let file = manager.finalize_current_batch().await.unwrap().unwrap();
        assert_eq!(file.size, 16);
        assert_eq!(
            std::fs::read(&file.path).unwrap(),
            b"{\"a\":1}\n{\"b\":2}\n".to_vec()
        );
        assert_eq!(metrics.counter(MetricKey::NumEvents), 2);
        assert_eq!(manager.current_batch_size().await, 0);

        let pending = manager.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identifier, file.identifier);
    }

    #[tokio::test]
    async fn test_finalize_without_batch() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        assert!(manager.finalize_current_batch().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_finalized_file_not_mutated_by_later_appends() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        manager.append(b"first").await.unwrap();
        let first = manager.finalize_current_batch().await.unwrap().unwrap();
        manager.append(b"second").await.unwrap();
        let second = manager.finalize_current_batch().await.unwrap().unwrap();

        assert_ne!(first.identifier, second.identifier);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"first".to_vec());
        assert_eq!(std::fs::read(&second.path).unwrap(), b"second".to_vec());
    }

    #[tokio::test]
    async fn test_empty_event_is_dropped() {
        let dir = TempDir::new().unwrap();
        let (manager, metrics) = open_manager(&dir).await;

        let result = manager.append(b"").await;
        assert!(matches!(result, Err(StorageError::EmptyEvent)));
        assert_eq!(metrics.counter(MetricKey::NumEventsDropped), 1);
        assert_eq!(metrics.counter(MetricKey::NumMiscErrors), 1);
        assert_eq!(metrics.counter(MetricKey::NumEvents), 0);
    }

    #[tokio::test]
    async fn test_append_fails_when_root_is_a_file() {
        let dir = TempDir::new().unwrap();
        let (manager, metrics) = open_manager(&dir).await;

        std::fs::remove_dir_all(manager.root_dir()).unwrap();
        std::fs::write(manager.root_dir(), b"not a directory").unwrap();

        let result = manager.append(b"event").await;
        assert!(matches!(result, Err(StorageError::FileOperation { .. })));
        assert_eq!(metrics.counter(MetricKey::NumFileOperationErrors), 1);
        assert_eq!(metrics.counter(MetricKey::NumEventsDropped), 1);
    }

    #[tokio::test]
    async fn test_pending_order_is_oldest_first() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        let mut expected = Vec::new();
        for i in 0..3 {
            manager.append(format!("event-{i}").as_bytes()).await.unwrap();
            let file = manager.finalize_current_batch().await.unwrap().unwrap();
            expected.push(file.identifier);
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let listed: Vec<String> = manager
            .list_pending()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.identifier)
            .collect();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn test_list_skips_foreign_entries() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        std::fs::write(manager.root_dir().join(".DS_Store"), b"x").unwrap();
        std::fs::create_dir(manager.root_dir().join("nested")).unwrap();
        manager.append(b"open batch").await.unwrap();

        assert!(manager.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete() {
        let dir = TempDir::new().unwrap();
        let (manager, metrics) = open_manager(&dir).await;

        manager.append(b"payload").await.unwrap();
        let file = manager.finalize_current_batch().await.unwrap().unwrap();

        manager.delete(&file.identifier).await.unwrap();
        assert!(!file.path.exists());
        assert!(manager.list_pending().await.unwrap().is_empty());

        let again = manager.delete(&file.identifier).await.unwrap_err();
        assert!(again.is_not_found());
        assert_eq!(metrics.counter(MetricKey::NumFileOperationErrors), 1);
    }

    #[tokio::test]
    async fn test_delete_rejects_path_traversal() {
        let dir = TempDir::new().unwrap();
        let (manager, metrics) = open_manager(&dir).await;

        let result = manager.delete("../outside").await;
        assert!(matches!(result, Err(StorageError::InvalidIdentifier(_))));
        assert_eq!(metrics.counter(MetricKey::NumMiscErrors), 1);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        manager.append(b"payload").await.unwrap();
        let file = manager.finalize_current_batch().await.unwrap().unwrap();

        let lease = manager.claim(&file.identifier).unwrap();
        assert!(manager.is_claimed(&file.identifier));
        assert!(matches!(
            manager.claim(&file.identifier),
            Err(StorageError::AlreadyClaimed(_))
        ));
        assert!(manager.list_pending().await.unwrap().is_empty());

        drop(lease);
        assert!(!manager.is_claimed(&file.identifier));
        assert_eq!(manager.list_pending().await.unwrap().len(), 1);

        let lease = manager.claim(&file.identifier).unwrap();
        lease.release();
        manager.claim(&file.identifier).unwrap();
    }

    #[tokio::test]
    async fn test_stale_lease_drop_keeps_new_claim() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        let stale = manager.claim("batch-1").unwrap();
        manager.release("batch-1");
        let _fresh = manager.claim("batch-1").unwrap();

        drop(stale);
        assert!(manager.is_claimed("batch-1"));
    }

    #[tokio::test]
    async fn test_read_batch() {
        let dir = TempDir::new().unwrap();
        let (manager, _) = open_manager(&dir).await;

        manager.append(b"0123456789").await.unwrap();
        let file = manager.finalize_current_batch().await.unwrap().unwrap();

        let lease = manager.claim(&file.identifier).unwrap();
        let (data, on_disk) = manager.read_batch(&lease).await.unwrap();
        assert_eq!(&data[..], b"0123456789");
        assert_eq!(on_disk, 10);

        std::fs::remove_file(&file.path).unwrap();
        assert!(matches!(
            manager.read_batch(&lease).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recovers_unfinished_batches() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("events");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("0000000000001-000000-a.part"), b"left over").unwrap();
        std::fs::write(root.join("0000000000002-000000-b.part"), b"").unwrap();

        let metrics = Arc::new(MetricsRegistry::new());
        let manager = EventFileManager::open(StorageConfig::new(&root), metrics)
            .await
            .unwrap();

        let pending = manager.list_pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].identifier, "0000000000001-000000-a");
        assert_eq!(std::fs::read(&pending[0].path).unwrap(), b"left over".to_vec());
        assert!(!root.join("0000000000002-000000-b.part").exists());
    }
}
