//! Event file uploader
//!
//! Sends one finalized event file per HTTP request. Each call to
//! [`EventFileUploader::upload`] is exactly one attempt: the caller owns the
//! retry cadence. Concurrency across files is bounded by a semaphore; the
//! file manager's lease keeps a single file to one attempt at a time.

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::header::CONTENT_TYPE;
use reqwest::{StatusCode, Url};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;

use crate::metrics::{MetricKey, MetricsRegistry};
use crate::storage::{EventFileManager, FileLease, PendingEventFile, StorageError};
use crate::upload::error::{UploadError, UploadResult};
use crate::upload::types::{DrainSummary, UploadOutcome, UploaderConfig};

#[derive(Clone)]
pub struct EventFileUploader {
    config: Arc<UploaderConfig>,
    endpoint: Url,
    client: reqwest::Client,
    manager: Arc<EventFileManager>,
    metrics: Arc<MetricsRegistry>,
    permits: Arc<Semaphore>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl EventFileUploader {
    pub fn new(
        config: UploaderConfig,
        manager: Arc<EventFileManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> UploadResult<Self> {
        let endpoint = config.validate()?;

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.as_str())
            .build()?;

        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            permits: Arc::new(Semaphore::new(config.max_concurrent_uploads)),
            config: Arc::new(config),
            endpoint,
            client,
            manager,
            metrics,
            shutdown: Arc::new(shutdown),
        })
    }

    pub fn config(&self) -> &UploaderConfig {
        &self.config
    }

    /// Make one upload attempt for a finalized file.
    ///
    /// `Ok` carries the outcome of the attempt, including network and HTTP
    /// failures; `Err` means no attempt was made.
    pub async fn upload(&self, identifier: &str, path: &Path) -> UploadResult<UploadOutcome> {
        if path.file_name().and_then(|name| name.to_str()) != Some(identifier) {
            self.metrics.count(MetricKey::NumMiscErrors);
            return Err(UploadError::PathMismatch {
                identifier: identifier.to_string(),
                path: path.display().to_string(),
            });
        }

        let lease = match self.manager.claim(identifier) {
            Ok(lease) => lease,
            Err(StorageError::AlreadyClaimed(id)) => {
                tracing::debug!("Skipping {}: upload already in flight", id);
                return Err(UploadError::AlreadyInFlight(id));
            }
            Err(e) => return Err(e.into()),
        };

        let mut shutdown_rx = self.shutdown.subscribe();
        if *shutdown_rx.borrow_and_update() {
            return Err(UploadError::Cancelled(identifier.to_string()));
        }

        self.attempt(&lease, &mut shutdown_rx).await
        // lease dropped here, on every path
    }

    pub async fn upload_file(&self, file: &PendingEventFile) -> UploadResult<UploadOutcome> {
        self.upload(&file.identifier, &file.path).await
    }

    /// Run one attempt on the runtime without waiting for it
    pub fn spawn_upload(
        &self,
        file: PendingEventFile,
    ) -> JoinHandle<UploadResult<UploadOutcome>> {
        let uploader = self.clone();
        tokio::spawn(async move { uploader.upload_file(&file).await })
    }

    /// One pass over every pending file, oldest first
    pub async fn drain(&self) -> UploadResult<DrainSummary> {
        let pending = self.manager.list_pending().await?;
        if pending.is_empty() {
            return Ok(DrainSummary::default());
        }

        tracing::info!("Draining {} pending event file(s)", pending.len());

        let summary = stream::iter(pending)
            .map(|file| async move { self.upload_file(&file).await })
            .buffer_unordered(self.config.max_concurrent_uploads)
            .fold(DrainSummary::default(), |mut summary, result| async move {
                summary.record(&result);
                summary
            })
            .await;

        tracing::info!(
            uploaded = summary.uploaded,
            retained = summary.retained(),
            skipped = summary.skipped,
            "Drain finished"
        );
        Ok(summary)
    }

    /// Cancel in-flight and future attempts. Cancelled files stay on disk.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
    }

    pub fn is_shut_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Shutdown can interrupt the wait for a permit and the HTTP exchange.
    /// Once a 2xx is in hand the delete and measure always run.
    async fn attempt(
        &self,
        lease: &FileLease,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> UploadResult<UploadOutcome> {
        let identifier = lease.identifier();
        let _permit = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => return Err(cancelled(identifier)),
            permit = self.permits.acquire() => {
                permit.map_err(|_| UploadError::Cancelled(identifier.to_string()))?
            }
        };

        let data = match self.manager.read_batch(lease).await {
            Ok((data, on_disk)) if data.is_empty() => {
                let reason = format!("empty file ({on_disk} bytes on disk)");
                return Ok(self.corrupted(identifier, reason));
            }
            Ok((data, on_disk)) if data.len() as u64 != on_disk => {
                return Ok(self.corrupted(
                    identifier,
                    format!("read {} bytes, expected {}", data.len(), on_disk),
                ));
            }
            Ok((data, _)) => data,
            Err(e) => return Ok(self.corrupted(identifier, e.to_string())),
        };

        let bytes = data.len() as u64;
        self.metrics.count(MetricKey::NumUploads);
        tracing::debug!("Uploading {} ({} bytes) to {}", identifier, bytes, self.endpoint);

        let sent = tokio::select! {
            biased;
            _ = wait_for_shutdown(shutdown_rx) => return Err(cancelled(identifier)),
            sent = self.send(data) => sent,
        };

        match sent {
            Err(e) => {
                self.metrics.count(MetricKey::NumNetworkErrors);
                let reason = if e.is_timeout() {
                    format!("timed out after {:?}", self.config.timeout)
                } else {
                    e.to_string()
                };
                tracing::warn!("Upload of {} failed, file kept: {}", identifier, reason);
                Ok(UploadOutcome::NetworkError { reason })
            }
            Ok((status, _)) if !status.is_success() => {
                self.metrics.count(MetricKey::NumHttpErrors);
                tracing::warn!("Collector rejected {} with {}, file kept", identifier, status);
                Ok(UploadOutcome::HttpError {
                    status: status.as_u16(),
                })
            }
            Ok((status, response)) => {
                self.metrics.count(MetricKey::NumUploadsSucceeded);
                tracing::debug!(
                    "Uploaded {} ({}), {} response bytes",
                    identifier,
                    status,
                    response.len()
                );
                if let Err(e) = self.manager.delete(identifier).await {
                    // Already counted by the manager; a missing file is as good as deleted
                    tracing::debug!("Post-upload delete of {}: {}", identifier, e);
                }
                self.metrics.measure(MetricKey::RecordSize, bytes as f64);
                Ok(UploadOutcome::Uploaded { bytes })
            }
        }
    }

    /// One HTTP exchange. Resolves to the status and the full response body.
    async fn send(&self, body: Bytes) -> Result<(StatusCode, Bytes), reqwest::Error> {
        let mut request = self
            .client
            .request(self.config.method.as_reqwest(), self.endpoint.clone())
            .header(CONTENT_TYPE, self.config.content_type.as_str())
            .body(body);
        if let Some(ref key) = self.config.api_key {
            request = request.basic_auth(key, None::<&str>);
        }

        let response = request.send().await?;
        let status = response.status();
        let body = response.bytes().await?;
        Ok((status, body))
    }

    fn corrupted(&self, identifier: &str, reason: String) -> UploadOutcome {
        self.metrics.count(MetricKey::NumDataCorruptionErrors);
        tracing::warn!("Event file {} is unreadable, skipping: {}", identifier, reason);
        UploadOutcome::Corrupted { reason }
    }
}

fn cancelled(identifier: &str) -> UploadError {
    tracing::warn!("Upload of {} cancelled, file kept", identifier);
    UploadError::Cancelled(identifier.to_string())
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: nobody can cancel any more
        std::future::pending::<()>().await;
    }
}
