//! Prometheus metrics exporter
//!
//! Periodically drains the registry into the `metrics` facade and, when
//! requested, exposes the facade over HTTP for Prometheus scraping.

use crate::metrics::registry::MetricsRegistry;
use crate::metrics::types::{MetricKey, MetricsSnapshot};
use ::metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Global prometheus handle
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

static METRICS_DESCRIBED: AtomicBool = AtomicBool::new(false);

/// Metrics export configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Address to bind the metrics server
    pub listen_addr: SocketAddr,

    /// How often the registry is drained into the exporter
    pub flush_interval: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
            flush_interval: Duration::from_secs(60),
        }
    }
}

impl MetricsConfig {
    /// Create a new config with custom address
    pub fn with_addr(addr: SocketAddr) -> Self {
        Self {
            listen_addr: addr,
            ..Default::default()
        }
    }
}

/// Register descriptions for every key (call once at startup)
pub fn describe_metrics() {
    if METRICS_DESCRIBED.swap(true, Ordering::SeqCst) {
        return;
    }

    for key in MetricKey::COUNTERS {
        describe_counter!(key.metric_name(), key.name());
    }
    for key in MetricKey::METERS {
        describe_gauge!(key.metric_name(), key.name());
    }
}

/// Install the Prometheus recorder and serve it over HTTP.
///
/// Must be called from within a Tokio runtime: the listener is spawned onto
/// it. Only the first call installs; later calls return the existing handle.
pub fn start_metrics_server(
    config: &MetricsConfig,
) -> Result<&'static PrometheusHandle, MetricsError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }

    let runtime = tokio::runtime::Handle::try_current()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;

    let (recorder, exporter) = PrometheusBuilder::new()
        .with_http_listener(config.listen_addr)
        .build()
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;
    let handle = recorder.handle();
    ::metrics::set_global_recorder(recorder)
        .map_err(|e| MetricsError::SetupFailed(e.to_string()))?;

    let listen_addr = config.listen_addr;
    runtime.spawn(async move {
        if let Err(e) = exporter.await {
            tracing::warn!("Metrics listener on {} stopped: {:?}", listen_addr, e);
        }
    });
    tracing::info!("Serving metrics on http://{}/metrics", listen_addr);

    let _ = PROMETHEUS_HANDLE.set(handle);
    describe_metrics();

    PROMETHEUS_HANDLE
        .get()
        .ok_or(MetricsError::NotInitialized)
}

/// Render metrics as a string (for custom endpoints)
pub fn render_metrics() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(|h| h.render())
}

/// Forward a drained snapshot into the `metrics` facade
pub fn publish(snapshot: &MetricsSnapshot) {
    for (key, value) in &snapshot.counters {
        if *value > 0 {
            counter!(key.metric_name()).increment(*value as u64);
        }
    }

    for (key, meter) in &snapshot.meters {
        if meter.is_empty() {
            continue;
        }
        gauge!(key.metric_name(), "stat" => "sum").increment(meter.sum);
        gauge!(key.metric_name(), "stat" => "sumsq").increment(meter.sumsq);
        gauge!(key.metric_name(), "stat" => "count").increment(meter.count as f64);
        gauge!(key.metric_name(), "stat" => "window_mean").set(meter.mean());
    }
}

/// Errors that can occur during metrics setup
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    #[error("Failed to setup metrics: {0}")]
    SetupFailed(String),

    #[error("Metrics not initialized")]
    NotInitialized,
}

/// Background task that drains a registry on a fixed interval
pub struct MetricsReporter {
    registry: Arc<MetricsRegistry>,
    interval: Duration,
}

/// Handle to stop a running reporter
pub struct MetricsReporterHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<MetricsSnapshot>,
}

impl MetricsReporter {
    pub fn new(registry: Arc<MetricsRegistry>, config: &MetricsConfig) -> Self {
        Self {
            registry,
            interval: config.flush_interval,
        }
    }

    /// Drain once and publish. Returns what was published.
    pub fn flush(&self) -> MetricsSnapshot {
        let snapshot = self.registry.take_snapshot();
        if !snapshot.is_empty() {
            publish(&snapshot);
        }
        snapshot
    }

    /// Spawn the flush loop onto the current runtime
    pub fn spawn(self) -> MetricsReporterHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;

            let mut published = MetricsSnapshot::default();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snapshot = self.flush();
                        tracing::trace!(empty = snapshot.is_empty(), "Flushed metrics");
                        published.merge(&snapshot);
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            published.merge(&self.flush());
            tracing::debug!("Metrics reporter stopped");
            published
        });

        MetricsReporterHandle { shutdown_tx, task }
    }
}

impl MetricsReporterHandle {
    /// Stop the loop after a final flush. Returns everything the reporter
    /// published over its lifetime.
    pub async fn shutdown(self) -> MetricsSnapshot {
        let _ = self.shutdown_tx.send(true);
        match self.task.await {
            Ok(published) => published,
            Err(e) => {
                tracing::warn!("Metrics reporter task failed: {}", e);
                MetricsSnapshot::default()
            }
        }
    }
}
