use anyhow::Context;
use event_uplink::metrics::{
    start_metrics_server, MetricKey, MetricsConfig, MetricsRegistry, MetricsReporter,
};
use event_uplink::storage::{EventFileManager, StorageConfig};
use event_uplink::upload::{EventFileUploader, UploaderConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Spool stdin lines as events, then make one upload pass.
///
/// Usage: event-uplink [ROOT_DIR] [COLLECTOR_URL] [METRICS_ADDR]
///
/// With METRICS_ADDR the registry is also exported for Prometheus scraping.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let root_dir = args
        .get(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("./event-files"));
    let endpoint = args
        .get(2)
        .cloned()
        .unwrap_or_else(|| UploaderConfig::default().endpoint);

    let metrics = MetricsRegistry::global();
    let reporter = match args.get(3) {
        Some(addr) => {
            let config = MetricsConfig::with_addr(
                addr.parse::<SocketAddr>()
                    .with_context(|| format!("invalid metrics address {}", addr))?,
            );
            start_metrics_server(&config)?;
            Some(MetricsReporter::new(metrics.clone(), &config).spawn())
        }
        None => None,
    };
    let manager = Arc::new(
        EventFileManager::open(StorageConfig::new(&root_dir), metrics.clone())
            .await
            .with_context(|| format!("opening {}", root_dir.display()))?,
    );
    let uploader = EventFileUploader::new(
        UploaderConfig::new(endpoint),
        manager.clone(),
        metrics.clone(),
    )?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let mut event = line.into_bytes();
        event.push(b'\n');
        // Failures are counted and the event dropped
        let _ = manager.append(&event).await;
    }

    if let Some(file) = manager.finalize_current_batch().await? {
        println!("Finalized {} ({} bytes)", file.identifier, file.size);
    }

    let summary = uploader.drain().await?;
    println!(
        "Uploaded {} file(s), {} bytes; {} kept for retry",
        summary.uploaded,
        summary.bytes_uploaded,
        summary.retained()
    );

    // The reporter drains the registry as it publishes, so report its
    // lifetime totals rather than what is left behind.
    let totals = match reporter {
        Some(reporter) => reporter.shutdown().await,
        None => metrics.snapshot(),
    };

    for (key, value) in &totals.counters {
        if *value != 0 {
            println!("  {:<24} {}", key.name(), value);
        }
    }
    let record_size = totals.meter(MetricKey::RecordSize);
    if !record_size.is_empty() {
        println!(
            "  {:<24} count={} mean={:.1}",
            MetricKey::RecordSize.name(),
            record_size.count,
            record_size.mean()
        );
    }

    Ok(())
}
