//! Metrics and observability module
//!
//! A fixed registry of counters and meters shared by the file manager and
//! the uploader, plus an exporter that drains it into Prometheus.
//!
//! Counters:
//! - Errors by category (data corruption, file I/O, file operation, HTTP, network, misc)
//! - Events appended and dropped
//! - Uploads attempted and succeeded
//!
//! Meters:
//! - Uploaded record size

pub mod exporter;
pub mod registry;
pub mod types;

pub use exporter::{
    publish, start_metrics_server, MetricsConfig, MetricsError, MetricsReporter,
    MetricsReporterHandle,
};
pub use registry::MetricsRegistry;
pub use types::{Meter, MetricKey, MetricsSnapshot};
