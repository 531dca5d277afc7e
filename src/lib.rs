//! Client-side telemetry pipeline core
//!
//! Serialized events are staged in durable batch files ([`storage`]),
//! uploaded to a remote collector ([`upload`]), and every outcome is
//! recorded in a fixed metrics registry ([`metrics`]).

pub mod metrics;
pub mod storage;
pub mod upload;

pub use crate::metrics::{Meter, MetricKey, MetricsRegistry};
pub use crate::storage::{EventFileManager, PendingEventFile, StorageConfig};
pub use crate::upload::{EventFileUploader, UploadOutcome, UploaderConfig};
