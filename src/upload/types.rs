use crate::upload::error::{UploadError, UploadResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP method used to deliver a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum UploadMethod {
    #[default]
    Post,
    Put,
}

impl UploadMethod {
    pub fn as_reqwest(self) -> reqwest::Method {
        match self {
            UploadMethod::Post => reqwest::Method::POST,
            UploadMethod::Put => reqwest::Method::PUT,
        }
    }
}

/// Uploader configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploaderConfig {
    /// Collector URL receiving one request per event file
    pub endpoint: String,

    pub method: UploadMethod,

    /// Bound on a whole exchange, request and response body included
    pub timeout: Duration,

    /// Uploads allowed in flight at once
    pub max_concurrent_uploads: usize,

    pub content_type: String,

    /// Sent as the basic-auth user name when set
    pub api_key: Option<String>,

    pub user_agent: String,
}

impl Default for UploaderConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8080/v1/events".to_string(),
            method: UploadMethod::Post,
            timeout: Duration::from_secs(30),
            max_concurrent_uploads: num_cpus::get().clamp(1, 8),
            content_type: "application/json".to_string(),
            api_key: None,
            user_agent: format!("event-uplink/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl UploaderConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    pub fn method(mut self, method: UploadMethod) -> Self {
        self.method = method;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn max_concurrent_uploads(mut self, max: usize) -> Self {
        self.max_concurrent_uploads = max;
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.api_key = Some(key.into());
        self
    }

    pub fn validate(&self) -> UploadResult<reqwest::Url> {
        if self.max_concurrent_uploads == 0 {
            return Err(UploadError::InvalidConfig(
                "max_concurrent_uploads must be at least 1".into(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(UploadError::InvalidConfig("timeout must be non-zero".into()));
        }
        reqwest::Url::parse(&self.endpoint)
            .map_err(|e| UploadError::InvalidConfig(format!("endpoint {}: {}", self.endpoint, e)))
    }
}

/// Result of one upload attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// 2xx received; the file was deleted
    Uploaded { bytes: u64 },

    /// Non-2xx response; the file was kept
    HttpError { status: u16 },

    /// Transport failure or timeout; the file was kept
    NetworkError { reason: String },

    /// File unreadable or of unexpected size; nothing was sent
    Corrupted { reason: String },
}

impl UploadOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UploadOutcome::Uploaded { .. })
    }

    /// Whether the file is still on disk for a later attempt
    pub fn file_retained(&self) -> bool {
        !self.is_success()
    }
}

/// Tally of one pass over the pending files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainSummary {
    pub uploaded: usize,
    pub bytes_uploaded: u64,
    pub http_errors: usize,
    pub network_errors: usize,
    pub corrupted: usize,
    /// Files another upload was already holding
    pub skipped: usize,
    pub cancelled: usize,
    pub failed: usize,
}

impl DrainSummary {
    pub(crate) fn record(&mut self, result: &UploadResult<UploadOutcome>) {
        match result {
            Ok(UploadOutcome::Uploaded { bytes }) => {
                self.uploaded += 1;
                self.bytes_uploaded += bytes;
            }
            Ok(UploadOutcome::HttpError { .. }) => self.http_errors += 1,
            Ok(UploadOutcome::NetworkError { .. }) => self.network_errors += 1,
            Ok(UploadOutcome::Corrupted { .. }) => self.corrupted += 1,
            Err(UploadError::AlreadyInFlight(_)) => self.skipped += 1,
            Err(UploadError::Cancelled(_)) => self.cancelled += 1,
            Err(_) => self.failed += 1,
        }
    }

    /// Files still pending after the pass
    pub fn retained(&self) -> usize {
        self.http_errors + self.network_errors + self.corrupted + self.cancelled + self.failed
    }
}
