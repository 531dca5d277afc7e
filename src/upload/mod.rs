//! Upload of finalized event files to the remote collector
//!
//! One HTTP request per file, body = the raw batch bytes, success = 2xx.
//! Successful uploads delete the file; every other outcome keeps it for the
//! caller's next pass.

pub mod error;
pub mod types;
pub mod uploader;

pub use error::{UploadError, UploadResult};
pub use types::{DrainSummary, UploadMethod, UploadOutcome, UploaderConfig};
pub use uploader::EventFileUploader;
