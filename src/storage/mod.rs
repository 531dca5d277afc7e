//! Durable staging of event batches
//!
//! One file per finalized batch under a root directory; the file name is the
//! batch identifier. All filesystem access to that directory goes through
//! [`EventFileManager`].

pub mod error;
pub mod lease;
pub mod manager;
pub mod types;

pub use error::{StorageError, StorageResult};
pub use lease::FileLease;
pub use manager::EventFileManager;
pub use types::{new_identifier, PendingEventFile, StorageConfig};
