//! Per-file exclusive leases
//!
//! A lease marks an event file as owned by one in-flight upload. Dropping the
//! lease releases it, so a cancelled upload future can never strand a file.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Identifier -> token of the lease currently holding it
pub(crate) type LeaseTable = Arc<DashMap<String, u64>>;

#[derive(Debug)]
pub struct FileLease {
    identifier: String,
    path: PathBuf,
    token: u64,
    table: LeaseTable,
}

impl FileLease {
    pub(crate) fn new(identifier: String, path: PathBuf, token: u64, table: LeaseTable) -> Self {
        Self {
            identifier,
            path,
            token,
            table,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release now instead of at drop
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for FileLease {
    fn drop(&mut self) {
        // Only clear our own entry; a forced release may have let someone else claim it since
        self.table
            .remove_if(&self.identifier, |_, token| *token == self.token);
    }
}
