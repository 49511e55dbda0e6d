//! Instance Registry: one JSON manifest per instance directory.
//!
//! Writes go through a temporary file and a rename, so readers see either
//! the old or the new record. State and resource fields are written only by
//! the lifecycle and backup code (crate-private `put`/`remove`); the network
//! locator may only touch `last_ip`.

use crate::config::{write_json_atomic, Paths};
use crate::error::{CoreError, Result};
use crate::instance::InstanceRecord;
use crate::lock::{KeyGuard, KeyedLocks};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

/// Manifest file name inside each instance directory.
pub const RECORD_FILE: &str = "instance.json";

/// Clones share one set of per-name locks.
#[derive(Debug, Clone)]
pub struct Registry {
    paths: Paths,
    locks: Arc<KeyedLocks<String>>,
}

impl Registry {
    pub fn new(paths: Paths) -> Self {
        Self {
            paths,
            locks: Arc::new(KeyedLocks::new()),
        }
    }

    /// Exclusive access to one instance name. Held by every lifecycle and
    /// backup operation for its whole duration.
    pub(crate) async fn lock(&self, name: &str) -> KeyGuard {
        self.locks.lock(&name.to_string()).await
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    fn record_path(&self, name: &str) -> PathBuf {
        self.paths.instance_dir(name).join(RECORD_FILE)
    }

    /// Read one record.
    pub fn get(&self, name: &str) -> Result<Option<InstanceRecord>> {
        match std::fs::read(self.record_path(name)) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read one record or fail with `NotFound`.
    pub fn require(&self, name: &str) -> Result<InstanceRecord> {
        self.get(name)?
            .ok_or_else(|| CoreError::NotFound(format!("instance {name}")))
    }

    pub fn exists(&self, name: &str) -> bool {
        self.record_path(name).exists()
    }

    /// All records, sorted by name. Unreadable manifests are skipped.
    pub fn list(&self) -> Result<Vec<InstanceRecord>> {
        let dir = self.paths.instances();
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            match self.get(&name) {
                Ok(Some(record)) => records.push(record),
                Ok(None) => {}
                Err(e) => tracing::warn!(instance = %name, error = %e, "Skipping unreadable record"),
            }
        }
        records.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(records)
    }

    /// Write a record.
    pub(crate) fn put(&self, record: &InstanceRecord) -> Result<()> {
        write_json_atomic(&self.record_path(&record.name), record)?;
        tracing::trace!(instance = %record.name, state = %record.state, "Record written");
        Ok(())
    }

    /// Delete a record's manifest.
    pub(crate) fn remove(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.record_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Update only the last known address. Waits for any running operation
    /// on `name`, so a concurrent resize or stop is never overwritten.
    pub async fn set_last_ip(&self, name: &str, ip: Option<Ipv4Addr>) -> Result<()> {
        let _lock = self.lock(name).await;
        let mut record = self.require(name)?;
        if record.last_ip == ip {
            return Ok(());
        }
        record.last_ip = ip;
        write_json_atomic(&self.record_path(name), &record)
    }
}
