//! Resource Resolver: turns fractional or absolute requests into concrete
//! vcpu, memory and disk sizes.
//!
//! A value ≤ 1.0 is a share of the host (`round(total * value)`, floored to
//! the configured minimum); anything larger is an absolute amount
//! (`floor(value)`).

use crate::config::Minimums;
use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

/// Host capacity used to resolve fractional requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostResources {
    pub cpus: u32,
    pub memory_mb: u64,
    /// Capacity of the filesystem holding the data directory
    pub disk_gb: u64,
}

impl HostResources {
    /// Probe the host. `data_dir` selects which filesystem counts for disk.
    pub fn detect(data_dir: &Path) -> Self {
        let mut sys = System::new();
        sys.refresh_cpu();
        sys.refresh_memory();

        let cpus = (sys.cpus().len() as u32).max(1);
        let memory_mb = sys.total_memory() / (1024 * 1024);
        let disk_gb = disk_capacity(data_dir) / (1024 * 1024 * 1024);

        let host = Self {
            cpus,
            memory_mb,
            disk_gb,
        };
        tracing::debug!(?host, "Detected host resources");
        host
    }
}

/// Total bytes of the disk whose mount point is the longest prefix of `path`.
fn disk_capacity(path: &Path) -> u64 {
    let path: PathBuf = std::fs::canonicalize(path)
        .or_else(|_| std::env::current_dir().map(|cwd| cwd.join(path)))
        .unwrap_or_else(|_| path.to_path_buf());
    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| path.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.total_space())
        .unwrap_or(0)
}

/// Requested sizes; each is a fraction of the host or an absolute amount.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub cpus: f64,
    /// MB when absolute
    pub ram: f64,
    /// GB when absolute
    pub disk: f64,
}

/// Concrete sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedResources {
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
}

/// Partial request used by `resize`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResizeRequest {
    pub cpus: Option<f64>,
    pub ram: Option<f64>,
    pub disk: Option<f64>,
}

impl ResizeRequest {
    pub fn is_empty(&self) -> bool {
        self.cpus.is_none() && self.ram.is_none() && self.disk.is_none()
    }
}

/// Resolved form of a [`ResizeRequest`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResolvedResize {
    pub vcpus: Option<u32>,
    pub ram_mb: Option<u64>,
    pub disk_gb: Option<u64>,
}

/// Resolve one value against a host total.
pub fn resolve_value(what: &str, value: f64, host_total: u64, minimum: u64) -> Result<u64> {
    if !value.is_finite() || value <= 0.0 {
        return Err(CoreError::Validation(format!(
            "{what} must be a positive number, got {value}"
        )));
    }
    if value <= 1.0 {
        let share = (host_total as f64 * value).round() as u64;
        Ok(share.max(minimum))
    } else {
        Ok(value.floor() as u64)
    }
}

/// Applies host totals and minimums to requests.
#[derive(Debug, Clone)]
pub struct ResourceResolver {
    host: HostResources,
    minimums: Minimums,
}

impl ResourceResolver {
    pub fn new(host: HostResources, minimums: Minimums) -> Self {
        Self { host, minimums }
    }

    pub fn host(&self) -> &HostResources {
        &self.host
    }

    pub fn resolve(&self, request: &ResourceRequest) -> Result<ResolvedResources> {
        Ok(ResolvedResources {
            vcpus: self.vcpus(request.cpus)?,
            ram_mb: self.ram_mb(request.ram)?,
            disk_gb: self.disk_gb(request.disk)?,
        })
    }

    pub fn resolve_resize(&self, request: &ResizeRequest) -> Result<ResolvedResize> {
        Ok(ResolvedResize {
            vcpus: request.cpus.map(|v| self.vcpus(v)).transpose()?,
            ram_mb: request.ram.map(|v| self.ram_mb(v)).transpose()?,
            disk_gb: request.disk.map(|v| self.disk_gb(v)).transpose()?,
        })
    }

    fn vcpus(&self, value: f64) -> Result<u32> {
        let n = resolve_value(
            "cpus",
            value,
            self.host.cpus as u64,
            self.minimums.cpus as u64,
        )?;
        u32::try_from(n).map_err(|_| CoreError::Validation(format!("cpus out of range: {n}")))
    }

    fn ram_mb(&self, value: f64) -> Result<u64> {
        resolve_value("ram", value, self.host.memory_mb, self.minimums.ram_mb)
    }

    fn disk_gb(&self, value: f64) -> Result<u64> {
        resolve_value("disk", value, self.host.disk_gb, self.minimums.disk_gb)
    }
}
