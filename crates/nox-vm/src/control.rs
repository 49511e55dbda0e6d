//! Narrow interfaces to the host's virtualization tooling.
//!
//! `nox-core` only ever talks to the host through these traits, so the
//! lifecycle, backup and network logic can run against the in-memory
//! adapters in [`crate::fake`].

use crate::config::InstanceDefinition;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

/// Power state reported by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainState {
    Running,
    Paused,
    ShuttingDown,
    Shutoff,
    Crashed,
    Other,
}

impl DomainState {
    /// Parse `virsh domstate` output.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "running" | "idle" => Self::Running,
            "paused" | "pmsuspended" => Self::Paused,
            "in shutdown" => Self::ShuttingDown,
            "shut off" => Self::Shutoff,
            "crashed" => Self::Crashed,
            _ => Self::Other,
        }
    }

    /// Whether the guest is consuming resources.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::Paused | Self::ShuttingDown)
    }
}

impl fmt::Display for DomainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::ShuttingDown => write!(f, "in shutdown"),
            Self::Shutoff => write!(f, "shut off"),
            Self::Crashed => write!(f, "crashed"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// One row of a DHCP lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub mac: String,
    pub ip: Ipv4Addr,
    pub hostname: Option<String>,
}

/// One row of the host neighbor (ARP) table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    pub mac: String,
    pub device: String,
}

/// Instance-level operations against the virtualization daemon.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Register a persistent definition. Not idempotent.
    async fn define(&self, def: &InstanceDefinition) -> Result<()>;

    /// Remove the definition. `NotDefined` if absent.
    async fn undefine(&self, name: &str) -> Result<()>;

    /// Power on.
    async fn start(&self, name: &str) -> Result<()>;

    /// Ask the guest to shut down (ACPI). Returns immediately.
    async fn shutdown(&self, name: &str) -> Result<()>;

    /// Hard power-off.
    async fn destroy(&self, name: &str) -> Result<()>;

    /// Current power state, `None` when the instance is not defined.
    async fn state(&self, name: &str) -> Result<Option<DomainState>>;

    /// Change vcpu/memory in the persistent definition (next boot).
    async fn set_resources(&self, name: &str, vcpus: u32, memory_mib: u64) -> Result<()>;

    /// Toggle start-on-host-boot.
    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()>;

    /// Grow an attached disk of a running instance.
    async fn resize_disk(&self, name: &str, target: &str, size_gb: u64) -> Result<()>;

    /// Redirect guest writes on `target` into a new external overlay,
    /// freezing the current image (crash-consistent, disk-only).
    async fn snapshot(&self, name: &str, target: &str, overlay: &Path) -> Result<()>;

    /// Merge the active overlay on `target` back into its backing image and
    /// pivot the guest onto it.
    async fn block_commit(&self, name: &str, target: &str) -> Result<()>;

    /// DHCP leases handed out on a virtual network.
    async fn net_leases(&self, network: &str) -> Result<Vec<Lease>>;
}

/// Image-level operations (qcow2 and the provisioning ISO).
#[async_trait]
pub trait DiskTool: Send + Sync {
    /// Create a copy-on-write overlay of `base` with the given virtual size.
    async fn create_overlay(&self, base: &Path, dest: &Path, size_gb: u64) -> Result<()>;

    /// Grow an image that is not in use.
    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()>;

    /// Write a standalone copy of `src` holding only allocated clusters.
    async fn export(&self, src: &Path, dest: &Path) -> Result<()>;

    /// Build a `cidata` ISO from `(file name, contents)` pairs.
    async fn build_seed(&self, files: &[(&str, &str)], dest: &Path) -> Result<()>;
}

/// Host neighbor table and the probe used to populate it.
#[async_trait]
pub trait NeighborTable: Send + Sync {
    /// Send a cheap probe toward `target` to provoke ARP traffic.
    async fn probe(&self, target: Ipv4Addr) -> Result<()>;

    /// Current neighbor entries.
    async fn entries(&self) -> Result<Vec<NeighborEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_state_parse() {
        assert_eq!(DomainState::parse("running\n"), DomainState::Running);
        assert_eq!(DomainState::parse("shut off"), DomainState::Shutoff);
        assert_eq!(DomainState::parse("in shutdown"), DomainState::ShuttingDown);
        assert_eq!(DomainState::parse("weird"), DomainState::Other);
    }

    #[test]
    fn test_domain_state_active() {
        assert!(DomainState::Running.is_active());
        assert!(DomainState::ShuttingDown.is_active());
        assert!(!DomainState::Shutoff.is_active());
        assert!(!DomainState::Crashed.is_active());
    }
}
