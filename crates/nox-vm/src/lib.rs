//! # nox-vm
//!
//! Control-plane layer for nox.
//! Wraps libvirt (`virsh`), `qemu-img`, `genisoimage` and the host neighbor
//! table behind small async traits.
//!
//! ## Quick Start
//!
//! ```no_run
//! use nox_vm::{ControlPlane, DefinitionBuilder, VirshControlPlane, DEFAULT_URI};
//! use std::time::Duration;
//!
//! # async fn example() -> nox_vm::Result<()> {
//! let control = VirshControlPlane::new(DEFAULT_URI, Duration::from_secs(30));
//!
//! let def = DefinitionBuilder::new("vm1")
//!     .vcpus(2)
//!     .memory_mib(2048)
//!     .root_disk("/home/me/.nox/instances/vm1/disk.qcow2")
//!     .seed("/home/me/.nox/instances/vm1/seed.iso")
//!     .mac("52:54:00:12:34:56")
//!     .build()?;
//!
//! control.define(&def).await?;
//! control.start("vm1").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Definitions**: `DefinitionBuilder` and domain XML rendering
//! - **Control plane**: define, start, stop, resize, snapshot and commit
//! - **Disks**: copy-on-write overlays, exports and provisioning ISOs
//! - **Neighbors**: DHCP leases and ARP table lookups
//! - **Fakes**: in-memory adapters for tests in [`fake`]

mod builder;
mod command;
mod config;
mod control;
mod disk;
mod error;
pub mod fake;
mod neighbor;
mod virsh;

pub use builder::{domain_xml, DefinitionBuilder};
pub use command::Tool;
pub use config::{is_valid_mac, DiskConfig, InstanceDefinition, NetworkAttachment, NetworkConfig};
pub use control::{ControlPlane, DiskTool, DomainState, Lease, NeighborEntry, NeighborTable};
pub use disk::{QemuDiskTool, SEED_LABEL};
pub use error::{Result, VmError};
pub use neighbor::{parse_proc_arp, ProcArpTable};
pub use virsh::{parse_leases, VirshControlPlane, DEFAULT_URI};
