//! # nox-core
//!
//! Instance lifecycle engine for nox, a single-host VM manager built on
//! libvirt and QEMU.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                      NoxManager                          │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  Orchestrator   │────▶│  Registry                │   │
//! │  │  - create()     │     │  instances/<name>/*.json │   │
//! │  │  - stop()       │     └──────────────────────────┘   │
//! │  │  - resize()     │     ┌──────────────────────────┐   │
//! │  │  - delete()     │────▶│  ImageCache              │   │
//! │  └─────────────────┘     │  images/<os>-<arch>      │   │
//! │     │          ▲         └──────────────────────────┘   │
//! │     │          │                                         │
//! │     │   ┌─────────────────┐     ┌───────────────────┐   │
//! │     │   │  BackupEngine   │────▶│  RemoteStore (S3) │   │
//! │     │   └─────────────────┘     └───────────────────┘   │
//! │     ▼                                                    │
//! │  ┌─────────────────┐     ┌──────────────────────────┐   │
//! │  │  ControlPlane   │◀────│  NetworkLocator          │   │
//! │  │  (nox-vm)       │     │  leases, then ARP        │   │
//! │  └─────────────────┘     └──────────────────────────┘   │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use nox_core::{ConfigStore, CreateRequest, NoxManager, Paths};
//!
//! # async fn example() -> nox_core::Result<()> {
//! let paths = Paths::from_env()?;
//! let store = ConfigStore::load(paths.config_file())?;
//! let nox = NoxManager::open(paths, store.config().clone())?;
//!
//! let request = CreateRequest {
//!     cpus: Some(0.5),
//!     ram: Some(2048.0),
//!     ..CreateRequest::new("web-01")
//! };
//! let (record, password) = nox.orchestrator().create(request).await?;
//! println!("{} is {}; password {}", record.name, record.state, password.expose());
//!
//! let ip = nox.locator().wait_for_address(&record).await?;
//! println!("ssh nox@{ip}");
//!
//! nox.backups().backup("web-01").await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Features
//!
//! - **Lifecycle**: create, start, stop, restart, resize, delete, autostart
//! - **Images**: verified, shared base images with reference counts
//! - **Provisioning**: cloud-init user-data, meta-data and network-config
//! - **Networking**: DHCP lease lookup with an ARP fallback
//! - **Backups**: live snapshots to `tar.gz`, mirrored to S3-compatible storage

mod backup;
mod config;
mod error;
mod images;
mod instance;
mod keys;
mod lifecycle;
mod lock;
mod manager;
mod network;
mod provision;
mod registry;
mod remote;
mod resources;
mod retry;
mod secret;

pub use backup::{
    archive_id, parse_archive_name, BackupEngine, BackupManifest, BackupOrigin, BackupOutcome,
    BackupRecord, RestoreOutcome, RestoreRequest, ARCHIVE_SUFFIX, FORMAT_VERSION,
};
pub use config::{
    ConfigStore, Defaults, Minimums, NetworkSettings, NoxConfig, Paths, RemoteConfig,
};
pub use error::{CoreError, Result};
pub use images::{
    find_checksum, host_arch, ByteStream, Catalog, CatalogEntry, DigestAlgorithm, Fetcher,
    HttpFetcher, ImageCache, ImageEntry, ImageKey, ResolvedImage,
};
pub use instance::{
    generate_mac, validate_name, InstanceRecord, InstanceState, StaticAddress, MAX_NAME_LEN,
};
pub use keys::HostKey;
pub use lifecycle::{CreateRequest, Orchestrator, DISK_FILE, SEED_FILE};
pub use manager::{Adapters, NoxManager};
pub use network::NetworkLocator;
pub use provision::{
    build as build_provisioning, resolve_scripts, LaunchScript, ProvisionInput,
    ProvisioningBundle, GUEST_SCRIPT_DIR, GUEST_USER,
};
pub use registry::{Registry, RECORD_FILE};
pub use remote::{ObjectStoreRemote, RemoteObject, RemoteStore};
pub use resources::{
    resolve_value, HostResources, ResizeRequest, ResolvedResize, ResolvedResources,
    ResourceRequest, ResourceResolver,
};
pub use retry::{retry_with_backoff, RetryPolicy};
pub use secret::{Secret, PASSWORD_LEN};
