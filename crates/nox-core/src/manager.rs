//! Wires the engine together for one data directory.

use crate::backup::BackupEngine;
use crate::config::{NoxConfig, Paths};
use crate::error::Result;
use crate::images::{Catalog, Fetcher, HttpFetcher, ImageCache};
use crate::keys::HostKey;
use crate::lifecycle::Orchestrator;
use crate::network::NetworkLocator;
use crate::registry::Registry;
use crate::remote::{ObjectStoreRemote, RemoteStore};
use crate::resources::{HostResources, ResourceResolver};
use nox_vm::{
    ControlPlane, DiskTool, NeighborTable, ProcArpTable, QemuDiskTool, VirshControlPlane,
};
use std::sync::Arc;
use std::time::Duration;

/// Host-side adapters the engine runs against.
pub struct Adapters {
    pub control: Arc<dyn ControlPlane>,
    pub disks: Arc<dyn DiskTool>,
    pub neighbors: Arc<dyn NeighborTable>,
    pub fetcher: Arc<dyn Fetcher>,
    pub remote: Option<Arc<dyn RemoteStore>>,
}

impl Adapters {
    /// libvirt, qemu-img, `/proc/net/arp`, HTTPS and (when configured) S3.
    pub fn production(config: &NoxConfig) -> Result<Self> {
        let remote = match &config.remote {
            Some(remote) => {
                Some(Arc::new(ObjectStoreRemote::from_config(remote)?) as Arc<dyn RemoteStore>)
            }
            None => None,
        };
        Ok(Self {
            control: Arc::new(VirshControlPlane::new(
                &config.libvirt_uri,
                config.call_timeout(),
            )),
            disks: Arc::new(QemuDiskTool::new(config.disk_timeout())),
            neighbors: Arc::new(ProcArpTable::new()),
            fetcher: Arc::new(HttpFetcher::new(
                Duration::from_secs(config.connect_timeout_secs),
                Duration::from_secs(config.read_timeout_secs),
            )?),
            remote,
        })
    }
}

/// Entry point for the CLI: lifecycle, network and backup operations over
/// one data directory.
pub struct NoxManager {
    paths: Paths,
    orchestrator: Arc<Orchestrator>,
    locator: NetworkLocator,
    backups: BackupEngine,
}

impl NoxManager {
    /// Open `paths` with the production adapters.
    pub fn open(paths: Paths, config: NoxConfig) -> Result<Self> {
        let adapters = Adapters::production(&config)?;
        Self::with_adapters(paths, config, adapters)
    }

    pub fn with_adapters(paths: Paths, config: NoxConfig, adapters: Adapters) -> Result<Self> {
        config.validate()?;
        paths.ensure()?;

        let key = HostKey::load_or_generate(&paths.ssh())?;
        let images = Arc::new(ImageCache::new(
            paths.images(),
            Catalog::with_overrides(&config.images),
            adapters.fetcher,
        ));
        let host = HostResources::detect(paths.root());
        let resolver = ResourceResolver::new(host, config.minimums.clone());
        let registry = Registry::new(paths.clone());

        let locator = NetworkLocator::new(
            adapters.control.clone(),
            adapters.neighbors,
            registry.clone(),
            config.network.clone(),
            config.call_retry.clone(),
            config.boot_wait.clone(),
        );
        let orchestrator = Arc::new(Orchestrator::new(
            config,
            registry,
            images,
            adapters.control,
            adapters.disks,
            key,
            resolver,
        ));
        let backups = BackupEngine::new(orchestrator.clone(), adapters.remote);

        Ok(Self {
            paths,
            orchestrator,
            locator,
            backups,
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn config(&self) -> &NoxConfig {
        self.orchestrator.config()
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn locator(&self) -> &NetworkLocator {
        &self.locator
    }

    pub fn backups(&self) -> &BackupEngine {
        &self.backups
    }

    pub fn images(&self) -> &ImageCache {
        self.orchestrator.images()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Defaults;
    use crate::images::tests::{test_catalog, FakeFetcher};
    use crate::images::{CatalogEntry, DigestAlgorithm};
    use crate::lifecycle::CreateRequest;
    use crate::retry::RetryPolicy;
    use nox_vm::fake::{FakeControlPlane, FakeDiskTool, FakeNeighborTable};
    use sha2::{Digest, Sha256};
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn test_create_then_locate() {
        let dir = tempfile::tempdir().unwrap();
        let body = b"image";
        let digest = hex::encode(Sha256::digest(body));
        let fetcher = FakeFetcher::default();
        fetcher.serve("https://images.test/test-os-amd64.qcow2", body.to_vec());
        fetcher.serve("https://images.test/test-os-arm64.qcow2", body.to_vec());
        fetcher.serve(
            "https://images.test/SHA256SUMS",
            format!("{digest}  test-os-amd64.qcow2\n{digest}  test-os-arm64.qcow2\n"),
        );
        let control = Arc::new(FakeControlPlane::new());

        let mut config = NoxConfig {
            defaults: Defaults {
                os: "testos".into(),
                ram: 256.0,
                ..Default::default()
            },
            boot_wait: RetryPolicy::immediate(2),
            ..Default::default()
        };
        config.network.probe_interval_ms = 0;
        let testos: CatalogEntry = test_catalog().entries()["testos"].clone();
        assert_eq!(testos.algorithm, DigestAlgorithm::Sha256);
        config.images.insert("testos".into(), testos);

        let nox = NoxManager::with_adapters(
            nox_paths(dir.path()),
            config,
            Adapters {
                control: control.clone(),
                disks: Arc::new(FakeDiskTool::new()),
                neighbors: Arc::new(FakeNeighborTable::new()),
                fetcher: Arc::new(fetcher),
                remote: None,
            },
        )
        .unwrap();
        assert!(nox.paths().ssh().join("id_ed25519").exists());

        let (record, _) = nox
            .orchestrator()
            .create(CreateRequest::new("vm1"))
            .await
            .unwrap();
        assert_eq!(record.ram_mb, 256);

        let err = nox.locator().wait_for_address(&record).await.unwrap_err();
        assert!(matches!(err, crate::CoreError::NetworkTimeout { .. }));

        let ip = Ipv4Addr::new(192, 168, 122, 50);
        control.add_lease("default", &record.mac, ip);
        assert_eq!(nox.locator().wait_for_address(&record).await.unwrap(), ip);
        assert_eq!(nox.locator().refresh("vm1").await.unwrap(), Some(ip));
        assert_eq!(
            nox.orchestrator().registry().require("vm1").unwrap().last_ip,
            Some(ip)
        );
    }

    fn nox_paths(root: &std::path::Path) -> Paths {
        Paths::new(root.join(".nox"))
    }

    #[test]
    fn test_invalid_config_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config = NoxConfig {
            call_timeout_secs: 0,
            ..Default::default()
        };
        let adapters = Adapters {
            control: Arc::new(FakeControlPlane::new()),
            disks: Arc::new(FakeDiskTool::new()),
            neighbors: Arc::new(FakeNeighborTable::new()),
            fetcher: Arc::new(FakeFetcher::default()),
            remote: None,
        };
        assert!(NoxManager::with_adapters(nox_paths(dir.path()), config, adapters).is_err());
        assert!(!dir.path().join(".nox").exists());
    }
}
