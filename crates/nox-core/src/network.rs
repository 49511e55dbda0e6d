//! Network Locator: finds an instance's IPv4 address.
//!
//! The DHCP lease table of the libvirt network is authoritative. When it
//! has nothing (or the instance sits on a bridge, where libvirt hands out no
//! leases) a broadcast probe is sent and the host neighbor table is scanned
//! for the instance's MAC.

use crate::config::NetworkSettings;
use crate::error::{CoreError, Result};
use crate::instance::InstanceRecord;
use crate::registry::Registry;
use crate::retry::{retry_with_backoff, RetryPolicy};
use nox_vm::{ControlPlane, NeighborTable, NetworkAttachment};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

pub struct NetworkLocator {
    control: Arc<dyn ControlPlane>,
    neighbors: Arc<dyn NeighborTable>,
    registry: Registry,
    settings: NetworkSettings,
    call_retry: RetryPolicy,
    boot_wait: RetryPolicy,
}

impl NetworkLocator {
    pub fn new(
        control: Arc<dyn ControlPlane>,
        neighbors: Arc<dyn NeighborTable>,
        registry: Registry,
        settings: NetworkSettings,
        call_retry: RetryPolicy,
        boot_wait: RetryPolicy,
    ) -> Self {
        Self {
            control,
            neighbors,
            registry,
            settings,
            call_retry,
            boot_wait,
        }
    }

    /// Current address of `record`, or `None` when neither the lease table
    /// nor the neighbor table knows it. Never fails.
    pub async fn locate(&self, record: &InstanceRecord) -> Option<Ipv4Addr> {
        if let Some(addr) = &record.static_address {
            return Some(addr.address);
        }
        let mac = record.mac.to_lowercase();

        if let NetworkAttachment::Network { name } = self.settings.attachment() {
            if let Some(ip) = self.from_leases(&name, &mac).await {
                tracing::debug!(instance = %record.name, %ip, "Address found in lease table");
                return Some(ip);
            }
        }

        let ip = self.from_neighbors(&mac).await;
        match ip {
            Some(ip) => tracing::debug!(instance = %record.name, %ip, "Address found in neighbor table"),
            None => tracing::debug!(instance = %record.name, "No address found"),
        }
        ip
    }

    async fn from_leases(&self, network: &str, mac: &str) -> Option<Ipv4Addr> {
        let leases = retry_with_backoff(
            &self.call_retry,
            "net-dhcp-leases",
            || self.control.net_leases(network),
            |e| e.is_transient(),
        )
        .await;
        match leases {
            Ok(leases) => leases.into_iter().find(|l| l.mac == mac).map(|l| l.ip),
            Err(e) => {
                tracing::debug!(network, error = %e, "Lease query failed, falling back to neighbor table");
                None
            }
        }
    }

    async fn from_neighbors(&self, mac: &str) -> Option<Ipv4Addr> {
        let rounds = self.settings.probe_attempts.max(1);
        let interval = Duration::from_millis(self.settings.probe_interval_ms);

        for round in 1..=rounds {
            if let Err(e) = self.neighbors.probe(self.settings.probe_target).await {
                tracing::trace!(error = %e, "Probe failed");
            }
            match self.neighbors.entries().await {
                Ok(entries) => {
                    if let Some(entry) = entries.into_iter().find(|n| n.mac.eq_ignore_ascii_case(mac)) {
                        return Some(entry.ip);
                    }
                }
                Err(e) => tracing::debug!(error = %e, "Failed to read neighbor table"),
            }
            if round < rounds && !interval.is_zero() {
                tokio::time::sleep(interval).await;
            }
        }
        None
    }

    /// Poll [`NetworkLocator::locate`] under the boot-wait policy.
    ///
    /// # Errors
    /// `NetworkTimeout` when the policy is exhausted.
    pub async fn wait_for_address(&self, record: &InstanceRecord) -> Result<Ipv4Addr> {
        let attempts = self.boot_wait.max_attempts.max(1);
        retry_with_backoff(
            &self.boot_wait,
            "wait-for-address",
            || async {
                self.locate(record).await.ok_or_else(|| CoreError::NetworkTimeout {
                    name: record.name.clone(),
                    attempts,
                })
            },
            |e| matches!(e, CoreError::NetworkTimeout { .. }),
        )
        .await
    }

    /// Locate `name` and persist the result as its last known address.
    pub async fn refresh(&self, name: &str) -> Result<Option<Ipv4Addr>> {
        let record = self.registry.require(name)?;
        let ip = self.locate(&record).await;
        self.registry.set_last_ip(name, ip).await?;
        Ok(ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Paths;
    use crate::instance::StaticAddress;
    use crate::registry::tests::record;
    use nox_vm::fake::{FakeControlPlane, FakeNeighborTable};

    const MAC: &str = "52:54:00:00:00:01";

    struct Setup {
        control: Arc<FakeControlPlane>,
        neighbors: Arc<FakeNeighborTable>,
        locator: NetworkLocator,
        registry: Registry,
        _dir: tempfile::TempDir,
    }

    fn setup(settings: NetworkSettings) -> Setup {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(Paths::new(dir.path()));
        let control = Arc::new(FakeControlPlane::new());
        let neighbors = Arc::new(FakeNeighborTable::new());
        let locator = NetworkLocator::new(
            control.clone(),
            neighbors.clone(),
            registry.clone(),
            settings,
            RetryPolicy::immediate(3),
            RetryPolicy::immediate(4),
        );
        Setup {
            control,
            neighbors,
            locator,
            registry,
            _dir: dir,
        }
    }

    fn settings() -> NetworkSettings {
        NetworkSettings {
            probe_interval_ms: 0,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_lease_hit_skips_fallback() {
        let s = setup(settings());
        s.control.add_lease("default", "52:54:00:00:00:01", Ipv4Addr::new(192, 168, 122, 10));

        let ip = s.locator.locate(&record("vm1")).await;
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 122, 10)));
        assert_eq!(s.neighbors.probes(), 0);
        assert_eq!(s.neighbors.reads(), 0);
    }

    #[tokio::test]
    async fn test_empty_leases_fallback_exhausts_budget() {
        let s = setup(settings());
        let ip = s.locator.locate(&record("vm1")).await;
        assert_eq!(ip, None);
        assert_eq!(s.control.lease_queries(), 1);
        assert_eq!(s.neighbors.probes(), 3);
        assert_eq!(s.neighbors.reads(), 3);
    }

    #[tokio::test]
    async fn test_fallback_matches_mac_case_insensitive() {
        let s = setup(settings());
        s.neighbors.add_after_probes(2, Ipv4Addr::new(10, 0, 0, 9), "52:54:00:00:00:01".to_uppercase().as_str());
        let ip = s.locator.locate(&record("vm1")).await;
        assert_eq!(ip, Some(Ipv4Addr::new(10, 0, 0, 9)));
        assert_eq!(s.neighbors.probes(), 2);
    }

    #[tokio::test]
    async fn test_bridge_skips_leases() {
        let s = setup(NetworkSettings {
            bridge: Some("br0".into()),
            ..settings()
        });
        s.neighbors.add(Ipv4Addr::new(192, 168, 1, 77), MAC);
        let ip = s.locator.locate(&record("vm1")).await;
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 1, 77)));
        assert_eq!(s.control.lease_queries(), 0);
    }

    #[tokio::test]
    async fn test_lease_timeout_retried() {
        let s = setup(settings());
        s.control.timeout_on("net_leases", 2);
        s.control.add_lease("default", MAC, Ipv4Addr::new(192, 168, 122, 11));
        let ip = s.locator.locate(&record("vm1")).await;
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 122, 11)));
        assert_eq!(s.control.lease_queries(), 3);
    }

    #[tokio::test]
    async fn test_static_address_short_circuits() {
        let s = setup(settings());
        let mut rec = record("vm1");
        rec.static_address = Some(StaticAddress::parse_cidr("10.1.1.5/24").unwrap());
        assert_eq!(s.locator.locate(&rec).await, Some(Ipv4Addr::new(10, 1, 1, 5)));
        assert_eq!(s.control.lease_queries(), 0);
    }

    #[tokio::test]
    async fn test_wait_for_address_times_out() {
        let s = setup(settings());
        let err = s.locator.wait_for_address(&record("vm1")).await.unwrap_err();
        assert!(matches!(err, CoreError::NetworkTimeout { attempts: 4, .. }));
        assert_eq!(s.control.lease_queries(), 4);
    }

    #[tokio::test]
    async fn test_refresh_persists_ip() {
        let s = setup(settings());
        s.registry.put(&record("vm1")).unwrap();
        s.control.add_lease("default", MAC, Ipv4Addr::new(192, 168, 122, 12));

        let ip = s.locator.refresh("vm1").await.unwrap();
        assert_eq!(ip, Some(Ipv4Addr::new(192, 168, 122, 12)));
        assert_eq!(s.registry.require("vm1").unwrap().last_ip, ip);
    }
}
