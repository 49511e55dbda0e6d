//! In-memory adapters for deterministic tests.
//!
//! Every fake records the calls it receives and can be told to fail a named
//! operation, so callers can exercise rollback paths without a hypervisor.

use crate::config::InstanceDefinition;
use crate::control::{ControlPlane, DiskTool, DomainState, Lease, NeighborEntry, NeighborTable};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

fn injected(op: &str) -> VmError {
    VmError::Command {
        program: "fake".into(),
        status: "exit status: 1".into(),
        stderr: format!("injected failure: {op}"),
    }
}

/// Failure switches shared by the fakes.
#[derive(Debug, Default)]
struct Faults {
    fail: HashSet<String>,
    timeouts: HashMap<String, usize>,
    /// Timeouts reported after the call took effect
    late: HashMap<String, usize>,
}

impl Faults {
    fn check(&mut self, op: &str) -> Result<()> {
        if self.fail.contains(op) {
            return Err(injected(op));
        }
        if let Some(left) = self.timeouts.get_mut(op) {
            if *left > 0 {
                *left -= 1;
                return Err(VmError::Timeout(Duration::from_millis(1)));
            }
        }
        Ok(())
    }

    fn check_late(&mut self, op: &str) -> Result<()> {
        match self.late.get_mut(op) {
            Some(left) if *left > 0 => {
                *left -= 1;
                Err(VmError::Timeout(Duration::from_millis(1)))
            }
            _ => Ok(()),
        }
    }
}

/// A domain known to [`FakeControlPlane`].
#[derive(Debug, Clone)]
pub struct FakeDomain {
    pub definition: InstanceDefinition,
    pub state: DomainState,
    pub autostart: bool,
    pub disk_gb: Option<u64>,
    pub overlay: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct PlaneState {
    domains: HashMap<String, FakeDomain>,
    leases: HashMap<String, Vec<Lease>>,
    faults: Faults,
    calls: Vec<String>,
    ignore_shutdown: bool,
}

/// In-memory [`ControlPlane`].
#[derive(Debug, Default)]
pub struct FakeControlPlane {
    inner: Mutex<PlaneState>,
    lease_queries: AtomicUsize,
}

impl FakeControlPlane {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut PlaneState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Make every call to `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.with(|s| s.faults.fail.insert(op.to_string()));
    }

    /// Stop failing `op`.
    pub fn heal(&self, op: &str) {
        self.with(|s| s.faults.fail.remove(op));
    }

    /// Make the next `count` calls to `op` time out.
    pub fn timeout_on(&self, op: &str, count: usize) {
        self.with(|s| s.faults.timeouts.insert(op.to_string(), count));
    }

    /// Apply the next `count` calls to `op`, then report a timeout anyway.
    /// Only `define` honours this.
    pub fn timeout_after(&self, op: &str, count: usize) {
        self.with(|s| s.faults.late.insert(op.to_string(), count));
    }

    /// Guests ignore ACPI shutdown requests.
    pub fn ignore_shutdown(&self, ignore: bool) {
        self.with(|s| s.ignore_shutdown = ignore);
    }

    /// Publish a lease on `network`.
    pub fn add_lease(&self, network: &str, mac: &str, ip: Ipv4Addr) {
        self.with(|s| {
            s.leases.entry(network.to_string()).or_default().push(Lease {
                mac: mac.to_lowercase(),
                ip,
                hostname: None,
            })
        });
    }

    /// Snapshot of a domain.
    pub fn domain(&self, name: &str) -> Option<FakeDomain> {
        self.with(|s| s.domains.get(name).cloned())
    }

    /// Force a domain into a power state, as if the guest did it.
    pub fn set_state(&self, name: &str, state: DomainState) {
        self.with(|s| {
            if let Some(d) = s.domains.get_mut(name) {
                d.state = state;
            }
        });
    }

    /// Every call received, as `op:name`.
    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    /// Number of calls to `op`.
    pub fn count(&self, op: &str) -> usize {
        self.with(|s| {
            s.calls
                .iter()
                .filter(|c| c.split(':').next() == Some(op))
                .count()
        })
    }

    /// Number of lease table queries.
    pub fn lease_queries(&self) -> usize {
        self.lease_queries.load(Ordering::SeqCst)
    }

    fn enter(&self, op: &str, name: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(format!("{op}:{name}"));
            s.faults.check(op)
        })
    }

    fn update<R>(&self, name: &str, f: impl FnOnce(&mut FakeDomain) -> Result<R>) -> Result<R> {
        self.with(|s| match s.domains.get_mut(name) {
            Some(d) => f(d),
            None => Err(VmError::NotDefined(name.to_string())),
        })
    }
}

#[async_trait]
impl ControlPlane for FakeControlPlane {
    async fn define(&self, def: &InstanceDefinition) -> Result<()> {
        self.enter("define", &def.name)?;
        def.validate()?;
        self.with(|s| {
            if s.domains.contains_key(&def.name) {
                return Err(VmError::Command {
                    program: "fake".into(),
                    status: "exit status: 1".into(),
                    stderr: format!("domain '{}' already exists", def.name),
                });
            }
            s.domains.insert(
                def.name.clone(),
                FakeDomain {
                    definition: def.clone(),
                    state: DomainState::Shutoff,
                    autostart: def.autostart,
                    disk_gb: None,
                    overlay: None,
                },
            );
            s.faults.check_late("define")
        })
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        self.enter("undefine", name)?;
        self.with(|s| match s.domains.remove(name) {
            Some(_) => Ok(()),
            None => Err(VmError::NotDefined(name.to_string())),
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.enter("start", name)?;
        self.update(name, |d| {
            if d.state == DomainState::Running {
                return Err(VmError::InvalidState {
                    expected: "shut off".into(),
                    actual: d.state.to_string(),
                });
            }
            d.state = DomainState::Running;
            Ok(())
        })
    }

    async fn shutdown(&self, name: &str) -> Result<()> {
        self.enter("shutdown", name)?;
        let ignore = self.with(|s| s.ignore_shutdown);
        self.update(name, |d| {
            if !ignore {
                d.state = DomainState::Shutoff;
            }
            Ok(())
        })
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        self.enter("destroy", name)?;
        self.update(name, |d| {
            d.state = DomainState::Shutoff;
            Ok(())
        })
    }

    async fn state(&self, name: &str) -> Result<Option<DomainState>> {
        self.enter("state", name)?;
        Ok(self.with(|s| s.domains.get(name).map(|d| d.state)))
    }

    async fn set_resources(&self, name: &str, vcpus: u32, memory_mib: u64) -> Result<()> {
        self.enter("set_resources", name)?;
        self.update(name, |d| {
            d.definition.vcpu_count = vcpus;
            d.definition.memory_mib = memory_mib;
            Ok(())
        })
    }

    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        self.enter("set_autostart", name)?;
        self.update(name, |d| {
            d.autostart = enabled;
            Ok(())
        })
    }

    async fn resize_disk(&self, name: &str, _target: &str, size_gb: u64) -> Result<()> {
        self.enter("resize_disk", name)?;
        self.update(name, |d| {
            if d.state != DomainState::Running {
                return Err(VmError::InvalidState {
                    expected: "running".into(),
                    actual: d.state.to_string(),
                });
            }
            d.disk_gb = Some(size_gb);
            Ok(())
        })
    }

    async fn snapshot(&self, name: &str, _target: &str, overlay: &Path) -> Result<()> {
        self.enter("snapshot", name)?;
        self.update(name, |d| {
            if d.overlay.is_some() {
                return Err(VmError::InvalidState {
                    expected: "no active overlay".into(),
                    actual: "overlay active".into(),
                });
            }
            std::fs::write(overlay, b"")?;
            d.overlay = Some(overlay.to_path_buf());
            Ok(())
        })
    }

    async fn block_commit(&self, name: &str, _target: &str) -> Result<()> {
        self.enter("block_commit", name)?;
        self.update(name, |d| match d.overlay.take() {
            Some(_) => Ok(()),
            None => Err(VmError::InvalidState {
                expected: "active overlay".into(),
                actual: "none".into(),
            }),
        })
    }

    async fn net_leases(&self, network: &str) -> Result<Vec<Lease>> {
        self.lease_queries.fetch_add(1, Ordering::SeqCst);
        self.enter("net_leases", network)?;
        Ok(self.with(|s| s.leases.get(network).cloned().unwrap_or_default()))
    }
}

#[derive(Debug, Default)]
struct DiskState {
    sizes: HashMap<PathBuf, u64>,
    faults: Faults,
    calls: Vec<String>,
}

/// [`DiskTool`] that writes small marker files instead of real images.
#[derive(Debug, Default)]
pub struct FakeDiskTool {
    inner: Mutex<DiskState>,
}

impl FakeDiskTool {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&mut DiskState) -> R) -> R {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Make every call to `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.with(|s| s.faults.fail.insert(op.to_string()));
    }

    /// Virtual size last set for `path`.
    pub fn size_of(&self, path: &Path) -> Option<u64> {
        self.with(|s| s.sizes.get(path).copied())
    }

    /// Number of calls to `op`.
    pub fn count(&self, op: &str) -> usize {
        self.with(|s| s.calls.iter().filter(|c| c.as_str() == op).count())
    }

    fn enter(&self, op: &str) -> Result<()> {
        self.with(|s| {
            s.calls.push(op.to_string());
            s.faults.check(op)
        })
    }
}

#[async_trait]
impl DiskTool for FakeDiskTool {
    async fn create_overlay(&self, base: &Path, dest: &Path, size_gb: u64) -> Result<()> {
        self.enter("create_overlay")?;
        if !base.exists() {
            return Err(VmError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("backing file {} missing", base.display()),
            )));
        }
        tokio::fs::write(dest, format!("overlay:{}", base.display())).await?;
        self.with(|s| s.sizes.insert(dest.to_path_buf(), size_gb));
        Ok(())
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()> {
        self.enter("resize")?;
        if !path.exists() {
            return Err(VmError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} missing", path.display()),
            )));
        }
        self.with(|s| s.sizes.insert(path.to_path_buf(), size_gb));
        Ok(())
    }

    async fn export(&self, src: &Path, dest: &Path) -> Result<()> {
        self.enter("export")?;
        tokio::fs::copy(src, dest).await?;
        let size = self.size_of(src);
        if let Some(size) = size {
            self.with(|s| s.sizes.insert(dest.to_path_buf(), size));
        }
        Ok(())
    }

    async fn build_seed(&self, files: &[(&str, &str)], dest: &Path) -> Result<()> {
        self.enter("build_seed")?;
        let mut out = String::new();
        for (name, contents) in files {
            out.push_str(&format!("== {name} ==\n{contents}\n"));
        }
        tokio::fs::write(dest, out).await?;
        Ok(())
    }
}

/// [`NeighborTable`] with scripted contents.
#[derive(Debug, Default)]
pub struct FakeNeighborTable {
    entries: Mutex<Vec<NeighborEntry>>,
    /// Entries that only show up after this many probes.
    appear_after: Mutex<Option<(usize, NeighborEntry)>>,
    probes: AtomicUsize,
    reads: AtomicUsize,
}

impl FakeNeighborTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry that is present immediately.
    pub fn add(&self, ip: Ipv4Addr, mac: &str) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(NeighborEntry {
            ip,
            mac: mac.to_string(),
            device: "br0".into(),
        });
    }

    /// Add an entry that only appears once `probes` probes have been sent.
    pub fn add_after_probes(&self, probes: usize, ip: Ipv4Addr, mac: &str) {
        let mut pending = self.appear_after.lock().unwrap_or_else(|e| e.into_inner());
        *pending = Some((
            probes,
            NeighborEntry {
                ip,
                mac: mac.to_string(),
                device: "br0".into(),
            },
        ));
    }

    /// Probes sent so far.
    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    /// Table reads so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NeighborTable for FakeNeighborTable {
    async fn probe(&self, _target: Ipv4Addr) -> Result<()> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<NeighborEntry>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let pending = self
            .appear_after
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some((after, entry)) = pending {
            if self.probes() >= after {
                entries.push(entry);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DefinitionBuilder;
    use tokio_test::{assert_err, assert_ok};

    fn def(name: &str) -> InstanceDefinition {
        DefinitionBuilder::new(name)
            .root_disk("/tmp/disk.qcow2")
            .mac("52:54:00:00:00:10")
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_fake_lifecycle() {
        let cp = FakeControlPlane::new();
        assert_ok!(cp.define(&def("vm1")).await);
        assert_eq!(cp.state("vm1").await.unwrap(), Some(DomainState::Shutoff));

        assert_ok!(cp.start("vm1").await);
        assert_eq!(cp.state("vm1").await.unwrap(), Some(DomainState::Running));
        assert_err!(cp.start("vm1").await);

        assert_ok!(cp.shutdown("vm1").await);
        assert_eq!(cp.state("vm1").await.unwrap(), Some(DomainState::Shutoff));

        assert_ok!(cp.undefine("vm1").await);
        assert_eq!(cp.state("vm1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_fake_duplicate_define() {
        let cp = FakeControlPlane::new();
        assert_ok!(cp.define(&def("vm1")).await);
        assert_err!(cp.define(&def("vm1")).await);
    }

    #[tokio::test]
    async fn test_fake_fault_injection() {
        let cp = FakeControlPlane::new();
        cp.fail_on("define");
        assert_err!(cp.define(&def("vm1")).await);
        cp.heal("define");
        assert_ok!(cp.define(&def("vm1")).await);

        cp.timeout_on("start", 1);
        let err = cp.start("vm1").await.unwrap_err();
        assert!(err.is_transient());
        assert_ok!(cp.start("vm1").await);
        assert_eq!(cp.count("start"), 2);
    }

    #[tokio::test]
    async fn test_fake_define_applies_then_times_out() {
        let cp = FakeControlPlane::new();
        cp.timeout_after("define", 1);
        let err = cp.define(&def("vm1")).await.unwrap_err();
        assert!(err.is_transient());
        assert!(cp.domain("vm1").is_some());
    }

    #[tokio::test]
    async fn test_fake_neighbors_appear_after_probe() {
        let table = FakeNeighborTable::new();
        table.add_after_probes(1, Ipv4Addr::new(10, 0, 0, 5), "52:54:00:00:00:10");
        assert!(table.entries().await.unwrap().is_empty());
        table.probe(Ipv4Addr::BROADCAST).await.unwrap();
        assert_eq!(table.entries().await.unwrap().len(), 1);
    }
}
