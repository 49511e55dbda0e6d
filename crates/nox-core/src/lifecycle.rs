//! Lifecycle Orchestrator.
//!
//! Drives instances through `creating → running/stopped → deleting`. Every
//! operation on a name runs under that name's lock, so two commands for the
//! same instance never interleave while different instances proceed in
//! parallel.

use crate::config::NoxConfig;
use crate::error::{CoreError, Result};
use crate::images::{host_arch, ImageCache, ImageKey};
use crate::instance::{generate_mac, validate_name, InstanceRecord, InstanceState, StaticAddress};
use crate::keys::HostKey;
use crate::lock::KeyGuard;
use crate::provision::{self, resolve_scripts, LaunchScript, ProvisionInput};
use crate::registry::Registry;
use crate::resources::{ResizeRequest, ResourceRequest, ResourceResolver};
use crate::retry::retry_with_backoff;
use crate::secret::Secret;
use chrono::Utc;
use nox_vm::{ControlPlane, DefinitionBuilder, DiskTool, DomainState, VmError};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Root disk inside an instance directory.
pub const DISK_FILE: &str = "disk.qcow2";

/// Provisioning ISO inside an instance directory.
pub const SEED_FILE: &str = "seed.iso";

/// Guest device of the root disk.
pub(crate) const ROOT_TARGET: &str = "vda";

/// How often `stop` polls the domain while waiting for a clean shutdown.
const STOP_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters for [`Orchestrator::create`]. Unset resources fall back to the
/// configured defaults.
#[derive(Debug, Clone)]
pub struct CreateRequest {
    pub name: String,
    pub os: Option<String>,
    pub cpus: Option<f64>,
    pub ram: Option<f64>,
    pub disk: Option<f64>,
    /// Launch script names or paths, run in order at first boot
    pub scripts: Vec<String>,
    /// Static address in CIDR notation
    pub static_ip: Option<String>,
    pub autostart: bool,
    pub start: bool,
}

impl CreateRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            os: None,
            cpus: None,
            ram: None,
            disk: None,
            scripts: Vec::new(),
            static_ip: None,
            autostart: true,
            start: true,
        }
    }
}

/// Owns every state and resource change of an instance.
pub struct Orchestrator {
    config: NoxConfig,
    registry: Registry,
    images: Arc<ImageCache>,
    control: Arc<dyn ControlPlane>,
    disks: Arc<dyn DiskTool>,
    key: HostKey,
    resolver: ResourceResolver,
    arch: String,
}

impl Orchestrator {
    pub fn new(
        config: NoxConfig,
        registry: Registry,
        images: Arc<ImageCache>,
        control: Arc<dyn ControlPlane>,
        disks: Arc<dyn DiskTool>,
        key: HostKey,
        resolver: ResourceResolver,
    ) -> Self {
        Self {
            config,
            registry,
            images,
            control,
            disks,
            key,
            resolver,
            arch: host_arch().to_string(),
        }
    }

    /// Override the guest architecture (defaults to the host's).
    pub fn with_arch(mut self, arch: impl Into<String>) -> Self {
        self.arch = arch.into();
        self
    }

    pub fn config(&self) -> &NoxConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn images(&self) -> &Arc<ImageCache> {
        &self.images
    }

    pub fn host_key(&self) -> &HostKey {
        &self.key
    }

    pub(crate) fn control(&self) -> &Arc<dyn ControlPlane> {
        &self.control
    }

    pub(crate) fn disks(&self) -> &Arc<dyn DiskTool> {
        &self.disks
    }

    pub(crate) async fn lock(&self, name: &str) -> KeyGuard {
        self.registry.lock(name).await
    }

    fn instance_dir(&self, name: &str) -> PathBuf {
        self.registry.paths().instance_dir(name)
    }

    /// Run an idempotent control-plane call, retrying timeouts.
    async fn call<T, F, Fut>(&self, op: &str, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = nox_vm::Result<T>>,
    {
        Ok(retry_with_backoff(&self.config.call_retry, op, f, VmError::is_transient).await?)
    }

    pub(crate) async fn live_state(&self, name: &str) -> Result<Option<DomainState>> {
        self.call("domstate", || self.control.state(name)).await
    }

    /// Create, provision and (optionally) boot a new instance.
    ///
    /// Returns the record and the guest password, which is not stored
    /// anywhere else.
    ///
    /// # Errors
    /// `Validation` or `NameConflict` before any side effect. Later
    /// failures roll back what was created and leave the record in `error`.
    pub async fn create(&self, request: CreateRequest) -> Result<(InstanceRecord, Secret)> {
        let start = Instant::now();
        let name = request.name.clone();
        validate_name(&name)?;

        let defaults = &self.config.defaults;
        let os = request.os.clone().unwrap_or_else(|| defaults.os.clone());
        self.images.catalog().resolve(&os, &self.arch)?;
        let resources = self.resolver.resolve(&ResourceRequest {
            cpus: request.cpus.unwrap_or(defaults.cpus),
            ram: request.ram.unwrap_or(defaults.ram),
            disk: request.disk.unwrap_or(defaults.disk),
        })?;
        let static_address = request
            .static_ip
            .as_deref()
            .map(StaticAddress::parse_cidr)
            .transpose()?;
        let scripts = resolve_scripts(&request.scripts, &self.registry.paths().scripts())?;

        let _lock = self.lock(&name).await;
        if self.registry.exists(&name) || self.live_state(&name).await?.is_some() {
            return Err(CoreError::NameConflict(name));
        }

        tracing::info!(
            instance = %name,
            os = %os,
            vcpus = resources.vcpus,
            ram_mb = resources.ram_mb,
            disk_gb = resources.disk_gb,
            "Creating instance"
        );

        let mut record = InstanceRecord {
            name: name.clone(),
            id: Uuid::new_v4(),
            state: InstanceState::Creating,
            os: os.clone(),
            arch: self.arch.clone(),
            vcpus: resources.vcpus,
            ram_mb: resources.ram_mb,
            disk_gb: resources.disk_gb,
            mac: self.unused_mac()?,
            autostart: request.autostart,
            created_at: Utc::now(),
            scripts: scripts.iter().map(|s| s.name.clone()).collect(),
            static_address,
            base_image: None,
            last_ip: None,
        };
        std::fs::create_dir_all(self.instance_dir(&name))?;
        self.registry.put(&record)?;

        let mut guard = CreateGuard {
            registry: self.registry.clone(),
            control: self.control.clone(),
            images: self.images.clone(),
            record: record.clone(),
            defined: false,
            retained: None,
            armed: true,
        };
        let password = Secret::generate_password();

        match self
            .provision(&mut record, &mut guard, &password, &scripts, request.start)
            .await
        {
            Ok(()) => {
                guard.armed = false;
                tracing::info!(
                    instance = %name,
                    state = %record.state,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Instance created"
                );
                Ok((record, password))
            }
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "Create failed, rolling back");
                guard.armed = false;
                self.roll_back(&guard).await;
                Err(e)
            }
        }
    }

    async fn provision(
        &self,
        record: &mut InstanceRecord,
        guard: &mut CreateGuard,
        password: &Secret,
        scripts: &[LaunchScript],
        start: bool,
    ) -> Result<()> {
        let image = self
            .images
            .acquire_retained(&record.os, &record.arch)
            .await?;
        let key = image.key();
        guard.retained = Some(key.clone());
        record.base_image = Some(key);
        let dir = self.instance_dir(&record.name);

        tracing::debug!(instance = %record.name, base = %image.path.display(), "Creating disk overlay");
        self.disks
            .create_overlay(&image.path, &dir.join(DISK_FILE), record.disk_gb)
            .await?;

        self.write_seed(record, password, scripts).await?;

        // A define that errors may still have registered the domain.
        guard.defined = true;
        self.define(record).await?;

        if start {
            self.call("start", || self.control.start(&record.name)).await?;
            record.state = InstanceState::Running;
        } else {
            record.state = InstanceState::Stopped;
        }
        self.registry.put(record)
    }

    async fn roll_back(&self, guard: &CreateGuard) {
        let name = &guard.record.name;
        if guard.defined {
            if let Ok(Some(state)) = self.live_state(name).await {
                if state.is_active() {
                    let _ = self.control.destroy(name).await;
                }
            }
            match self.call("undefine", || self.control.undefine(name)).await {
                Ok(()) | Err(CoreError::ControlPlane(VmError::NotDefined(_))) => {}
                Err(e) => tracing::warn!(instance = %name, error = %e, "Rollback: undefine failed"),
            }
        }
        if let Some(key) = &guard.retained {
            if let Err(e) = self.images.release(key).await {
                tracing::warn!(instance = %name, image = %key, error = %e, "Rollback: release failed");
            }
        }
        guard.remove_files();
        guard.mark_error();
    }

    /// Render the provisioning bundle and write `seed.iso`.
    pub(crate) async fn write_seed(
        &self,
        record: &InstanceRecord,
        password: &Secret,
        scripts: &[LaunchScript],
    ) -> Result<()> {
        let bundle = provision::build(&ProvisionInput {
            record,
            ssh_public_key: self.key.public_openssh(),
            password,
            env: &self.config.env,
            scripts,
        })?;
        let seed = self.instance_dir(&record.name).join(SEED_FILE);
        self.disks.build_seed(&bundle.files(), &seed).await?;
        Ok(())
    }

    /// Register `record` with the control plane. Never retried: a timed out
    /// define may still have taken effect.
    pub(crate) async fn define(&self, record: &InstanceRecord) -> Result<()> {
        let dir = self.instance_dir(&record.name);
        let mut builder = DefinitionBuilder::new(&record.name)
            .uuid(record.id.to_string())
            .vcpus(record.vcpus)
            .memory_mib(record.ram_mb)
            .arch(&record.arch)
            .root_disk(dir.join(DISK_FILE))
            .mac(&record.mac)
            .attachment(self.config.network.attachment())
            .autostart(record.autostart);
        if dir.join(SEED_FILE).exists() {
            builder = builder.seed(dir.join(SEED_FILE));
        }
        self.control.define(&builder.build()?).await?;
        Ok(())
    }

    /// A MAC no registered instance uses.
    pub(crate) fn unused_mac(&self) -> Result<String> {
        let taken: Vec<String> = self.registry.list()?.into_iter().map(|r| r.mac).collect();
        loop {
            let mac = generate_mac();
            if !taken.contains(&mac) {
                return Ok(mac);
            }
        }
    }

    /// Power on. Starting a running instance is a no-op.
    pub async fn start(&self, name: &str) -> Result<InstanceRecord> {
        let _lock = self.lock(name).await;
        let mut record = self.registry.require(name)?;
        self.start_locked(&mut record).await?;
        Ok(record)
    }

    pub(crate) async fn start_locked(&self, record: &mut InstanceRecord) -> Result<()> {
        ensure_settled(record, "start")?;
        let live = self.live_state(&record.name).await?;
        match live {
            None => {
                return Err(CoreError::ControlPlane(VmError::NotDefined(record.name.clone())));
            }
            Some(state) if state.is_active() => {
                tracing::debug!(instance = %record.name, "Already running");
            }
            Some(_) => {
                self.call("start", || self.control.start(&record.name)).await?;
                tracing::info!(instance = %record.name, "Instance started");
            }
        }
        if record.state != InstanceState::Running {
            record.state = InstanceState::Running;
            self.registry.put(record)?;
        }
        Ok(())
    }

    /// Graceful shutdown, forced once the stop timeout passes. Stopping a
    /// stopped instance is a no-op.
    pub async fn stop(&self, name: &str) -> Result<InstanceRecord> {
        let _lock = self.lock(name).await;
        let mut record = self.registry.require(name)?;
        self.stop_locked(&mut record).await?;
        Ok(record)
    }

    pub(crate) async fn stop_locked(&self, record: &mut InstanceRecord) -> Result<()> {
        ensure_settled(record, "stop")?;
        self.power_off(&record.name).await?;

        if record.state != InstanceState::Stopped || record.last_ip.is_some() {
            record.state = InstanceState::Stopped;
            record.last_ip = None;
            self.registry.put(record)?;
        }
        Ok(())
    }

    /// Ask the guest to shut down and force it off once the stop timeout
    /// passes. Does nothing when the domain is not active.
    async fn power_off(&self, name: &str) -> Result<()> {
        let active = self
            .live_state(name)
            .await?
            .is_some_and(|s| s.is_active());
        if !active {
            return Ok(());
        }

        self.call("shutdown", || self.control.shutdown(name)).await?;
        let deadline = tokio::time::Instant::now() + self.config.stop_timeout();
        loop {
            let state = self.live_state(name).await?;
            if !state.is_some_and(|s| s.is_active()) {
                tracing::info!(instance = %name, "Instance stopped");
                return Ok(());
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(
                    instance = %name,
                    timeout_secs = self.config.stop_timeout_secs,
                    "Guest ignored shutdown, forcing power-off"
                );
                return self.call("destroy", || self.control.destroy(name)).await;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    /// Stop then start, under one lock.
    pub async fn restart(&self, name: &str) -> Result<InstanceRecord> {
        let _lock = self.lock(name).await;
        let mut record = self.registry.require(name)?;
        self.stop_locked(&mut record).await?;
        self.start_locked(&mut record).await?;
        Ok(record)
    }

    /// Change vcpus/ram (stopped only) or grow the disk (running or
    /// stopped). Everything is validated before anything is applied.
    pub async fn resize(&self, name: &str, request: &ResizeRequest) -> Result<InstanceRecord> {
        if request.is_empty() {
            return Err(CoreError::Validation(
                "nothing to resize: pass --cpus, --ram or --disk".into(),
            ));
        }
        let resolved = self.resolver.resolve_resize(request)?;

        let _lock = self.lock(name).await;
        let mut record = self.registry.require(name)?;
        ensure_settled(&record, "resize")?;
        let running = self
            .live_state(name)
            .await?
            .is_some_and(|s| s.is_active());

        let vcpus = resolved.vcpus.unwrap_or(record.vcpus);
        let ram_mb = resolved.ram_mb.unwrap_or(record.ram_mb);
        let compute_changed = vcpus != record.vcpus || ram_mb != record.ram_mb;
        if compute_changed && running {
            return Err(CoreError::Validation(format!(
                "{name} is running: stop it before changing cpus or ram"
            )));
        }
        let disk_gb = resolved.disk_gb.unwrap_or(record.disk_gb);
        if disk_gb < record.disk_gb {
            return Err(CoreError::Validation(format!(
                "disk can only grow: {name} has {} GB, requested {disk_gb} GB",
                record.disk_gb
            )));
        }

        if compute_changed {
            self.control.set_resources(name, vcpus, ram_mb).await?;
            record.vcpus = vcpus;
            record.ram_mb = ram_mb;
        }
        if disk_gb > record.disk_gb {
            if running {
                self.control.resize_disk(name, ROOT_TARGET, disk_gb).await?;
            } else {
                let disk = self.instance_dir(name).join(DISK_FILE);
                self.disks.resize(&disk, disk_gb).await?;
            }
            record.disk_gb = disk_gb;
        }

        self.registry.put(&record)?;
        tracing::info!(
            instance = %name,
            vcpus = record.vcpus,
            ram_mb = record.ram_mb,
            disk_gb = record.disk_gb,
            live = running,
            "Instance resized"
        );
        Ok(record)
    }

    /// Tear an instance down and drop its record. Shared base images stay
    /// in the cache.
    pub async fn delete(&self, name: &str) -> Result<()> {
        let _lock = self.lock(name).await;
        let record = self.registry.require(name)?;
        self.delete_locked(record).await
    }

    pub(crate) async fn delete_locked(&self, mut record: InstanceRecord) -> Result<()> {
        let name = record.name.clone();
        tracing::info!(instance = %name, "Deleting instance");
        record.state = InstanceState::Deleting;
        self.registry.put(&record)?;

        if self.live_state(&name).await?.is_some() {
            self.power_off(&name).await?;
            match self.call("undefine", || self.control.undefine(&name)).await {
                Ok(()) | Err(CoreError::ControlPlane(VmError::NotDefined(_))) => {}
                Err(e) => return Err(e),
            }
        }

        self.registry.remove(&name)?;
        match tokio::fs::remove_dir_all(self.instance_dir(&name)).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(key) = &record.base_image {
            match self.images.release(key).await {
                Ok(_) | Err(CoreError::NotFound(_)) => {}
                Err(e) => tracing::warn!(instance = %name, image = %key, error = %e, "Failed to release image"),
            }
        }
        tracing::info!(instance = %name, "Instance deleted");
        Ok(())
    }

    /// Toggle start-on-host-boot.
    pub async fn set_autostart(&self, name: &str, enabled: bool) -> Result<InstanceRecord> {
        let _lock = self.lock(name).await;
        let mut record = self.registry.require(name)?;
        ensure_settled(&record, "autostart")?;
        self.call("autostart", || self.control.set_autostart(name, enabled))
            .await?;
        record.autostart = enabled;
        self.registry.put(&record)?;
        Ok(record)
    }

    /// The record, with its running/stopped state reconciled against the
    /// control plane.
    pub async fn status(&self, name: &str) -> Result<InstanceRecord> {
        let _lock = self.lock(name).await;
        let mut record = self.registry.require(name)?;
        let live = self.live_state(name).await?;
        if reconcile(&mut record, live) {
            tracing::info!(instance = %name, state = %record.state, "Reconciled state");
            self.registry.put(&record)?;
        }
        Ok(record)
    }

    /// All instances, reconciled where the control plane answers.
    pub async fn list(&self) -> Result<Vec<InstanceRecord>> {
        let mut records = Vec::new();
        for record in self.registry.list()? {
            match self.status(&record.name).await {
                Ok(current) => records.push(current),
                Err(e) => {
                    tracing::warn!(instance = %record.name, error = %e, "Could not query state");
                    records.push(record);
                }
            }
        }
        Ok(records)
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("root", &self.registry.paths().root())
            .field("arch", &self.arch)
            .finish()
    }
}

fn ensure_settled(record: &InstanceRecord, op: &str) -> Result<()> {
    match record.state {
        InstanceState::Running | InstanceState::Stopped => Ok(()),
        InstanceState::Error => Err(CoreError::Validation(format!(
            "cannot {op} {}: instance is in error state, delete it",
            record.name
        ))),
        state => Err(CoreError::Validation(format!(
            "cannot {op} {}: instance is {state}",
            record.name
        ))),
    }
}

/// Align a settled record with the live power state. Returns whether the
/// record changed.
fn reconcile(record: &mut InstanceRecord, live: Option<DomainState>) -> bool {
    if !matches!(record.state, InstanceState::Running | InstanceState::Stopped) {
        return false;
    }
    let state = match live {
        Some(s) if s.is_active() => InstanceState::Running,
        Some(_) => InstanceState::Stopped,
        None => InstanceState::Error,
    };
    if state == record.state {
        return false;
    }
    record.state = state;
    if state != InstanceState::Running {
        record.last_ip = None;
    }
    true
}

/// Cleans up after a `create` whose future was dropped mid-way. The explicit
/// failure path disarms it and rolls back asynchronously instead.
struct CreateGuard {
    registry: Registry,
    control: Arc<dyn ControlPlane>,
    images: Arc<ImageCache>,
    record: InstanceRecord,
    defined: bool,
    retained: Option<ImageKey>,
    armed: bool,
}

impl CreateGuard {
    fn remove_files(&self) {
        let dir = self.registry.paths().instance_dir(&self.record.name);
        for file in [DISK_FILE, SEED_FILE] {
            match std::fs::remove_file(dir.join(file)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(instance = %self.record.name, file, error = %e, "Failed to remove file"),
            }
        }
    }

    fn mark_error(&self) {
        let mut record = self.record.clone();
        record.state = InstanceState::Error;
        if let Err(e) = self.registry.put(&record) {
            tracing::error!(instance = %record.name, error = %e, "Failed to mark record as error");
        }
    }
}

impl Drop for CreateGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        tracing::warn!(instance = %self.record.name, "Create interrupted, cleaning up");
        self.remove_files();
        self.mark_error();

        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        if self.defined {
            let control = self.control.clone();
            let name = self.record.name.clone();
            handle.spawn(async move {
                let _ = control.destroy(&name).await;
                match control.undefine(&name).await {
                    Ok(()) | Err(VmError::NotDefined(_)) => {}
                    Err(e) => tracing::warn!(instance = %name, error = %e, "Cleanup: undefine failed"),
                }
            });
        }
        if let Some(key) = self.retained.take() {
            let images = self.images.clone();
            handle.spawn(async move {
                if let Err(e) = images.release(&key).await {
                    tracing::warn!(image = %key, error = %e, "Cleanup: release failed");
                }
            });
        }
    }
}
