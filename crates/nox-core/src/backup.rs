//! Backup/Restore Engine.
//!
//! A backup is one `<name>_<YYYYmmddTHHMMSSZ>.tar.gz` holding a flattened
//! copy of the root disk, the instance record, the provisioning ISO and a
//! manifest. Running instances are captured through a disk-only external
//! snapshot, so the guest keeps running while the frozen image is exported.

use crate::config::write_json_atomic;
use crate::error::{CoreError, Result};
use crate::instance::{validate_name, InstanceRecord, InstanceState};
use crate::lifecycle::{Orchestrator, DISK_FILE, ROOT_TARGET, SEED_FILE};
use crate::registry::RECORD_FILE;
use crate::remote::RemoteStore;
use crate::secret::Secret;
use chrono::{DateTime, NaiveDateTime, SubsecRound, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// File extension of backup archives.
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

/// Current archive layout version.
pub const FORMAT_VERSION: u32 = 1;

/// Manifest file inside an archive.
pub const MANIFEST_FILE: &str = "manifest.json";

const TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%SZ";

/// Where a backup is stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupOrigin {
    Local,
    Remote,
}

impl fmt::Display for BackupOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupOrigin::Local => write!(f, "local"),
            BackupOrigin::Remote => write!(f, "remote"),
        }
    }
}

/// One known backup archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub size: u64,
    pub origin: BackupOrigin,
    /// Present both locally and in the remote store
    pub mirrored: bool,
    /// Local path or remote key
    pub location: String,
}

impl BackupRecord {
    /// `<name>_<timestamp>`, accepted by `restore`.
    pub fn id(&self) -> String {
        archive_id(&self.name, &self.timestamp)
    }
}

/// Table of contents stored as `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub format_version: u32,
    pub created_at: DateTime<Utc>,
    /// Flattened root disk
    pub disk: String,
    /// Instance record at capture time
    pub record: String,
    /// Provisioning ISO, when the instance had one
    #[serde(default)]
    pub seed: Option<String>,
    pub disk_gb: u64,
    /// Captured from a running guest (crash-consistent)
    #[serde(default)]
    pub live: bool,
}

/// Result of [`BackupEngine::backup`].
#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub backup: BackupRecord,
    /// Set when the archive was kept locally but could not be uploaded
    pub warning: Option<String>,
}

/// Parameters for [`BackupEngine::restore`].
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Archive path, backup id (`<name>_<timestamp>`) or remote key
    pub reference: String,
    /// Target instance name; defaults to the archived one
    pub name: Option<String>,
    /// Replace an existing instance with the same name
    pub force: bool,
    pub start: bool,
}

/// Result of [`BackupEngine::restore`].
#[derive(Debug, Clone)]
pub struct RestoreOutcome {
    pub record: InstanceRecord,
    /// New guest password, when the restored copy was given a new identity
    pub password: Option<Secret>,
}

/// `<name>_<YYYYmmddTHHMMSSZ>`.
pub fn archive_id(name: &str, timestamp: &DateTime<Utc>) -> String {
    format!("{name}_{}", timestamp.format(TIMESTAMP_FORMAT))
}

/// Split an archive file name into instance name and timestamp.
pub fn parse_archive_name(file_name: &str) -> Option<(String, DateTime<Utc>)> {
    let stem = file_name.strip_suffix(ARCHIVE_SUFFIX)?;
    let (name, stamp) = stem.rsplit_once('_')?;
    validate_name(name).ok()?;
    let timestamp = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()?
        .and_utc();
    Some((name.to_string(), timestamp))
}

pub struct BackupEngine {
    orchestrator: Arc<Orchestrator>,
    remote: Option<Arc<dyn RemoteStore>>,
}

impl BackupEngine {
    pub fn new(orchestrator: Arc<Orchestrator>, remote: Option<Arc<dyn RemoteStore>>) -> Self {
        Self {
            orchestrator,
            remote,
        }
    }

    fn dir(&self) -> PathBuf {
        self.orchestrator.registry().paths().backups()
    }

    /// Capture `name` into a new archive and mirror it to the remote store
    /// when one is configured. Upload failures only produce a warning.
    pub async fn backup(&self, name: &str) -> Result<BackupOutcome> {
        let start = Instant::now();
        let orch = &self.orchestrator;
        let _lock = orch.lock(name).await;
        let record = orch.registry().require(name)?;
        if !matches!(record.state, InstanceState::Running | InstanceState::Stopped) {
            return Err(CoreError::Validation(format!(
                "cannot back up {name}: instance is {}",
                record.state
            )));
        }
        let running = orch
            .live_state(name)
            .await?
            .is_some_and(|s| s.is_active());

        let dir = self.dir();
        tokio::fs::create_dir_all(&dir).await?;
        let timestamp = self.free_timestamp(name, &dir).await?;
        let id = archive_id(name, &timestamp);
        let file_name = format!("{id}{ARCHIVE_SUFFIX}");
        let archive = dir.join(&file_name);
        let staging = dir.join(format!(".{id}.staging"));

        tracing::info!(instance = %name, live = running, "Creating backup");
        tokio::fs::create_dir_all(&staging).await?;
        let captured = self.capture(&record, running, &staging, timestamp).await;
        let packed = match captured {
            Ok(()) => {
                let (src, dest) = (staging.clone(), archive.clone());
                tokio::task::spawn_blocking(move || write_archive(&src, &dest))
                    .await
                    .map_err(|e| CoreError::storage_with("archive task failed", e))
                    .and_then(|r| r)
            }
            Err(e) => Err(e),
        };
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
        }
        packed?;

        let size = tokio::fs::metadata(&archive).await?.len();
        let mut backup = BackupRecord {
            name: name.to_string(),
            timestamp,
            size,
            origin: BackupOrigin::Local,
            mirrored: false,
            location: archive.display().to_string(),
        };

        let mut warning = None;
        if let Some(remote) = &self.remote {
            match remote.upload(&file_name, &archive).await {
                Ok(()) => {
                    backup.origin = BackupOrigin::Remote;
                    backup.mirrored = true;
                }
                Err(e) => {
                    tracing::warn!(instance = %name, error = %e, "Upload failed, backup kept locally");
                    warning = Some(format!(
                        "backup kept locally; upload to {} failed: {e}",
                        remote.describe()
                    ));
                }
            }
        }

        tracing::info!(
            instance = %name,
            backup = %id,
            size,
            origin = %backup.origin,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Backup complete"
        );
        Ok(BackupOutcome { backup, warning })
    }

    /// The current second, or the first later one whose archive id is not
    /// taken locally or remotely. Archives are never overwritten.
    async fn free_timestamp(&self, name: &str, dir: &Path) -> Result<DateTime<Utc>> {
        let mut remote_keys = HashSet::new();
        if let Some(remote) = &self.remote {
            match remote.list().await {
                Ok(objects) => remote_keys.extend(objects.into_iter().map(|o| o.key)),
                Err(e) => tracing::warn!(error = %e, "Could not list remote backups"),
            }
        }

        let mut timestamp = Utc::now().trunc_subsecs(0);
        loop {
            let file_name = format!("{}{ARCHIVE_SUFFIX}", archive_id(name, &timestamp));
            if !remote_keys.contains(&file_name)
                && !tokio::fs::try_exists(dir.join(&file_name)).await?
            {
                return Ok(timestamp);
            }
            timestamp += chrono::Duration::seconds(1);
        }
    }

    async fn capture(
        &self,
        record: &InstanceRecord,
        running: bool,
        staging: &Path,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let orch = &self.orchestrator;
        let name = &record.name;
        let instance_dir = orch.registry().paths().instance_dir(name);
        let disk = instance_dir.join(DISK_FILE);
        let export = staging.join(DISK_FILE);

        if running {
            let overlay = instance_dir.join(format!(
                "disk.backup-{}.qcow2",
                timestamp.format(TIMESTAMP_FORMAT)
            ));
            orch.control().snapshot(name, ROOT_TARGET, &overlay).await?;
            let exported = orch.disks().export(&disk, &export).await;
            let committed = orch.control().block_commit(name, ROOT_TARGET).await;
            match &committed {
                Ok(()) => match tokio::fs::remove_file(&overlay).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(path = %overlay.display(), error = %e, "Failed to remove overlay"),
                },
                Err(e) => tracing::error!(
                    instance = %name,
                    overlay = %overlay.display(),
                    error = %e,
                    "Block commit failed, guest still writes to the overlay"
                ),
            }
            exported?;
            committed?;
        } else {
            orch.disks().export(&disk, &export).await?;
        }

        let seed = instance_dir.join(SEED_FILE);
        let has_seed = tokio::fs::try_exists(&seed).await?;
        if has_seed {
            tokio::fs::copy(&seed, staging.join(SEED_FILE)).await?;
        }

        let mut snapshot = record.clone();
        snapshot.last_ip = None;
        write_json_atomic(&staging.join(RECORD_FILE), &snapshot)?;
        write_json_atomic(
            &staging.join(MANIFEST_FILE),
            &BackupManifest {
                format_version: FORMAT_VERSION,
                created_at: timestamp,
                disk: DISK_FILE.into(),
                record: RECORD_FILE.into(),
                seed: has_seed.then(|| SEED_FILE.to_string()),
                disk_gb: record.disk_gb,
                live: running,
            },
        )
    }

    /// Local archives and remote objects, newest first. An archive present
    /// in both places is listed once, as local and mirrored.
    pub async fn backups(&self) -> Result<Vec<BackupRecord>> {
        let mut by_id: BTreeMap<String, BackupRecord> = BTreeMap::new();

        let dir = self.dir();
        match std::fs::read_dir(&dir) {
            Ok(entries) => {
                for entry in entries {
                    let entry = entry?;
                    let file_name = entry.file_name().to_string_lossy().to_string();
                    let Some((name, timestamp)) = parse_archive_name(&file_name) else {
                        continue;
                    };
                    if !entry.file_type()?.is_file() {
                        continue;
                    }
                    let record = BackupRecord {
                        name,
                        timestamp,
                        size: entry.metadata()?.len(),
                        origin: BackupOrigin::Local,
                        mirrored: false,
                        location: entry.path().display().to_string(),
                    };
                    by_id.insert(record.id(), record);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if let Some(remote) = &self.remote {
            match remote.list().await {
                Ok(objects) => {
                    for object in objects {
                        let Some((name, timestamp)) = parse_archive_name(&object.key) else {
                            continue;
                        };
                        let id = archive_id(&name, &timestamp);
                        match by_id.get_mut(&id) {
                            Some(local) => local.mirrored = true,
                            None => {
                                by_id.insert(
                                    id,
                                    BackupRecord {
                                        name,
                                        timestamp,
                                        size: object.size,
                                        origin: BackupOrigin::Remote,
                                        mirrored: false,
                                        location: object.key,
                                    },
                                );
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(remote = %remote.describe(), error = %e, "Failed to list remote backups");
                }
            }
        }

        let mut records: Vec<_> = by_id.into_values().collect();
        records.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| a.name.cmp(&b.name))
        });
        Ok(records)
    }

    /// Recreate an instance from an archive.
    ///
    /// # Errors
    /// `NameConflict` when the target name exists and `force` is unset;
    /// remote download failures are fatal. Anything created before a
    /// failure is removed again.
    pub async fn restore(&self, request: RestoreRequest) -> Result<RestoreOutcome> {
        let start = Instant::now();
        let archive = self.resolve(&request.reference).await?;
        let staging = self
            .dir()
            .join(format!(".restore-{}", Uuid::new_v4().simple()));
        tokio::fs::create_dir_all(&staging).await?;

        let result = self.restore_from(&archive, &staging, &request).await;
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to remove staging directory");
        }
        if let Ok(outcome) = &result {
            tracing::info!(
                instance = %outcome.record.name,
                archive = %archive.display(),
                elapsed_ms = start.elapsed().as_millis() as u64,
                "Restore complete"
            );
        }
        result
    }

    /// Turn a reference into a local archive path, downloading it if it
    /// only exists remotely.
    async fn resolve(&self, reference: &str) -> Result<PathBuf> {
        let path = Path::new(reference);
        if path.is_file() {
            return Ok(path.to_path_buf());
        }

        let id = reference.strip_suffix(ARCHIVE_SUFFIX).unwrap_or(reference);
        let file_name = format!("{id}{ARCHIVE_SUFFIX}");
        if id.contains('/') || parse_archive_name(&file_name).is_none() {
            return Err(CoreError::NotFound(format!("backup {reference}")));
        }

        let local = self.dir().join(&file_name);
        if local.is_file() {
            return Ok(local);
        }
        if let Some(remote) = &self.remote {
            tokio::fs::create_dir_all(self.dir()).await?;
            remote.download(&file_name, &local).await?;
            return Ok(local);
        }
        Err(CoreError::NotFound(format!("backup {reference}")))
    }

    async fn restore_from(
        &self,
        archive: &Path,
        staging: &Path,
        request: &RestoreRequest,
    ) -> Result<RestoreOutcome> {
        let orch = &self.orchestrator;
        let (src, dest) = (archive.to_path_buf(), staging.to_path_buf());
        tokio::task::spawn_blocking(move || unpack_archive(&src, &dest))
            .await
            .map_err(|e| CoreError::storage_with("unpack task failed", e))??;

        let manifest: BackupManifest = read_json(&staging.join(MANIFEST_FILE)).await?;
        if manifest.format_version != FORMAT_VERSION {
            return Err(CoreError::Validation(format!(
                "unsupported backup format version {}",
                manifest.format_version
            )));
        }
        let original: InstanceRecord = read_json(&staging.join(&manifest.record)).await?;
        let name = request.name.clone().unwrap_or_else(|| original.name.clone());
        validate_name(&name)?;

        let _lock = orch.lock(&name).await;
        if let Some(existing) = orch.registry().get(&name)? {
            if !request.force {
                return Err(CoreError::NameConflict(name));
            }
            tracing::info!(instance = %name, "Replacing existing instance");
            orch.delete_locked(existing).await?;
        } else if orch.live_state(&name).await?.is_some() {
            return Err(CoreError::NameConflict(format!(
                "{name} (defined in libvirt but not managed by nox)"
            )));
        }

        let mac_taken = orch
            .registry()
            .list()?
            .iter()
            .any(|r| r.mac.eq_ignore_ascii_case(&original.mac));
        let new_identity = mac_taken || name != original.name;

        let mut record = InstanceRecord {
            name: name.clone(),
            state: InstanceState::Creating,
            disk_gb: manifest.disk_gb.max(original.disk_gb),
            base_image: None,
            last_ip: None,
            ..original
        };
        if mac_taken {
            record.mac = orch.unused_mac()?;
            tracing::info!(instance = %name, mac = %record.mac, "MAC in use, assigned a new one");
        }

        let instance_dir = orch.registry().paths().instance_dir(&name);
        tokio::fs::create_dir_all(&instance_dir).await?;
        let mut defined = false;
        let result = self
            .install(
                &mut record,
                &manifest,
                staging,
                new_identity,
                request.start,
                &mut defined,
            )
            .await;

        match result {
            Ok(password) => Ok(RestoreOutcome { record, password }),
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "Restore failed, cleaning up");
                if defined {
                    let _ = orch.control().destroy(&name).await;
                    if let Err(e) = orch.control().undefine(&name).await {
                        tracing::warn!(instance = %name, error = %e, "Cleanup: undefine failed");
                    }
                }
                if let Err(e) = tokio::fs::remove_dir_all(&instance_dir).await {
                    tracing::warn!(instance = %name, error = %e, "Cleanup: failed to remove files");
                }
                Err(e)
            }
        }
    }

    async fn install(
        &self,
        record: &mut InstanceRecord,
        manifest: &BackupManifest,
        staging: &Path,
        new_identity: bool,
        start: bool,
        defined: &mut bool,
    ) -> Result<Option<Secret>> {
        let orch = &self.orchestrator;
        let instance_dir = orch.registry().paths().instance_dir(&record.name);
        tokio::fs::rename(staging.join(&manifest.disk), instance_dir.join(DISK_FILE)).await?;

        // A copy under a new name or MAC gets its own cloud-init identity;
        // otherwise the archived seed is reused unchanged.
        let password = if new_identity {
            record.id = Uuid::new_v4();
            let password = Secret::generate_password();
            orch.write_seed(record, &password, &[]).await?;
            Some(password)
        } else {
            if let Some(seed) = &manifest.seed {
                tokio::fs::rename(staging.join(seed), instance_dir.join(SEED_FILE)).await?;
            }
            None
        };
        orch.registry().put(record)?;

        orch.define(record).await?;
        *defined = true;

        if start {
            orch.control().start(&record.name).await?;
            record.state = InstanceState::Running;
        } else {
            record.state = InstanceState::Stopped;
        }
        orch.registry().put(record)?;
        Ok(password)
    }
}

impl fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupEngine")
            .field("dir", &self.dir())
            .field("remote", &self.remote.as_ref().map(|r| r.describe()))
            .finish()
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        CoreError::storage_with(format!("archive is missing {}", path.display()), e)
    })?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Pack the staging directory into `dest` through a temporary file.
fn write_archive(staging: &Path, dest: &Path) -> Result<()> {
    let file_name = dest
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp = dest.with_file_name(format!(".{file_name}.tmp"));

    let written = (|| -> Result<()> {
        let file = std::fs::File::create(&tmp)?;
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for entry in [MANIFEST_FILE, RECORD_FILE, SEED_FILE, DISK_FILE] {
            let path = staging.join(entry);
            if path.exists() {
                builder.append_path_with_name(&path, entry)?;
            }
        }
        let file = builder.into_inner()?.finish()?;
        file.sync_all()?;
        Ok(())
    })();

    if let Err(e) = written {
        let _ = std::fs::remove_file(&tmp);
        return Err(e);
    }
    // hard_link refuses an existing destination, unlike rename.
    let linked = std::fs::hard_link(&tmp, dest);
    let _ = std::fs::remove_file(&tmp);
    match linked {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(CoreError::storage(
            format!("backup archive {} already exists", dest.display()),
        )),
        Err(e) => Err(e.into()),
    }
}

fn unpack_archive(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)?;
    tar::Archive::new(GzDecoder::new(file))
        .unpack(dest)
        .map_err(|e| CoreError::storage_with(format!("failed to unpack {}", archive.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{harness, Harness};
    use crate::lifecycle::CreateRequest;
    use crate::remote::{ObjectStoreRemote, RemoteObject};
    use async_trait::async_trait;
    use nox_vm::DomainState;
    use object_store::memory::InMemory;

    fn engine(h: &Harness, remote: Option<Arc<dyn RemoteStore>>) -> BackupEngine {
        BackupEngine::new(h.orch.clone(), remote)
    }

    fn memory_remote() -> Arc<dyn RemoteStore> {
        Arc::new(ObjectStoreRemote::with_store(
            Arc::new(InMemory::new()),
            "nox-backups",
            "memory://nox-backups",
        ))
    }

    async fn create(h: &Harness, name: &str) -> InstanceRecord {
        let request = CreateRequest {
            cpus: Some(2.0),
            ram: Some(1024.0),
            disk: Some(10.0),
            ..CreateRequest::new(name)
        };
        h.orch.create(request).await.unwrap().0
    }

    fn restore_request(reference: &str) -> RestoreRequest {
        RestoreRequest {
            reference: reference.to_string(),
            name: None,
            force: false,
            start: true,
        }
    }

    fn archive_entries(path: &Path) -> Vec<String> {
        let file = std::fs::File::open(path).unwrap();
        let mut archive = tar::Archive::new(GzDecoder::new(file));
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().to_string())
            .collect()
    }

    struct FailingRemote;

    #[async_trait]
    impl RemoteStore for FailingRemote {
        async fn upload(&self, _key: &str, _file: &Path) -> Result<()> {
            Err(CoreError::storage("connection refused"))
        }

        async fn download(&self, key: &str, _dest: &Path) -> Result<()> {
            Err(CoreError::NotFound(key.to_string()))
        }

        async fn list(&self) -> Result<Vec<RemoteObject>> {
            Err(CoreError::storage("connection refused"))
        }

        fn describe(&self) -> String {
            "s3://unreachable".into()
        }
    }

    #[test]
    fn test_parse_archive_name() {
        let (name, ts) = parse_archive_name("web-01_20240501T120304Z.tar.gz").unwrap();
        assert_eq!(name, "web-01");
        assert_eq!(archive_id(&name, &ts), "web-01_20240501T120304Z");

        assert!(parse_archive_name("web-01_20240501T120304Z.zip").is_none());
        assert!(parse_archive_name("web-01.tar.gz").is_none());
        assert!(parse_archive_name("web-01_yesterday.tar.gz").is_none());
        assert!(parse_archive_name(".web-01_20240501T120304Z.tar.gz.tmp").is_none());
    }

    #[tokio::test]
    async fn test_backup_running_uses_snapshot() {
        let h = harness();
        create(&h, "vm1").await;
        let engine = engine(&h, None);

        let outcome = engine.backup("vm1").await.unwrap();
        assert!(outcome.warning.is_none());
        assert_eq!(outcome.backup.origin, BackupOrigin::Local);
        assert!(!outcome.backup.mirrored);
        assert_eq!(h.control.count("snapshot"), 1);
        assert_eq!(h.control.count("block_commit"), 1);
        assert_eq!(h.control.domain("vm1").unwrap().state, DomainState::Running);

        let path = PathBuf::from(&outcome.backup.location);
        let mut entries = archive_entries(&path);
        entries.sort();
        assert_eq!(
            entries,
            vec![DISK_FILE, RECORD_FILE, MANIFEST_FILE, SEED_FILE]
        );

        // Overlay merged and removed, staging cleaned up.
        let mut left: Vec<_> = std::fs::read_dir(h.paths.instance_dir("vm1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        left.sort();
        assert_eq!(left, vec![DISK_FILE, RECORD_FILE, SEED_FILE]);
        assert_eq!(std::fs::read_dir(h.paths.backups()).unwrap().count(), 1);
    }

    #[tokio::test]
    async fn test_back_to_back_backups_get_distinct_archives() {
        let h = harness();
        create(&h, "vm1").await;
        let remote = memory_remote();
        let engine = engine(&h, Some(remote.clone()));

        let first = engine.backup("vm1").await.unwrap().backup;
        let second = engine.backup("vm1").await.unwrap().backup;
        assert_ne!(first.id(), second.id());
        assert!(second.timestamp > first.timestamp);
        assert!(Path::new(&first.location).exists());
        assert!(Path::new(&second.location).exists());
        assert_eq!(engine.backups().await.unwrap().len(), 2);

        // An id that only survives remotely is not reused either.
        std::fs::remove_file(&second.location).unwrap();
        let third = engine.backup("vm1").await.unwrap().backup;
        assert_ne!(third.id(), second.id());
        assert_eq!(remote.list().await.unwrap().len(), 3);
    }

    #[test]
    fn test_write_archive_refuses_existing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        std::fs::write(staging.join(MANIFEST_FILE), b"{}").unwrap();
        let dest = dir.path().join("vm1_20240501T120000Z.tar.gz");
        std::fs::write(&dest, b"existing archive").unwrap();

        let err = write_archive(&staging, &dest).unwrap_err();
        assert!(matches!(err, CoreError::Storage { .. }));
        assert_eq!(std::fs::read(&dest).unwrap(), b"existing archive");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 2);
    }

    #[tokio::test]
    async fn test_backup_stopped_exports_directly() {
        let h = harness();
        create(&h, "vm1").await;
        h.orch.stop("vm1").await.unwrap();

        engine(&h, None).backup("vm1").await.unwrap();
        assert_eq!(h.control.count("snapshot"), 0);
        assert_eq!(h.disks.count("export"), 1);
    }

    #[tokio::test]
    async fn test_backup_restore_round_trip() {
        let h = harness();
        let original = create(&h, "vm1").await;
        let engine = engine(&h, None);
        let backup = engine.backup("vm1").await.unwrap().backup;

        h.orch.delete("vm1").await.unwrap();
        let outcome = engine.restore(restore_request(&backup.id())).await.unwrap();

        let record = outcome.record;
        assert!(outcome.password.is_none());
        assert_eq!(record.name, "vm1");
        assert_eq!(record.id, original.id);
        assert_eq!(record.vcpus, original.vcpus);
        assert_eq!(record.ram_mb, original.ram_mb);
        assert_eq!(record.disk_gb, original.disk_gb);
        assert_eq!(record.mac, original.mac);
        assert_eq!(record.base_image, None);
        assert_eq!(record.state, InstanceState::Running);
        assert_eq!(h.orch.registry().require("vm1").unwrap(), record);

        let domain = h.control.domain("vm1").unwrap();
        assert_eq!(domain.state, DomainState::Running);
        assert_eq!(domain.definition.network.mac, original.mac);
        let dir = h.paths.instance_dir("vm1");
        assert!(dir.join(DISK_FILE).exists());
        assert!(dir.join(SEED_FILE).exists());
    }

    #[tokio::test]
    async fn test_restore_name_conflict_leaves_target_untouched() {
        let h = harness();
        create(&h, "vm1").await;
        let target = create(&h, "vm2").await;
        let engine = engine(&h, None);
        let backup = engine.backup("vm1").await.unwrap().backup;

        let request = RestoreRequest {
            name: Some("vm2".into()),
            ..restore_request(&backup.id())
        };
        let err = engine.restore(request).await.unwrap_err();
        assert!(matches!(err, CoreError::NameConflict(_)));
        assert_eq!(h.orch.registry().require("vm2").unwrap(), target);
        assert_eq!(h.control.domain("vm2").unwrap().state, DomainState::Running);
        assert_eq!(h.control.count("undefine"), 0);
    }

    #[tokio::test]
    async fn test_restore_copy_gets_new_identity() {
        let h = harness();
        let original = create(&h, "vm1").await;
        let engine = engine(&h, None);
        let backup = engine.backup("vm1").await.unwrap().backup;

        let request = RestoreRequest {
            name: Some("vm1-copy".into()),
            start: false,
            ..restore_request(&backup.id())
        };
        let outcome = engine.restore(request).await.unwrap();
        assert_ne!(outcome.record.mac, original.mac);
        assert_ne!(outcome.record.id, original.id);
        assert_eq!(outcome.record.state, InstanceState::Stopped);
        assert_eq!(outcome.password.map(|p| p.expose().len()), Some(16));
        assert_eq!(h.orch.registry().require("vm1").unwrap(), original);
    }

    #[tokio::test]
    async fn test_restore_force_replaces() {
        let h = harness();
        let original = create(&h, "vm1").await;
        let engine = engine(&h, None);
        let backup = engine.backup("vm1").await.unwrap().backup;
        h.orch
            .resize(
                "vm1",
                &crate::resources::ResizeRequest {
                    disk: Some(40.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let request = RestoreRequest {
            force: true,
            ..restore_request(&backup.location)
        };
        let outcome = engine.restore(request).await.unwrap();
        assert_eq!(outcome.record.disk_gb, 10);
        assert_eq!(outcome.record.mac, original.mac);
        assert_eq!(h.control.count("undefine"), 1);
    }

    #[tokio::test]
    async fn test_restore_cleans_up_on_failure() {
        let h = harness();
        create(&h, "vm1").await;
        let engine = engine(&h, None);
        let backup = engine.backup("vm1").await.unwrap().backup;
        h.orch.delete("vm1").await.unwrap();

        h.control.fail_on("define");
        engine.restore(restore_request(&backup.id())).await.unwrap_err();
        assert!(!h.orch.registry().exists("vm1"));
        assert!(!h.paths.instance_dir("vm1").exists());

        h.control.heal("define");
        engine.restore(restore_request(&backup.id())).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_unknown_reference() {
        let h = harness();
        let engine = engine(&h, None);
        for reference in ["vm1_20240101T000000Z", "no-such-file.tar.gz", "/tmp/nope/x"] {
            let err = engine.restore(restore_request(reference)).await.unwrap_err();
            assert!(matches!(err, CoreError::NotFound(_)), "{reference}: {err}");
        }
    }

    #[tokio::test]
    async fn test_backup_mirrors_and_lists_once() {
        let h = harness();
        create(&h, "vm1").await;
        let remote = memory_remote();
        let engine = engine(&h, Some(remote.clone()));

        let outcome = engine.backup("vm1").await.unwrap();
        assert_eq!(outcome.backup.origin, BackupOrigin::Remote);
        assert!(outcome.backup.mirrored);

        // An older archive that only exists remotely.
        let dir = tempfile::tempdir().unwrap();
        let other = dir.path().join("vm9_20240101T000000Z.tar.gz");
        std::fs::write(&other, b"archive").unwrap();
        remote.upload("vm9_20240101T000000Z.tar.gz", &other).await.unwrap();

        let listed = engine.backups().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].name, "vm1");
        assert_eq!(listed[0].origin, BackupOrigin::Local);
        assert!(listed[0].mirrored);
        assert_eq!(listed[1].name, "vm9");
        assert_eq!(listed[1].origin, BackupOrigin::Remote);
        assert!(!listed[1].mirrored);
        assert_eq!(listed[1].location, "vm9_20240101T000000Z.tar.gz");
    }

    #[tokio::test]
    async fn test_restore_downloads_remote_only_backup() {
        let h = harness();
        let original = create(&h, "vm1").await;
        let engine = engine(&h, Some(memory_remote()));
        let backup = engine.backup("vm1").await.unwrap().backup;

        std::fs::remove_file(&backup.location).unwrap();
        h.orch.delete("vm1").await.unwrap();

        let outcome = engine.restore(restore_request(&backup.id())).await.unwrap();
        assert_eq!(outcome.record.mac, original.mac);
        assert!(Path::new(&backup.location).exists());
    }

    #[tokio::test]
    async fn test_upload_failure_is_a_warning() {
        let h = harness();
        create(&h, "vm1").await;
        let engine = engine(&h, Some(Arc::new(FailingRemote)));

        let outcome = engine.backup("vm1").await.unwrap();
        assert_eq!(outcome.backup.origin, BackupOrigin::Local);
        assert!(outcome.warning.unwrap().contains("s3://unreachable"));
        assert!(Path::new(&outcome.backup.location).exists());

        // Listing still works from local archives alone.
        assert_eq!(engine.backups().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_backup_rejects_errored_instance() {
        let h = harness();
        h.control.fail_on("define");
        h.orch
            .create(CreateRequest::new("vm1"))
            .await
            .unwrap_err();
        let err = engine(&h, None).backup("vm1").await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }
}
