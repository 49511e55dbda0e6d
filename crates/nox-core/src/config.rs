//! Configuration for nox.
//!
//! `config.json` under the data directory holds user settings. Every field
//! has a default, so a missing or partial file is fine. Remote store
//! credentials may also come from the environment.

use crate::error::{CoreError, Result};
use crate::images::CatalogEntry;
use crate::retry::RetryPolicy;
use crate::secret::Secret;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Complete nox configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoxConfig {
    /// Values used when `create` omits them
    #[serde(default)]
    pub defaults: Defaults,
    /// Written to the guest's `/etc/environment`
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Backup offload target
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    /// Additions to and overrides of the built-in image catalog
    #[serde(default)]
    pub images: BTreeMap<String, CatalogEntry>,
    /// How instances attach to the network and how addresses are found
    #[serde(default)]
    pub network: NetworkSettings,
    /// Floors applied to fractional resource requests
    #[serde(default)]
    pub minimums: Minimums,
    /// Polling policy while waiting for a booted guest's address
    #[serde(default = "default_boot_wait")]
    pub boot_wait: RetryPolicy,
    /// Retry policy for idempotent control-plane calls that time out
    #[serde(default = "default_call_retry")]
    pub call_retry: RetryPolicy,
    /// Seconds to wait for a graceful shutdown before forcing power-off
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout_secs: u64,
    /// Per-call control-plane timeout in seconds
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Timeout for long disk operations (export, convert) in seconds
    #[serde(default = "default_disk_timeout")]
    pub disk_timeout_secs: u64,
    /// Image download connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Image download read timeout in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// libvirt connection URI
    #[serde(default = "default_libvirt_uri")]
    pub libvirt_uri: String,
}

impl Default for NoxConfig {
    fn default() -> Self {
        Self {
            defaults: Defaults::default(),
            env: BTreeMap::new(),
            remote: None,
            images: BTreeMap::new(),
            network: NetworkSettings::default(),
            minimums: Minimums::default(),
            boot_wait: default_boot_wait(),
            call_retry: default_call_retry(),
            stop_timeout_secs: default_stop_timeout(),
            call_timeout_secs: default_call_timeout(),
            disk_timeout_secs: default_disk_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            read_timeout_secs: default_read_timeout(),
            libvirt_uri: default_libvirt_uri(),
        }
    }
}

fn default_boot_wait() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 30,
        initial_interval_ms: 1000,
        max_interval_ms: 5000,
        multiplier: 1.5,
    }
}

fn default_call_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_interval_ms: 500,
        max_interval_ms: 4000,
        multiplier: 2.0,
    }
}

fn default_stop_timeout() -> u64 {
    60
}

fn default_call_timeout() -> u64 {
    60
}

fn default_disk_timeout() -> u64 {
    1800
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    300
}

fn default_libvirt_uri() -> String {
    nox_vm::DEFAULT_URI.to_string()
}

impl NoxConfig {
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn disk_timeout(&self) -> Duration {
        Duration::from_secs(self.disk_timeout_secs)
    }

    /// Reject values that would make later operations misbehave.
    pub fn validate(&self) -> Result<()> {
        for (what, v) in [
            ("defaults.cpus", self.defaults.cpus),
            ("defaults.ram", self.defaults.ram),
            ("defaults.disk", self.defaults.disk),
        ] {
            if !v.is_finite() || v <= 0.0 {
                return Err(CoreError::Config(format!("{what} must be positive, got {v}")));
            }
        }
        if self.boot_wait.max_attempts == 0 || self.call_retry.max_attempts == 0 {
            return Err(CoreError::Config("retry max_attempts must be > 0".into()));
        }
        if self.call_timeout_secs == 0 {
            return Err(CoreError::Config("call_timeout_secs must be > 0".into()));
        }
        if let Some(remote) = &self.remote {
            if remote.bucket.is_empty() {
                return Err(CoreError::Config("remote.bucket is required".into()));
            }
        }
        Ok(())
    }

    /// Overlay values from the process environment.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `NOX_LIBVIRT_URI` | `libvirt_uri` |
    /// | `NOX_REMOTE_BUCKET` | `remote.bucket` |
    /// | `NOX_REMOTE_ENDPOINT` | `remote.endpoint` |
    /// | `NOX_REMOTE_REGION` | `remote.region` |
    /// | `NOX_REMOTE_ACCESS_KEY` | `remote.access_key` |
    /// | `NOX_REMOTE_SECRET_KEY` | `remote.secret_key` |
    /// | `NOX_REMOTE_PREFIX` | `remote.prefix` |
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(uri) = lookup("NOX_LIBVIRT_URI") {
            self.libvirt_uri = uri;
        }

        let bucket = lookup("NOX_REMOTE_BUCKET");
        if bucket.is_some() && self.remote.is_none() {
            self.remote = Some(RemoteConfig::default());
        }
        if let Some(remote) = self.remote.as_mut() {
            if let Some(bucket) = bucket {
                remote.bucket = bucket;
            }
            if let Some(endpoint) = lookup("NOX_REMOTE_ENDPOINT") {
                remote.endpoint = Some(endpoint);
            }
            if let Some(region) = lookup("NOX_REMOTE_REGION") {
                remote.region = region;
            }
            if let Some(key) = lookup("NOX_REMOTE_ACCESS_KEY") {
                remote.access_key = Some(key);
            }
            if let Some(secret) = lookup("NOX_REMOTE_SECRET_KEY") {
                remote.secret_key = Some(Secret::new(secret));
            }
            if let Some(prefix) = lookup("NOX_REMOTE_PREFIX") {
                remote.prefix = prefix;
            }
        }
    }
}

/// Defaults for `create`. Each is a fraction of the host (≤ 1.0) or an
/// absolute amount.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_os")]
    pub os: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// MB when absolute
    #[serde(default = "default_ram")]
    pub ram: f64,
    /// GB when absolute
    #[serde(default = "default_disk")]
    pub disk: f64,
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            os: default_os(),
            cpus: default_cpus(),
            ram: default_ram(),
            disk: default_disk(),
        }
    }
}

fn default_os() -> String {
    "debian".to_string()
}

fn default_cpus() -> f64 {
    1.0
}

fn default_ram() -> f64 {
    512.0
}

fn default_disk() -> f64 {
    5.0
}

/// S3-compatible object store for backups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Custom endpoint (MinIO, R2, ...); AWS when absent
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<Secret>,
    /// Key prefix for all backup objects
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Allow plain HTTP endpoints
    #[serde(default)]
    pub allow_http: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            bucket: String::new(),
            region: default_region(),
            access_key: None,
            secret_key: None,
            prefix: default_prefix(),
            allow_http: false,
        }
    }
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_prefix() -> String {
    "nox-backups".to_string()
}

/// Network attachment and address discovery settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkSettings {
    /// libvirt network to attach to when no bridge is set
    #[serde(default = "default_network")]
    pub network: String,
    /// Host bridge; takes precedence over `network`
    #[serde(default)]
    pub bridge: Option<String>,
    /// Where the ARP fallback sends its broadcast probe
    #[serde(default = "default_probe_target")]
    pub probe_target: Ipv4Addr,
    /// Probe rounds per `locate` call
    #[serde(default = "default_probe_attempts")]
    pub probe_attempts: u32,
    /// Pause between probe rounds in milliseconds
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            bridge: None,
            probe_target: default_probe_target(),
            probe_attempts: default_probe_attempts(),
            probe_interval_ms: default_probe_interval(),
        }
    }
}

fn default_network() -> String {
    "default".to_string()
}

fn default_probe_target() -> Ipv4Addr {
    Ipv4Addr::BROADCAST
}

fn default_probe_attempts() -> u32 {
    3
}

fn default_probe_interval() -> u64 {
    500
}

impl NetworkSettings {
    pub fn attachment(&self) -> nox_vm::NetworkAttachment {
        match &self.bridge {
            Some(bridge) => nox_vm::NetworkAttachment::Bridge {
                name: bridge.clone(),
            },
            None => nox_vm::NetworkAttachment::Network {
                name: self.network.clone(),
            },
        }
    }
}

/// Lower bounds for resolved resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Minimums {
    #[serde(default = "default_min_cpus")]
    pub cpus: u32,
    #[serde(default = "default_min_ram")]
    pub ram_mb: u64,
    #[serde(default = "default_min_disk")]
    pub disk_gb: u64,
}

impl Default for Minimums {
    fn default() -> Self {
        Self {
            cpus: default_min_cpus(),
            ram_mb: default_min_ram(),
            disk_gb: default_min_disk(),
        }
    }
}

fn default_min_cpus() -> u32 {
    1
}

fn default_min_ram() -> u64 {
    128
}

fn default_min_disk() -> u64 {
    1
}

/// On-disk locations under the data directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `$NOX_HOME`, or `~/.nox`.
    pub fn from_env() -> Result<Self> {
        if let Ok(home) = std::env::var("NOX_HOME") {
            return Ok(Self::new(home));
        }
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Config("cannot determine home directory".into()))?;
        Ok(Self::new(home.join(".nox")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn instances(&self) -> PathBuf {
        self.root.join("instances")
    }

    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.instances().join(name)
    }

    pub fn images(&self) -> PathBuf {
        self.root.join("images")
    }

    pub fn backups(&self) -> PathBuf {
        self.root.join("backups")
    }

    pub fn ssh(&self) -> PathBuf {
        self.root.join("ssh")
    }

    pub fn scripts(&self) -> PathBuf {
        self.root.join("scripts")
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Create the directory skeleton.
    pub fn ensure(&self) -> Result<()> {
        for dir in [
            self.instances(),
            self.images(),
            self.backups(),
            self.ssh(),
            self.scripts(),
        ] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Loads `config.json`, applies the environment overlay and supports
/// dotted-key reads and writes.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    config: NoxConfig,
}

impl ConfigStore {
    /// Load the config file at `path` (missing file means defaults) and
    /// overlay the process environment.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        Self::load_with(path, |key| std::env::var(key).ok())
    }

    /// Like [`ConfigStore::load`] with an explicit environment.
    pub fn load_with(
        path: impl Into<PathBuf>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let path = path.into();
        let mut config: NoxConfig = serde_json::from_value(read_tree(&path)?)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display())))?;
        config.apply_env(env);
        config.validate()?;
        tracing::debug!(path = %path.display(), "Configuration loaded");
        Ok(Self { path, config })
    }

    pub fn config(&self) -> &NoxConfig {
        &self.config
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-read the file.
    pub fn reload(&mut self) -> Result<()> {
        *self = Self::load(self.path.clone())?;
        Ok(())
    }

    /// Value at a dotted key of the effective configuration, or the whole
    /// tree when `key` is `None`. Unknown keys yield `None`. The remote
    /// secret key is redacted.
    pub fn get(&self, key: Option<&str>) -> Result<Option<Value>> {
        let mut tree = serde_json::to_value(&self.config)?;
        if let Some(secret) = tree
            .get_mut("remote")
            .and_then(|r| r.get_mut("secret_key"))
            .filter(|s| !s.is_null())
        {
            *secret = Value::String("***".into());
        }
        let Some(key) = key else {
            return Ok(Some(tree));
        };
        let mut node = &tree;
        for part in key.split('.') {
            match node.get(part) {
                Some(next) => node = next,
                None => return Ok(None),
            }
        }
        Ok(Some(node.clone()))
    }

    /// Set a dotted key in the file and reload.
    ///
    /// `raw` is parsed as JSON when possible (numbers, booleans, objects),
    /// otherwise stored as a string. Only the file is written; environment
    /// overrides are never persisted.
    pub fn set(&mut self, key: &str, raw: &str) -> Result<Value> {
        if key.is_empty() || key.split('.').any(str::is_empty) {
            return Err(CoreError::Validation(format!("invalid config key: {key:?}")));
        }

        let parsed = serde_json::from_str::<Value>(raw).unwrap_or_else(|_| Value::String(raw.into()));
        let original = read_tree(&self.path)?;

        // A value that parses as a number may still be meant as a string
        // (e.g. an OS id); fall back before giving up.
        let mut candidates = vec![parsed.clone()];
        if !parsed.is_string() {
            candidates.push(Value::String(raw.into()));
        }

        let mut last_err = None;
        for value in candidates {
            let mut tree = original.clone();
            set_path(&mut tree, key, value.clone())?;
            match serde_json::from_value::<NoxConfig>(tree.clone()) {
                Ok(candidate) => {
                    candidate.validate()?;
                    write_json_atomic(&self.path, &tree)?;
                    tracing::info!(key, path = %self.path.display(), "Configuration updated");
                    self.reload()?;
                    return Ok(value);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(CoreError::Config(format!(
            "invalid value for {key}: {}",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )))
    }
}

fn read_tree(path: &Path) -> Result<Value> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map_err(|e| CoreError::Config(format!("{}: {e}", path.display()))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Value::Object(Default::default())),
        Err(e) => Err(e.into()),
    }
}

fn set_path(tree: &mut Value, key: &str, value: Value) -> Result<()> {
    let parts: Vec<&str> = key.split('.').collect();
    let (last, parents) = parts
        .split_last()
        .ok_or_else(|| CoreError::Validation("empty config key".into()))?;

    let mut node = tree;
    for part in parents {
        let obj = node
            .as_object_mut()
            .ok_or_else(|| CoreError::Validation(format!("{key}: {part} is not an object")))?;
        node = obj
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(Default::default()));
        if node.is_null() {
            *node = Value::Object(Default::default());
        }
    }
    let obj = node
        .as_object_mut()
        .ok_or_else(|| CoreError::Validation(format!("{key}: parent is not an object")))?;
    obj.insert(last.to_string(), value);
    Ok(())
}

/// Write pretty JSON to a temporary file and rename it into place.
pub(crate) fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

/// Write bytes to a temporary sibling and rename it into place.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CoreError::storage(format!("invalid path: {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4().simple()));
    std::fs::write(&tmp, bytes)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
