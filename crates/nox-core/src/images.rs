//! Image Cache Manager.
//!
//! Base cloud images are downloaded once per (OS, architecture) pair and
//! shared by every instance layered on them. Downloads stream to a unique
//! temporary file while hashing and are renamed into place only when the
//! checksum matches, so readers never observe a partial image.
//!
//! ## Layout
//!
//! ```text
//! images/
//! ├── index.json              # entries and reference counts
//! ├── debian-x86_64.qcow2
//! └── alpine-aarch64.qcow2
//! ```

use crate::config::write_json_atomic;
use crate::error::{CoreError, Result};
use crate::lock::KeyedLocks;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;

/// Name of the cache index file.
pub const INDEX_FILE: &str = "index.json";

/// Digest used by a catalog's checksum list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DigestAlgorithm {
    Sha256,
    Sha512,
}

impl fmt::Display for DigestAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sha256 => write!(f, "sha256"),
            Self::Sha512 => write!(f, "sha512"),
        }
    }
}

enum Hasher {
    Sha256(Sha256),
    Sha512(Sha512),
}

impl Hasher {
    fn new(algorithm: DigestAlgorithm) -> Self {
        match algorithm {
            DigestAlgorithm::Sha256 => Self::Sha256(Sha256::new()),
            DigestAlgorithm::Sha512 => Self::Sha512(Sha512::new()),
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    fn finish(self) -> String {
        match self {
            Self::Sha256(h) => hex::encode(h.finalize()),
            Self::Sha512(h) => hex::encode(h.finalize()),
        }
    }
}

/// Where to download an OS image from.
///
/// Templates may use `{arch}` (`amd64`/`arm64`), `{uname}`
/// (`x86_64`/`aarch64`) and `{firmware}` (`bios`/`uefi`). `checksum_url`
/// may also use `{url}` for the expanded image URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogEntry {
    pub url: String,
    pub checksum_url: String,
    pub algorithm: DigestAlgorithm,
    #[serde(default)]
    pub description: String,
}

/// A catalog entry expanded for one architecture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedImage {
    pub url: String,
    pub checksum_url: String,
    pub algorithm: DigestAlgorithm,
    /// File name looked up in the checksum list
    pub file_name: String,
}

/// Known images by OS id.
#[derive(Debug, Clone)]
pub struct Catalog {
    entries: BTreeMap<String, CatalogEntry>,
}

impl Default for Catalog {
    fn default() -> Self {
        Self {
            entries: builtin_catalog(),
        }
    }
}

fn builtin_catalog() -> BTreeMap<String, CatalogEntry> {
    let mut entries = BTreeMap::new();
    entries.insert(
        "debian".to_string(),
        CatalogEntry {
            url: "https://cloud.debian.org/images/cloud/bookworm/latest/debian-12-genericcloud-{arch}.qcow2".into(),
            checksum_url: "https://cloud.debian.org/images/cloud/bookworm/latest/SHA512SUMS".into(),
            algorithm: DigestAlgorithm::Sha512,
            description: "Debian 12 (bookworm) generic cloud".into(),
        },
    );
    entries.insert(
        "ubuntu".to_string(),
        CatalogEntry {
            url: "https://cloud-images.ubuntu.com/releases/noble/release/ubuntu-24.04-server-cloudimg-{arch}.img".into(),
            checksum_url: "https://cloud-images.ubuntu.com/releases/noble/release/SHA256SUMS".into(),
            algorithm: DigestAlgorithm::Sha256,
            description: "Ubuntu 24.04 LTS server cloud image".into(),
        },
    );
    entries.insert(
        "alpine".to_string(),
        CatalogEntry {
            url: "https://dl-cdn.alpinelinux.org/alpine/v3.20/releases/cloud/nocloud_alpine-3.20.3-{uname}-{firmware}-cloudinit-r0.qcow2".into(),
            checksum_url: "{url}.sha512".into(),
            algorithm: DigestAlgorithm::Sha512,
            description: "Alpine 3.20 NoCloud".into(),
        },
    );
    entries
}

impl Catalog {
    /// Built-in entries with `overrides` layered on top.
    pub fn with_overrides(overrides: &BTreeMap<String, CatalogEntry>) -> Self {
        let mut entries = builtin_catalog();
        entries.extend(overrides.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { entries }
    }

    pub fn entries(&self) -> &BTreeMap<String, CatalogEntry> {
        &self.entries
    }

    /// Expand the entry for `os` on `arch`.
    pub fn resolve(&self, os: &str, arch: &str) -> Result<ResolvedImage> {
        let entry = self.entries.get(os).ok_or_else(|| {
            CoreError::Validation(format!(
                "unknown OS {os:?} (available: {})",
                self.entries.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;
        let (deb, uname, firmware) = match arch {
            "x86_64" | "amd64" => ("amd64", "x86_64", "bios"),
            "aarch64" | "arm64" => ("arm64", "aarch64", "uefi"),
            other => {
                return Err(CoreError::Validation(format!(
                    "unsupported architecture: {other}"
                )))
            }
        };
        let expand = |t: &str| {
            t.replace("{arch}", deb)
                .replace("{uname}", uname)
                .replace("{firmware}", firmware)
        };
        let url = expand(&entry.url);
        let checksum_url = expand(&entry.checksum_url).replace("{url}", &url);
        let file_name = url.rsplit('/').next().unwrap_or(&url).to_string();
        Ok(ResolvedImage {
            url,
            checksum_url,
            algorithm: entry.algorithm,
            file_name,
        })
    }
}

/// Normalized architecture of this host (`x86_64` or `aarch64`).
pub fn host_arch() -> &'static str {
    match std::env::consts::ARCH {
        "aarch64" => "aarch64",
        _ => "x86_64",
    }
}

/// Find the digest for `file_name` in a checksum list.
///
/// Accepts GNU (`<hex>  name`, `<hex> *name`) and BSD
/// (`SHA256 (name) = <hex>`) lines.
pub fn find_checksum(list: &str, file_name: &str) -> Option<String> {
    list.lines().find_map(|line| {
        let line = line.trim();
        if let Some(rest) = line.split_once(" (").map(|(_, r)| r) {
            if let Some((name, digest)) = rest.split_once(") = ") {
                return (name == file_name).then(|| digest.trim().to_lowercase());
            }
        }
        let mut parts = line.split_whitespace();
        let digest = parts.next()?;
        let name = parts.next()?.trim_start_matches('*');
        let name = name.rsplit('/').next().unwrap_or(name);
        (name == file_name && digest.chars().all(|c| c.is_ascii_hexdigit()))
            .then(|| digest.to_lowercase())
    })
}

/// Cache key: one image per (OS, architecture).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ImageKey {
    pub os: String,
    pub arch: String,
}

impl ImageKey {
    pub fn new(os: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            arch: arch.into(),
        }
    }
}

impl fmt::Display for ImageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.os, self.arch)
    }
}

/// A fully downloaded, verified base image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageEntry {
    pub os: String,
    pub arch: String,
    pub path: PathBuf,
    pub checksum: String,
    pub algorithm: DigestAlgorithm,
    pub size: u64,
    pub fetched_at: DateTime<Utc>,
    /// Instances whose disks are layered on this image
    pub refcount: u32,
}

impl ImageEntry {
    pub fn key(&self) -> ImageKey {
        ImageKey::new(&self.os, &self.arch)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ImageIndex {
    #[serde(default)]
    entries: BTreeMap<String, ImageEntry>,
}

/// Stream of downloaded chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// HTTP transport used by the cache.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Open `url` for streaming.
    async fn fetch(&self, url: &str) -> Result<ByteStream>;
}

/// [`Fetcher`] backed by `reqwest`.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(concat!("nox/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| CoreError::storage_with("failed to build HTTP client", e))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<ByteStream> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| CoreError::storage_with(format!("failed to download {url}"), e))?
            .error_for_status()
            .map_err(|e| CoreError::storage_with(format!("failed to download {url}"), e))?;

        Ok(response
            .bytes_stream()
            .map_err(|e| CoreError::storage_with("download interrupted", e))
            .boxed())
    }
}

/// Shared base image cache.
pub struct ImageCache {
    dir: PathBuf,
    catalog: Catalog,
    fetcher: Arc<dyn Fetcher>,
    downloads: KeyedLocks<ImageKey>,
    index_lock: tokio::sync::Mutex<()>,
}

impl ImageCache {
    pub fn new(dir: impl Into<PathBuf>, catalog: Catalog, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            dir: dir.into(),
            catalog,
            fetcher,
            downloads: KeyedLocks::new(),
            index_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Final path of the image for `key`.
    pub fn image_path(&self, key: &ImageKey) -> PathBuf {
        self.dir.join(format!("{key}.qcow2"))
    }

    /// Return a verified local copy of `os` for `arch`, downloading it if
    /// needed. Concurrent callers for the same pair share one download.
    pub async fn acquire(&self, os: &str, arch: &str) -> Result<ImageEntry> {
        let key = ImageKey::new(os, arch);
        let _guard = self.downloads.lock(&key).await;
        self.acquire_locked(&key).await
    }

    /// [`ImageCache::acquire`] plus one reference, taken before the per-image
    /// lock is dropped so a concurrent `prune` cannot delete the file
    /// between download and use.
    pub async fn acquire_retained(&self, os: &str, arch: &str) -> Result<ImageEntry> {
        let key = ImageKey::new(os, arch);
        let _guard = self.downloads.lock(&key).await;
        let mut entry = self.acquire_locked(&key).await?;
        entry.refcount = self.retain(&key).await?;
        Ok(entry)
    }

    /// Caller holds the download lock for `key`.
    async fn acquire_locked(&self, key: &ImageKey) -> Result<ImageEntry> {
        let image = self.catalog.resolve(&key.os, &key.arch)?;

        if let Some(entry) = self.lookup(key).await? {
            if entry.path.exists() {
                tracing::debug!(image = %key, "Image cache hit");
                return Ok(entry);
            }
            tracing::warn!(image = %key, path = %entry.path.display(), "Cached image missing, downloading again");
        }

        let (checksum, size) = self.download(key, &image).await?;

        let _index = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let refcount = index
            .entries
            .get(&key.to_string())
            .map(|e| e.refcount)
            .unwrap_or(0);
        let entry = ImageEntry {
            os: key.os.clone(),
            arch: key.arch.clone(),
            path: self.image_path(key),
            checksum,
            algorithm: image.algorithm,
            size,
            fetched_at: Utc::now(),
            refcount,
        };
        index.entries.insert(key.to_string(), entry.clone());
        self.save_index(&index)?;
        Ok(entry)
    }

    async fn download(&self, key: &ImageKey, image: &ResolvedImage) -> Result<(String, u64)> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let start = Instant::now();

        let list = self.fetch_text(&image.checksum_url).await?;
        let expected = find_checksum(&list, &image.file_name).ok_or_else(|| {
            CoreError::storage(format!(
                "no checksum for {} in {}",
                image.file_name, image.checksum_url
            ))
        })?;

        tracing::info!(image = %key, url = %image.url, "Downloading base image");
        let tmp = self
            .dir
            .join(format!(".{key}.{}.part", uuid::Uuid::new_v4().simple()));

        let result = self.stream_to(&image.url, &tmp, image.algorithm).await;
        let (actual, size) = match result {
            Ok(v) => v,
            Err(e) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(e);
            }
        };

        if actual != expected {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(CoreError::storage(format!(
                "checksum mismatch for {key}: expected {expected}, got {actual}"
            )));
        }

        let dest = self.image_path(key);
        if let Err(e) = tokio::fs::rename(&tmp, &dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        tracing::info!(
            image = %key,
            size,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Base image cached"
        );
        Ok((actual, size))
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let mut stream = self.fetcher.fetch(url).await?;
        let mut buf = Vec::new();
        while let Some(chunk) = stream.next().await {
            buf.extend_from_slice(&chunk?);
        }
        String::from_utf8(buf).map_err(|e| CoreError::storage_with("checksum list is not UTF-8", e))
    }

    async fn stream_to(
        &self,
        url: &str,
        dest: &Path,
        algorithm: DigestAlgorithm,
    ) -> Result<(String, u64)> {
        let mut stream = self.fetcher.fetch(url).await?;
        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = Hasher::new(algorithm);
        let mut size = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
            size += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok((hasher.finish(), size))
    }

    async fn lookup(&self, key: &ImageKey) -> Result<Option<ImageEntry>> {
        let _index = self.index_lock.lock().await;
        Ok(self.load_index().await?.entries.remove(&key.to_string()))
    }

    /// Record one more instance layered on `key`.
    pub async fn retain(&self, key: &ImageKey) -> Result<u32> {
        self.adjust(key, |n| n.saturating_add(1)).await
    }

    /// Drop one reference to `key`. The image itself stays until `prune`.
    pub async fn release(&self, key: &ImageKey) -> Result<u32> {
        self.adjust(key, |n| n.saturating_sub(1)).await
    }

    async fn adjust(&self, key: &ImageKey, f: impl FnOnce(u32) -> u32) -> Result<u32> {
        let _index = self.index_lock.lock().await;
        let mut index = self.load_index().await?;
        let entry = index
            .entries
            .get_mut(&key.to_string())
            .ok_or_else(|| CoreError::NotFound(format!("image {key}")))?;
        entry.refcount = f(entry.refcount);
        let refcount = entry.refcount;
        self.save_index(&index)?;
        tracing::debug!(image = %key, refcount, "Image reference count updated");
        Ok(refcount)
    }

    /// All cached images.
    pub async fn list(&self) -> Result<Vec<ImageEntry>> {
        let _index = self.index_lock.lock().await;
        Ok(self.load_index().await?.entries.into_values().collect())
    }

    /// Delete images no instance references. Returns what was removed.
    pub async fn prune(&self) -> Result<Vec<ImageEntry>> {
        let candidates: Vec<ImageKey> = self
            .list()
            .await?
            .into_iter()
            .filter(|e| e.refcount == 0)
            .map(|e| e.key())
            .collect();

        let mut removed = Vec::new();
        for key in candidates {
            let _download = self.downloads.lock(&key).await;
            let _index = self.index_lock.lock().await;
            let mut index = self.load_index().await?;
            let name = key.to_string();
            // Re-check under the lock; a create may have retained it meanwhile.
            if index.entries.get(&name).map(|e| e.refcount) != Some(0) {
                continue;
            }
            if let Some(entry) = index.entries.remove(&name) {
                match tokio::fs::remove_file(&entry.path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                self.save_index(&index)?;
                tracing::info!(image = %key, size = entry.size, "Pruned base image");
                removed.push(entry);
            }
        }
        Ok(removed)
    }

    async fn load_index(&self) -> Result<ImageIndex> {
        match tokio::fs::read(self.dir.join(INDEX_FILE)).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(ImageIndex::default()),
            Err(e) => Err(e.into()),
        }
    }

    fn save_index(&self, index: &ImageIndex) -> Result<()> {
        write_json_atomic(&self.dir.join(INDEX_FILE), index)
    }
}

impl fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageCache")
            .field("dir", &self.dir)
            .field("catalog", &self.catalog.entries.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Serves canned bodies and counts requests per URL.
    #[derive(Default)]
    pub(crate) struct FakeFetcher {
        bodies: Mutex<HashMap<String, Vec<u8>>>,
        hits: Mutex<HashMap<String, usize>>,
        pub(crate) total: AtomicUsize,
        pub(crate) delay: Option<Duration>,
    }

    impl FakeFetcher {
        pub(crate) fn serve(&self, url: &str, body: impl Into<Vec<u8>>) {
            self.bodies.lock().unwrap().insert(url.to_string(), body.into());
        }

        pub(crate) fn hits(&self, url: &str) -> usize {
            self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
        }
    }

    #[async_trait]
    impl Fetcher for FakeFetcher {
        async fn fetch(&self, url: &str) -> Result<ByteStream> {
            self.total.fetch_add(1, Ordering::SeqCst);
            *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            let body = self.bodies.lock().unwrap().get(url).cloned().ok_or_else(|| {
                CoreError::storage_with(
                    format!("failed to download {url}"),
                    std::io::Error::new(std::io::ErrorKind::NotFound, "404"),
                )
            })?;
            // Split in two chunks to exercise incremental hashing.
            let mid = body.len() / 2;
            let chunks = vec![
                Ok(Bytes::copy_from_slice(&body[..mid])),
                Ok(Bytes::copy_from_slice(&body[mid..])),
            ];
            Ok(futures::stream::iter(chunks).boxed())
        }
    }

    pub(crate) const TEST_URL: &str = "https://images.test/test-os-amd64.qcow2";
    pub(crate) const TEST_SUMS: &str = "https://images.test/SHA256SUMS";

    pub(crate) fn test_catalog() -> Catalog {
        let mut overrides = BTreeMap::new();
        overrides.insert(
            "testos".to_string(),
            CatalogEntry {
                url: "https://images.test/test-os-{arch}.qcow2".into(),
                checksum_url: TEST_SUMS.into(),
                algorithm: DigestAlgorithm::Sha256,
                description: String::new(),
            },
        );
        Catalog::with_overrides(&overrides)
    }

    /// Fetcher serving a valid `testos` image for x86_64.
    pub(crate) fn serving_fetcher(body: &[u8]) -> FakeFetcher {
        let fetcher = FakeFetcher::default();
        let digest = hex::encode(Sha256::digest(body));
        fetcher.serve(TEST_URL, body.to_vec());
        fetcher.serve(
            TEST_SUMS,
            format!("{digest}  test-os-amd64.qcow2\nffff  other.qcow2\n"),
        );
        fetcher
    }

    #[test]
    fn test_catalog_expansion() {
        let catalog = Catalog::default();
        let debian = catalog.resolve("debian", "x86_64").unwrap();
        assert!(debian.url.ends_with("debian-12-genericcloud-amd64.qcow2"));
        assert_eq!(debian.file_name, "debian-12-genericcloud-amd64.qcow2");
        assert_eq!(debian.algorithm, DigestAlgorithm::Sha512);

        let alpine = catalog.resolve("alpine", "aarch64").unwrap();
        assert!(alpine.url.contains("aarch64-uefi"));
        assert_eq!(alpine.checksum_url, format!("{}.sha512", alpine.url));
    }

    #[test]
    fn test_catalog_unknown() {
        let catalog = Catalog::default();
        assert!(matches!(
            catalog.resolve("plan9", "x86_64"),
            Err(CoreError::Validation(_))
        ));
        assert!(matches!(
            catalog.resolve("debian", "riscv64"),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn test_find_checksum_formats() {
        let list = "\
abc123  debian-12-genericcloud-amd64.qcow2
def456 *ubuntu-24.04-server-cloudimg-amd64.img
SHA512 (alpine.qcow2) = FEED01
";
        assert_eq!(
            find_checksum(list, "debian-12-genericcloud-amd64.qcow2").as_deref(),
            Some("abc123")
        );
        assert_eq!(
            find_checksum(list, "ubuntu-24.04-server-cloudimg-amd64.img").as_deref(),
            Some("def456")
        );
        assert_eq!(find_checksum(list, "alpine.qcow2").as_deref(), Some("feed01"));
        assert_eq!(find_checksum(list, "missing.qcow2"), None);
    }

    #[tokio::test]
    async fn test_acquire_downloads_once() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(serving_fetcher(b"qcow2 image bytes"));
        let cache = ImageCache::new(dir.path(), test_catalog(), fetcher.clone());

        let first = cache.acquire("testos", "x86_64").await.unwrap();
        let second = cache.acquire("testos", "x86_64").await.unwrap();
        assert_eq!(first.path, second.path);
        assert_eq!(fetcher.hits(TEST_URL), 1);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"qcow2 image bytes");
        assert_eq!(first.size, 17);
        assert_eq!(first.refcount, 0);
    }

    #[tokio::test]
    async fn test_concurrent_acquire_single_download() {
        let dir = tempfile::tempdir().unwrap();
        let mut fetcher = serving_fetcher(b"shared image");
        fetcher.delay = Some(Duration::from_millis(20));
        let fetcher = Arc::new(fetcher);
        let cache = Arc::new(ImageCache::new(dir.path(), test_catalog(), fetcher.clone()));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move {
                cache.acquire("testos", "x86_64").await
            }));
        }
        let mut paths = Vec::new();
        for h in handles {
            paths.push(h.await.unwrap().unwrap().path);
        }
        assert_eq!(fetcher.hits(TEST_URL), 1);
        assert!(paths.windows(2).all(|w| w[0] == w[1]));
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = FakeFetcher::default();
        fetcher.serve(TEST_URL, b"tampered".to_vec());
        fetcher.serve(TEST_SUMS, "00ff  test-os-amd64.qcow2\n");
        let cache = ImageCache::new(dir.path(), test_catalog(), Arc::new(fetcher));

        let err = cache.acquire("testos", "x86_64").await.unwrap_err();
        assert!(matches!(err, CoreError::Storage { .. }));
        let leftovers: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert!(leftovers.is_empty());
        assert!(cache.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_surfaces_with_cause() {
        use std::error::Error as _;
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(dir.path(), test_catalog(), Arc::new(FakeFetcher::default()));
        let err = cache.acquire("testos", "x86_64").await.unwrap_err();
        assert!(matches!(err, CoreError::Storage { .. }));
        assert!(err.source().is_some());
    }

    #[tokio::test]
    async fn test_refcounts_and_prune() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(
            dir.path(),
            test_catalog(),
            Arc::new(serving_fetcher(b"img")),
        );
        let entry = cache.acquire("testos", "x86_64").await.unwrap();
        let key = entry.key();

        assert_eq!(cache.retain(&key).await.unwrap(), 1);
        assert_eq!(cache.retain(&key).await.unwrap(), 2);
        assert_eq!(cache.release(&key).await.unwrap(), 1);

        assert!(cache.prune().await.unwrap().is_empty());
        assert!(entry.path.exists());

        assert_eq!(cache.release(&key).await.unwrap(), 0);
        let removed = cache.prune().await.unwrap();
        assert_eq!(removed.len(), 1);
        assert!(!entry.path.exists());
        assert!(cache.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acquire_retained_counts_before_prune() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ImageCache::new(
            dir.path(),
            test_catalog(),
            Arc::new(serving_fetcher(b"img")),
        );
        let first = cache.acquire_retained("testos", "x86_64").await.unwrap();
        assert_eq!(first.refcount, 1);
        let second = cache.acquire_retained("testos", "x86_64").await.unwrap();
        assert_eq!(second.refcount, 2);

        assert!(cache.prune().await.unwrap().is_empty());
        assert!(first.path.exists());
    }

    #[tokio::test]
    async fn test_refcount_survives_redownload() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(serving_fetcher(b"img"));
        let cache = ImageCache::new(dir.path(), test_catalog(), fetcher.clone());
        let entry = cache.acquire("testos", "x86_64").await.unwrap();
        cache.retain(&entry.key()).await.unwrap();

        std::fs::remove_file(&entry.path).unwrap();
        let again = cache.acquire("testos", "x86_64").await.unwrap();
        assert_eq!(again.refcount, 1);
        assert_eq!(fetcher.hits(TEST_URL), 2);
    }
}
