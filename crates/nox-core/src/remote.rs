//! Remote object store for backup offload.

use crate::config::RemoteConfig;
use crate::error::{CoreError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Upload chunk size (object_store's multipart minimum is 5 MiB).
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Parts in flight per upload.
const MAX_CONCURRENCY: usize = 4;

/// One stored backup object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Key relative to the configured prefix
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Blob storage for backup archives.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Stream a local file to `key`.
    async fn upload(&self, key: &str, file: &Path) -> Result<()>;

    /// Stream `key` into `dest`, replacing it atomically.
    async fn download(&self, key: &str, dest: &Path) -> Result<()>;

    /// Objects under the prefix.
    async fn list(&self) -> Result<Vec<RemoteObject>>;

    /// Human-readable location, for messages.
    fn describe(&self) -> String;
}

/// [`RemoteStore`] over any `object_store` backend (S3-compatible in
/// production, in-memory in tests).
pub struct ObjectStoreRemote {
    store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
    label: String,
}

impl ObjectStoreRemote {
    /// Build an S3 client from configuration. Missing credentials fall
    /// back to the usual AWS environment variables.
    pub fn from_config(config: &RemoteConfig) -> Result<Self> {
        use object_store::aws::AmazonS3Builder;

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&config.bucket)
            .with_region(&config.region)
            .with_allow_http(config.allow_http);

        if let Some(endpoint) = &config.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        if let Some(key) = &config.access_key {
            builder = builder.with_access_key_id(key);
        }
        if let Some(secret) = &config.secret_key {
            builder = builder.with_secret_access_key(secret.expose());
        }

        let store = builder.build()?;
        let label = format!(
            "s3://{}/{}",
            config.bucket,
            config.prefix.trim_matches('/')
        );
        Ok(Self::with_store(Arc::new(store), &config.prefix, label))
    }

    /// Wrap an existing store.
    pub fn with_store(store: Arc<dyn ObjectStore>, prefix: &str, label: impl Into<String>) -> Self {
        Self {
            store,
            prefix: ObjectPath::from(prefix.trim_matches('/')),
            label: label.into(),
        }
    }

    fn path(&self, key: &str) -> ObjectPath {
        self.prefix.child(key)
    }
}

#[async_trait]
impl RemoteStore for ObjectStoreRemote {
    async fn upload(&self, key: &str, file: &Path) -> Result<()> {
        let path = self.path(key);
        tracing::info!(key, dest = %self.label, "Uploading to remote store");

        let upload = self.store.put_multipart(&path).await?;
        let mut writer = WriteMultipart::new(upload);
        let mut source = tokio::fs::File::open(file).await?;
        let mut buf = vec![0u8; CHUNK_SIZE];

        loop {
            let n = match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    if let Err(abort) = writer.abort().await {
                        tracing::warn!(key, error = %abort, "Failed to abort multipart upload");
                    }
                    return Err(e.into());
                }
            };
            writer.wait_for_capacity(MAX_CONCURRENCY).await?;
            writer.write(&buf[..n]);
        }
        writer.finish().await?;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<()> {
        let path = self.path(key);
        tracing::info!(key, src = %self.label, "Downloading from remote store");

        let result = self.store.get(&path).await.map_err(|e| match e {
            object_store::Error::NotFound { .. } => CoreError::NotFound(format!("remote backup {key}")),
            other => CoreError::RemoteStore(other),
        })?;
        let mut stream = result.into_stream();

        let tmp = dest.with_extension(format!("{}.part", uuid::Uuid::new_v4().simple()));
        let written: Result<()> = async {
            let mut file = tokio::fs::File::create(&tmp).await?;
            while let Some(chunk) = stream.next().await {
                file.write_all(&chunk?).await?;
            }
            file.flush().await?;
            Ok(())
        }
        .await;

        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e);
        }
        tokio::fs::rename(&tmp, dest).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<RemoteObject>> {
        let metas: Vec<_> = self.store.list(Some(&self.prefix)).try_collect().await?;
        Ok(metas
            .into_iter()
            .filter_map(|meta| {
                Some(RemoteObject {
                    key: meta.location.filename()?.to_string(),
                    size: meta.size as u64,
                    last_modified: meta.last_modified,
                })
            })
            .collect())
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;

    fn remote() -> ObjectStoreRemote {
        ObjectStoreRemote::with_store(Arc::new(InMemory::new()), "nox-backups/", "memory://")
    }

    #[tokio::test]
    async fn test_upload_list_download() {
        let dir = tempfile::tempdir().unwrap();
        let src = dir.path().join("vm1_20240501T120000Z.tar.gz");
        std::fs::write(&src, b"archive bytes").unwrap();

        let remote = remote();
        remote.upload("vm1_20240501T120000Z.tar.gz", &src).await.unwrap();

        let objects = remote.list().await.unwrap();
        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].key, "vm1_20240501T120000Z.tar.gz");
        assert_eq!(objects[0].size, 13);

        let dest = dir.path().join("restored.tar.gz");
        remote
            .download("vm1_20240501T120000Z.tar.gz", &dest)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&dest).unwrap(), b"archive bytes");
    }

    #[tokio::test]
    async fn test_download_missing() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("x.tar.gz");
        let err = remote().download("nope.tar.gz", &dest).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound(_)));
        assert!(!dest.exists());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_list_empty() {
        assert!(remote().list().await.unwrap().is_empty());
    }
}
