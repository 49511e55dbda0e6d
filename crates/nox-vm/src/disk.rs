//! qcow2 and provisioning ISO handling via `qemu-img` and `genisoimage`.

use crate::command::Tool;
use crate::control::DiskTool;
use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::Path;
use std::time::Duration;

/// Volume label cloud-init's NoCloud datasource looks for.
pub const SEED_LABEL: &str = "cidata";

/// [`DiskTool`] backed by `qemu-img` and `genisoimage`.
#[derive(Debug, Clone)]
pub struct QemuDiskTool {
    qemu_img: Tool,
    mkiso: Tool,
}

impl QemuDiskTool {
    /// Create a disk tool. Exports of large images can take a while, so
    /// `timeout` should be generous.
    pub fn new(timeout: Duration) -> Self {
        Self {
            qemu_img: Tool::new("qemu-img", vec![], timeout),
            mkiso: Tool::new("genisoimage", vec![], timeout),
        }
    }
}

#[async_trait]
impl DiskTool for QemuDiskTool {
    async fn create_overlay(&self, base: &Path, dest: &Path, size_gb: u64) -> Result<()> {
        tracing::debug!(base = %base.display(), dest = %dest.display(), size_gb, "Creating overlay");
        let mut args: Vec<OsString> = ["create", "-f", "qcow2", "-F", "qcow2", "-b"]
            .iter()
            .map(OsString::from)
            .collect();
        args.push(base.into());
        args.push(dest.into());
        args.push(format!("{size_gb}G").into());
        self.qemu_img.run(args).await.map(|_| ())
    }

    async fn resize(&self, path: &Path, size_gb: u64) -> Result<()> {
        tracing::debug!(path = %path.display(), size_gb, "Resizing image");
        let args: Vec<OsString> = vec![
            "resize".into(),
            path.into(),
            format!("{size_gb}G").into(),
        ];
        self.qemu_img.run(args).await.map(|_| ())
    }

    async fn export(&self, src: &Path, dest: &Path) -> Result<()> {
        tracing::debug!(src = %src.display(), dest = %dest.display(), "Exporting image");
        // `-U` lets us read an image whose overlay is held open by QEMU.
        let args: Vec<OsString> = vec![
            "convert".into(),
            "-U".into(),
            "-O".into(),
            "qcow2".into(),
            src.into(),
            dest.into(),
        ];
        self.qemu_img.run(args).await.map(|_| ())
    }

    async fn build_seed(&self, files: &[(&str, &str)], dest: &Path) -> Result<()> {
        let staging = dest.with_extension("d");
        tokio::fs::create_dir_all(&staging).await?;

        let mut args: Vec<OsString> = vec![
            "-output".into(),
            dest.into(),
            "-volid".into(),
            SEED_LABEL.into(),
            "-joliet".into(),
            "-rock".into(),
            "-quiet".into(),
        ];
        for (name, contents) in files {
            if name.contains('/') {
                return Err(VmError::Config(format!("invalid seed file name: {name}")));
            }
            let path = staging.join(name);
            tokio::fs::write(&path, contents).await?;
            args.push(path.into());
        }

        let result = self.mkiso.run(args).await.map(|_| ());
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            tracing::warn!(path = %staging.display(), error = %e, "Failed to remove seed staging directory");
        }
        result
    }
}
