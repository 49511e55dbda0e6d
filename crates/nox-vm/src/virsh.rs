//! libvirt adapter driven through `virsh`.

use crate::builder::domain_xml;
use crate::command::Tool;
use crate::config::InstanceDefinition;
use crate::control::{ControlPlane, DomainState, Lease};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

/// Default libvirt connection URI.
pub const DEFAULT_URI: &str = "qemu:///system";

/// Snapshot name used while a backup overlay is active.
const BACKUP_SNAPSHOT: &str = "nox-backup";

/// [`ControlPlane`] backed by the `virsh` client.
#[derive(Debug, Clone)]
pub struct VirshControlPlane {
    virsh: Tool,
}

impl VirshControlPlane {
    /// Connect to `uri` with a per-call timeout.
    pub fn new(uri: &str, call_timeout: Duration) -> Self {
        Self {
            virsh: Tool::new("virsh", vec!["-c".into(), uri.into()], call_timeout),
        }
    }

    /// Map "domain not found" failures to `NotDefined`.
    fn not_defined(name: &str, err: VmError) -> VmError {
        match err {
            VmError::Command { ref stderr, .. }
                if stderr.contains("failed to get domain")
                    || stderr.contains("Domain not found") =>
            {
                VmError::NotDefined(name.to_string())
            }
            other => other,
        }
    }

    async fn domain_cmd(&self, args: &[&str], name: &str) -> Result<String> {
        self.virsh
            .run(args)
            .await
            .map_err(|e| Self::not_defined(name, e))
    }
}

#[async_trait]
impl ControlPlane for VirshControlPlane {
    async fn define(&self, def: &InstanceDefinition) -> Result<()> {
        def.validate()?;
        let xml = domain_xml(def);

        let dir = def
            .root_disk
            .path
            .parent()
            .ok_or_else(|| VmError::Config("root disk has no parent directory".into()))?;
        let xml_path = dir.join("domain.xml");
        tokio::fs::write(&xml_path, xml).await?;

        tracing::info!(instance = %def.name, "Defining domain");
        self.virsh
            .run([std::ffi::OsStr::new("define"), xml_path.as_os_str()])
            .await?;

        if def.autostart {
            self.set_autostart(&def.name, true).await?;
        }
        Ok(())
    }

    async fn undefine(&self, name: &str) -> Result<()> {
        tracing::info!(instance = %name, "Undefining domain");
        self.domain_cmd(&["undefine", name, "--nvram"], name)
            .await
            .map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<()> {
        tracing::info!(instance = %name, "Starting domain");
        self.domain_cmd(&["start", name], name).await.map(|_| ())
    }

    async fn shutdown(&self, name: &str) -> Result<()> {
        tracing::info!(instance = %name, "Requesting guest shutdown");
        self.domain_cmd(&["shutdown", name], name).await.map(|_| ())
    }

    async fn destroy(&self, name: &str) -> Result<()> {
        tracing::warn!(instance = %name, "Forcing power-off");
        self.domain_cmd(&["destroy", name], name).await.map(|_| ())
    }

    async fn state(&self, name: &str) -> Result<Option<DomainState>> {
        match self.domain_cmd(&["domstate", name], name).await {
            Ok(out) => Ok(Some(DomainState::parse(&out))),
            Err(VmError::NotDefined(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn set_resources(&self, name: &str, vcpus: u32, memory_mib: u64) -> Result<()> {
        tracing::info!(instance = %name, vcpus, memory_mib, "Updating persistent resources");
        let vcpus = vcpus.to_string();
        let mem = format!("{memory_mib}M");
        self.domain_cmd(&["setvcpus", name, &vcpus, "--config", "--maximum"], name)
            .await?;
        self.domain_cmd(&["setvcpus", name, &vcpus, "--config"], name)
            .await?;
        self.domain_cmd(&["setmaxmem", name, &mem, "--config"], name)
            .await?;
        self.domain_cmd(&["setmem", name, &mem, "--config"], name)
            .await?;
        Ok(())
    }

    async fn set_autostart(&self, name: &str, enabled: bool) -> Result<()> {
        let mut args = vec!["autostart", name];
        if !enabled {
            args.push("--disable");
        }
        self.domain_cmd(&args, name).await.map(|_| ())
    }

    async fn resize_disk(&self, name: &str, target: &str, size_gb: u64) -> Result<()> {
        tracing::info!(instance = %name, target, size_gb, "Live block resize");
        let size = format!("{size_gb}G");
        self.domain_cmd(&["blockresize", name, target, &size], name)
            .await
            .map(|_| ())
    }

    async fn snapshot(&self, name: &str, target: &str, overlay: &Path) -> Result<()> {
        let diskspec = format!(
            "{target},snapshot=external,file={}",
            overlay.to_string_lossy()
        );
        tracing::info!(instance = %name, overlay = %overlay.display(), "Creating disk-only snapshot");
        self.domain_cmd(
            &[
                "snapshot-create-as",
                name,
                "--name",
                BACKUP_SNAPSHOT,
                "--disk-only",
                "--atomic",
                "--no-metadata",
                "--diskspec",
                &diskspec,
            ],
            name,
        )
        .await
        .map(|_| ())
    }

    async fn block_commit(&self, name: &str, target: &str) -> Result<()> {
        tracing::info!(instance = %name, target, "Committing overlay");
        self.domain_cmd(
            &["blockcommit", name, target, "--active", "--pivot", "--wait"],
            name,
        )
        .await
        .map(|_| ())
    }

    async fn net_leases(&self, network: &str) -> Result<Vec<Lease>> {
        let out = self.virsh.run(["net-dhcp-leases", network]).await?;
        Ok(parse_leases(&out))
    }
}

/// Parse the table printed by `virsh net-dhcp-leases`.
///
/// ```text
///  Expiry Time           MAC address         Protocol   IP address          Hostname   Client ID or DUID
/// -----------------------------------------------------------------------------------------------------
///  2024-05-01 12:00:00   52:54:00:aa:bb:cc   ipv4       192.168.122.50/24   vm1        01:52:54:00:aa:bb:cc
/// ```
pub fn parse_leases(out: &str) -> Vec<Lease> {
    out.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            // date, time, mac, protocol, ip/prefix, hostname, ...
            if cols.len() < 5 || cols[3] != "ipv4" {
                return None;
            }
            let ip: Ipv4Addr = cols[4].split('/').next()?.parse().ok()?;
            let hostname = cols
                .get(5)
                .filter(|h| **h != "-")
                .map(|h| h.to_string());
            Some(Lease {
                mac: cols[2].to_lowercase(),
                ip,
                hostname,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEASES: &str = "\
 Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID
-----------------------------------------------------------------------------------------------------------
 2024-05-01 12:00:00   52:54:00:AA:bb:cc   ipv4       192.168.122.50/24    vm1        01:52:54:00:aa:bb:cc
 2024-05-01 12:00:00   52:54:00:11:22:33   ipv6       fd00::10/64          vm2        -
 2024-05-01 12:00:00   52:54:00:44:55:66   ipv4       192.168.122.51/24    -          -
";

    #[test]
    fn test_parse_leases() {
        let leases = parse_leases(LEASES);
        assert_eq!(leases.len(), 2);
        assert_eq!(leases[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(leases[0].ip, Ipv4Addr::new(192, 168, 122, 50));
        assert_eq!(leases[0].hostname.as_deref(), Some("vm1"));
        assert_eq!(leases[1].hostname, None);
    }

    #[test]
    fn test_parse_leases_empty() {
        assert!(parse_leases("").is_empty());
    }

    #[test]
    fn test_not_defined_mapping() {
        let err = VirshControlPlane::not_defined(
            "vm1",
            VmError::Command {
                program: "virsh".into(),
                status: "exit status: 1".into(),
                stderr: "error: failed to get domain 'vm1'".into(),
            },
        );
        assert!(matches!(err, VmError::NotDefined(name) if name == "vm1"));
    }
}
