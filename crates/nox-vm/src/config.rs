//! Definition types for libvirt-managed instances.

use crate::error::{Result, VmError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Everything the control plane needs to register an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceDefinition {
    /// Domain name (unique on the host)
    pub name: String,
    /// Domain UUID
    pub uuid: String,
    /// Number of virtual CPUs
    pub vcpu_count: u32,
    /// Memory size in MiB
    pub memory_mib: u64,
    /// Guest architecture (`x86_64` or `aarch64`)
    pub arch: String,
    /// Root disk (qcow2 overlay)
    pub root_disk: DiskConfig,
    /// First-boot provisioning volume (read-only ISO)
    pub seed_disk: Option<DiskConfig>,
    /// Network attachment
    pub network: NetworkConfig,
    /// Start automatically when the host boots
    pub autostart: bool,
}

impl Default for InstanceDefinition {
    fn default() -> Self {
        Self {
            name: String::new(),
            uuid: String::new(),
            vcpu_count: 1,
            memory_mib: 512,
            arch: "x86_64".into(),
            root_disk: DiskConfig::default(),
            seed_disk: None,
            network: NetworkConfig::default(),
            autostart: true,
        }
    }
}

impl InstanceDefinition {
    /// Validate the definition.
    ///
    /// # Errors
    /// Returns an error if any value would be rejected by libvirt.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(VmError::Config("name is required".into()));
        }
        if self.vcpu_count == 0 {
            return Err(VmError::Config("vcpu_count must be > 0".into()));
        }
        if self.memory_mib < 128 {
            return Err(VmError::Config(format!(
                "memory_mib must be at least 128, got {}",
                self.memory_mib
            )));
        }
        if self.root_disk.path.as_os_str().is_empty() {
            return Err(VmError::Config("root disk path is required".into()));
        }
        if let Some(seed) = &self.seed_disk {
            if seed.target == self.root_disk.target {
                return Err(VmError::Config(format!(
                    "duplicate disk target: {}",
                    seed.target
                )));
            }
        }
        if !is_valid_mac(&self.network.mac) {
            return Err(VmError::Config(format!(
                "invalid MAC address: {}",
                self.network.mac
            )));
        }
        Ok(())
    }
}

/// A disk attached to the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Path to the image on the host
    pub path: PathBuf,
    /// Guest device name (`vda`, `sda`, ...)
    pub target: String,
    /// Image format (`qcow2`, `raw`)
    pub format: String,
    /// Attach as CD-ROM
    pub cdrom: bool,
    /// Read-only flag
    pub read_only: bool,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::new(),
            target: "vda".into(),
            format: "qcow2".into(),
            cdrom: false,
            read_only: false,
        }
    }
}

impl DiskConfig {
    /// A read-only CD-ROM carrying the provisioning volume.
    pub fn seed(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            target: "sda".into(),
            format: "raw".into(),
            cdrom: true,
            read_only: true,
        }
    }
}

/// How the instance's NIC is attached on the host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NetworkAttachment {
    /// A libvirt virtual network (NAT, DHCP served by libvirt)
    Network { name: String },
    /// A host bridge, usually onto the physical LAN
    Bridge { name: String },
}

impl Default for NetworkAttachment {
    fn default() -> Self {
        NetworkAttachment::Network {
            name: "default".into(),
        }
    }
}

/// Network interface configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Host side of the interface
    pub attachment: NetworkAttachment,
    /// Guest MAC address
    pub mac: String,
    /// Device model
    pub model: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            attachment: NetworkAttachment::default(),
            mac: "52:54:00:00:00:01".into(),
            model: "virtio".into(),
        }
    }
}

/// Check a colon-separated, six-octet MAC address.
pub fn is_valid_mac(mac: &str) -> bool {
    let parts: Vec<&str> = mac.split(':').collect();
    parts.len() == 6
        && parts
            .iter()
            .all(|p| p.len() == 2 && p.chars().all(|c| c.is_ascii_hexdigit()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> InstanceDefinition {
        InstanceDefinition {
            name: "vm1".into(),
            root_disk: DiskConfig {
                path: PathBuf::from("/tmp/vm1/disk.qcow2"),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_validate_ok() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_vcpu() {
        let mut def = valid();
        def.vcpu_count = 0;
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_validate_memory() {
        let mut def = valid();
        def.memory_mib = 64;
        assert!(def.validate().is_err());

        def.memory_mib = 128;
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_validate_duplicate_targets() {
        let mut def = valid();
        let mut seed = DiskConfig::seed("/tmp/vm1/seed.iso");
        seed.target = "vda".into();
        def.seed_disk = Some(seed);
        assert!(def.validate().is_err());
    }

    #[test]
    fn test_mac_validation() {
        assert!(is_valid_mac("52:54:00:ab:CD:0f"));
        assert!(!is_valid_mac("52:54:00:ab:cd"));
        assert!(!is_valid_mac("52-54-00-ab-cd-ef"));
        assert!(!is_valid_mac("52:54:00:ab:cd:zz"));
    }

    #[test]
    fn test_attachment_serde_tag() {
        let bridge = NetworkAttachment::Bridge { name: "br0".into() };
        let json = serde_json::to_value(&bridge).unwrap();
        assert_eq!(json, serde_json::json!({"type": "bridge", "name": "br0"}));

        let parsed: NetworkAttachment =
            serde_json::from_str(r#"{"type":"network","name":"default"}"#).unwrap();
        assert_eq!(parsed, NetworkAttachment::default());
    }
}
