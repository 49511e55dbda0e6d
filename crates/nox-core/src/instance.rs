//! Instance records.

use crate::error::{CoreError, Result};
use crate::images::ImageKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use uuid::Uuid;

/// Maximum instance name length (one DNS label).
pub const MAX_NAME_LEN: usize = 63;

/// Lifecycle state of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    /// Resources are being set up
    Creating,
    /// Powered on
    Running,
    /// Defined but powered off
    Stopped,
    /// A multi-step operation failed; needs `delete`
    Error,
    /// Being torn down
    Deleting,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Creating => write!(f, "creating"),
            InstanceState::Running => write!(f, "running"),
            InstanceState::Stopped => write!(f, "stopped"),
            InstanceState::Error => write!(f, "error"),
            InstanceState::Deleting => write!(f, "deleting"),
        }
    }
}

/// Static IPv4 configuration for the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StaticAddress {
    pub address: Ipv4Addr,
    pub prefix: u8,
    #[serde(default)]
    pub gateway: Option<Ipv4Addr>,
    #[serde(default)]
    pub nameservers: Vec<Ipv4Addr>,
}

impl StaticAddress {
    /// Parse `a.b.c.d/nn`. The gateway defaults to the first host of the
    /// subnet and is also used as the nameserver.
    pub fn parse_cidr(cidr: &str) -> Result<Self> {
        let invalid = || CoreError::Validation(format!("invalid CIDR address: {cidr:?}"));
        let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
        let address: Ipv4Addr = addr.parse().map_err(|_| invalid())?;
        let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
        if prefix == 0 || prefix > 30 {
            return Err(invalid());
        }
        let mask = u32::MAX << (32 - prefix);
        let gateway = Ipv4Addr::from((u32::from(address) & mask) + 1);
        if gateway == address {
            return Err(CoreError::Validation(format!(
                "{cidr}: address collides with the default gateway"
            )));
        }
        Ok(Self {
            address,
            prefix,
            gateway: Some(gateway),
            nameservers: vec![gateway],
        })
    }

    pub fn cidr(&self) -> String {
        format!("{}/{}", self.address, self.prefix)
    }
}

/// Persistent description of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRecord {
    pub name: String,
    /// Also the cloud-init instance-id
    pub id: Uuid,
    pub state: InstanceState,
    pub os: String,
    pub arch: String,
    pub vcpus: u32,
    pub ram_mb: u64,
    pub disk_gb: u64,
    pub mac: String,
    pub autostart: bool,
    pub created_at: DateTime<Utc>,
    /// Launch scripts applied at first boot, in order
    #[serde(default)]
    pub scripts: Vec<String>,
    #[serde(default)]
    pub static_address: Option<StaticAddress>,
    /// Absent for restored, flattened disks
    #[serde(default)]
    pub base_image: Option<ImageKey>,
    #[serde(default)]
    pub last_ip: Option<Ipv4Addr>,
}

/// Check an instance name: 1-63 ASCII letters, digits or `-`, not
/// starting or ending with `-`.
pub fn validate_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= MAX_NAME_LEN
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.starts_with('-')
        && !name.ends_with('-');
    if ok {
        Ok(())
    } else {
        Err(CoreError::Validation(format!(
            "invalid instance name {name:?}: use 1-{MAX_NAME_LEN} letters, digits or '-', \
             not starting or ending with '-'"
        )))
    }
}

/// Random locally administered MAC in the QEMU/KVM OUI (`52:54:00`).
pub fn generate_mac() -> String {
    let bytes: [u8; 3] = rand::random();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}
