//! Builder pattern for instance definitions and libvirt domain XML rendering.

use crate::config::{DiskConfig, InstanceDefinition, NetworkAttachment, NetworkConfig};
use crate::error::Result;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Fluent builder for [`InstanceDefinition`].
///
/// # Example
///
/// ```
/// use nox_vm::DefinitionBuilder;
///
/// let def = DefinitionBuilder::new("vm1")
///     .vcpus(2)
///     .memory_mib(1024)
///     .root_disk("/var/lib/nox/instances/vm1/disk.qcow2")
///     .seed("/var/lib/nox/instances/vm1/seed.iso")
///     .mac("52:54:00:12:34:56")
///     .build()
///     .unwrap();
/// assert_eq!(def.vcpu_count, 2);
/// ```
#[derive(Debug, Clone)]
pub struct DefinitionBuilder {
    def: InstanceDefinition,
}

impl DefinitionBuilder {
    /// Create a new builder with default configuration.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            def: InstanceDefinition {
                name: name.into(),
                ..Default::default()
            },
        }
    }

    /// Set the domain UUID.
    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.def.uuid = uuid.into();
        self
    }

    /// Set the number of virtual CPUs.
    pub fn vcpus(mut self, count: u32) -> Self {
        self.def.vcpu_count = count;
        self
    }

    /// Set the memory size in MiB.
    pub fn memory_mib(mut self, mib: u64) -> Self {
        self.def.memory_mib = mib;
        self
    }

    /// Set the guest architecture (`x86_64`, `aarch64`).
    pub fn arch(mut self, arch: impl Into<String>) -> Self {
        self.def.arch = arch.into();
        self
    }

    /// Set the path to the root qcow2 disk.
    pub fn root_disk(mut self, path: impl Into<PathBuf>) -> Self {
        self.def.root_disk.path = path.into();
        self
    }

    /// Attach a provisioning volume as a read-only CD-ROM.
    pub fn seed(mut self, path: impl Into<PathBuf>) -> Self {
        self.def.seed_disk = Some(DiskConfig::seed(path));
        self
    }

    /// Set the guest MAC address.
    pub fn mac(mut self, mac: impl Into<String>) -> Self {
        self.def.network.mac = mac.into();
        self
    }

    /// Set how the NIC is attached on the host.
    pub fn attachment(mut self, attachment: NetworkAttachment) -> Self {
        self.def.network.attachment = attachment;
        self
    }

    /// Configure the network interface with full options.
    pub fn with_network_config(mut self, config: NetworkConfig) -> Self {
        self.def.network = config;
        self
    }

    /// Enable or disable autostart.
    pub fn autostart(mut self, enabled: bool) -> Self {
        self.def.autostart = enabled;
        self
    }

    /// Build the definition, validating all fields.
    ///
    /// # Errors
    /// Returns an error if the definition is invalid.
    pub fn build(self) -> Result<InstanceDefinition> {
        self.def.validate()?;
        Ok(self.def)
    }
}

/// Render a definition as libvirt domain XML.
pub fn domain_xml(def: &InstanceDefinition) -> String {
    let mut xml = String::new();
    let _ = writeln!(xml, "<domain type='kvm'>");
    let _ = writeln!(xml, "  <name>{}</name>", escape(&def.name));
    if !def.uuid.is_empty() {
        let _ = writeln!(xml, "  <uuid>{}</uuid>", escape(&def.uuid));
    }
    let _ = writeln!(xml, "  <memory unit='MiB'>{}</memory>", def.memory_mib);
    let _ = writeln!(
        xml,
        "  <currentMemory unit='MiB'>{}</currentMemory>",
        def.memory_mib
    );
    let _ = writeln!(xml, "  <vcpu placement='static'>{}</vcpu>", def.vcpu_count);
    let _ = writeln!(xml, "  <os>");
    let _ = writeln!(
        xml,
        "    <type arch='{}' machine='{}'>hvm</type>",
        escape(&def.arch),
        if def.arch == "aarch64" { "virt" } else { "q35" }
    );
    let _ = writeln!(xml, "    <boot dev='hd'/>");
    let _ = writeln!(xml, "  </os>");
    let _ = writeln!(xml, "  <features><acpi/><apic/></features>");
    let _ = writeln!(xml, "  <cpu mode='host-passthrough'/>");
    let _ = writeln!(xml, "  <on_poweroff>destroy</on_poweroff>");
    let _ = writeln!(xml, "  <on_reboot>restart</on_reboot>");
    let _ = writeln!(xml, "  <on_crash>destroy</on_crash>");
    let _ = writeln!(xml, "  <devices>");
    write_disk(&mut xml, &def.root_disk);
    if let Some(seed) = &def.seed_disk {
        write_disk(&mut xml, seed);
    }
    match &def.network.attachment {
        NetworkAttachment::Network { name } => {
            let _ = writeln!(xml, "    <interface type='network'>");
            let _ = writeln!(xml, "      <source network='{}'/>", escape(name));
        }
        NetworkAttachment::Bridge { name } => {
            let _ = writeln!(xml, "    <interface type='bridge'>");
            let _ = writeln!(xml, "      <source bridge='{}'/>", escape(name));
        }
    }
    let _ = writeln!(xml, "      <mac address='{}'/>", escape(&def.network.mac));
    let _ = writeln!(xml, "      <model type='{}'/>", escape(&def.network.model));
    let _ = writeln!(xml, "    </interface>");
    let _ = writeln!(xml, "    <serial type='pty'><target port='0'/></serial>");
    let _ = writeln!(xml, "    <console type='pty'><target type='serial' port='0'/></console>");
    let _ = writeln!(xml, "    <rng model='virtio'><backend model='random'>/dev/urandom</backend></rng>");
    let _ = writeln!(xml, "  </devices>");
    let _ = writeln!(xml, "</domain>");
    xml
}

fn write_disk(xml: &mut String, disk: &DiskConfig) {
    let device = if disk.cdrom { "cdrom" } else { "disk" };
    let bus = if disk.cdrom { "sata" } else { "virtio" };
    let _ = writeln!(xml, "    <disk type='file' device='{device}'>");
    let _ = writeln!(
        xml,
        "      <driver name='qemu' type='{}'/>",
        escape(&disk.format)
    );
    let _ = writeln!(
        xml,
        "      <source file='{}'/>",
        escape(&disk.path.to_string_lossy())
    );
    let _ = writeln!(
        xml,
        "      <target dev='{}' bus='{bus}'/>",
        escape(&disk.target)
    );
    if disk.read_only {
        let _ = writeln!(xml, "      <readonly/>");
    }
    let _ = writeln!(xml, "    </disk>");
}

fn escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('\'', "&apos;")
        .replace('"', "&quot;")
}
