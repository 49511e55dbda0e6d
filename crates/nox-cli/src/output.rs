//! Human-readable rendering of records and tables.

use nox_core::{BackupRecord, ImageEntry, InstanceRecord, Secret};
use std::fmt::Write as _;
use std::net::Ipv4Addr;

/// Shown when no address is known.
pub const UNKNOWN: &str = "unknown";

/// Bytes with a binary unit, e.g. `1.5 GiB`.
pub fn human_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

fn address(ip: Option<Ipv4Addr>) -> String {
    ip.map(|ip| ip.to_string()).unwrap_or_default()
}

/// Instance table for `nox list`.
pub fn instance_table(records: &[InstanceRecord]) -> String {
    if records.is_empty() {
        return "No instances found\n".into();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<20} {:<10} {:<10} {:<6} {:<8} {:<8} {:<10} {}",
        "NAME", "STATE", "OS", "CPUS", "RAM", "DISK", "AUTOSTART", "IP"
    );
    let _ = writeln!(out, "{}", "-".repeat(95));
    for record in records {
        let _ = writeln!(
            out,
            "{:<20} {:<10} {:<10} {:<6} {:<8} {:<8} {:<10} {}",
            record.name,
            record.state.to_string(),
            record.os,
            record.vcpus,
            format!("{}MB", record.ram_mb),
            format!("{}GB", record.disk_gb),
            yes_no(record.autostart),
            address(record.last_ip),
        );
    }
    out
}

/// Detail block for `nox status`.
pub fn instance_status(record: &InstanceRecord) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Name:       {}", record.name);
    let _ = writeln!(out, "State:      {}", record.state);
    let _ = writeln!(out, "OS:         {}", record.os);
    let _ = writeln!(out, "Arch:       {}", record.arch);
    let _ = writeln!(out, "vCPUs:      {}", record.vcpus);
    let _ = writeln!(out, "RAM:        {} MB", record.ram_mb);
    let _ = writeln!(out, "Disk:       {} GB", record.disk_gb);
    let _ = writeln!(out, "Autostart:  {}", yes_no(record.autostart));
    if let Some(addr) = &record.static_address {
        let _ = writeln!(out, "Static IP:  {}", addr.cidr());
    }
    if !record.scripts.is_empty() {
        let _ = writeln!(out, "Scripts:    {}", record.scripts.join(", "));
    }
    let _ = writeln!(out, "MAC:        {}", record.mac);
    let _ = writeln!(
        out,
        "IP:         {}",
        record
            .last_ip
            .map(|ip| ip.to_string())
            .unwrap_or_else(|| UNKNOWN.into())
    );
    let _ = writeln!(out, "Created:    {}", record.created_at.format("%Y-%m-%d %H:%M:%S UTC"));
    out
}

/// Credentials block printed once after `create` or a restore that minted a
/// new identity.
pub fn credentials(name: &str, password: &Secret, ip: Option<Ipv4Addr>, started: bool) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    if started {
        let _ = writeln!(out, "Instance '{name}' is ready.");
    } else {
        let _ = writeln!(out, "Instance '{name}' created.");
    }
    let _ = writeln!(out);
    match ip {
        Some(ip) => {
            let _ = writeln!(out, "  SSH:       ssh nox@{ip}");
        }
        None if started => {
            let _ = writeln!(out, "  SSH:       address not known yet, try `nox ip {name}`");
        }
        None => {}
    }
    let _ = writeln!(out, "  Password:  {}", password.expose());
    let _ = writeln!(out, "  Shortcut:  nox ssh {name}");
    let _ = writeln!(out);
    let _ = writeln!(out, "The password is shown only once.");
    if !started {
        let _ = writeln!(out, "Start it with: nox start {name}");
    }
    out
}

/// Backup table for `nox backups`.
pub fn backup_table(backups: &[BackupRecord]) -> String {
    if backups.is_empty() {
        return "No backups found\n".into();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<4} {:<40} {:<10} {:<8} {}",
        "#", "ID", "SIZE", "ORIGIN", "MIRRORED"
    );
    let _ = writeln!(out, "{}", "-".repeat(75));
    for (i, backup) in backups.iter().enumerate() {
        let _ = writeln!(
            out,
            "{:<4} {:<40} {:<10} {:<8} {}",
            i + 1,
            backup.id(),
            human_size(backup.size),
            backup.origin.to_string(),
            yes_no(backup.mirrored),
        );
    }
    out
}

/// Cached image table for `nox images`.
pub fn image_table(images: &[ImageEntry]) -> String {
    if images.is_empty() {
        return "No cached images\n".into();
    }

    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:<10} {:<10} {:<6} {}",
        "OS", "ARCH", "SIZE", "USERS", "FETCHED"
    );
    for image in images {
        let _ = writeln!(
            out,
            "{:<16} {:<10} {:<10} {:<6} {}",
            image.os,
            image.arch,
            human_size(image.size),
            image.refcount,
            image.fetched_at.format("%Y-%m-%d %H:%M"),
        );
    }
    out
}
