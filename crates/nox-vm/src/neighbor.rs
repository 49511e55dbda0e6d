//! Host neighbor (ARP) table access.

use crate::command::Tool;
use crate::control::{NeighborEntry, NeighborTable};
use crate::error::Result;
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// ARP flag set on completed entries.
const ATF_COM: u32 = 0x2;

/// Linux neighbor table read from `/proc/net/arp`, probed with `ping -b`.
#[derive(Debug, Clone)]
pub struct ProcArpTable {
    path: PathBuf,
    ping: Tool,
}

impl ProcArpTable {
    pub fn new() -> Self {
        Self {
            path: PathBuf::from("/proc/net/arp"),
            // -b: allow broadcast, -c 1: one packet, -W 1: wait one second
            ping: Tool::new(
                "ping",
                vec!["-b".into(), "-c".into(), "1".into(), "-W".into(), "1".into()],
                Duration::from_secs(3),
            ),
        }
    }
}

impl Default for ProcArpTable {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NeighborTable for ProcArpTable {
    async fn probe(&self, target: Ipv4Addr) -> Result<()> {
        // Nobody has to answer; the point is the ARP traffic the ping causes.
        if let Err(e) = self.ping.run([target.to_string()]).await {
            tracing::trace!(%target, error = %e, "Probe got no reply");
        }
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<NeighborEntry>> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        Ok(parse_proc_arp(&raw))
    }
}

/// Parse `/proc/net/arp`, keeping only completed entries.
///
/// ```text
/// IP address       HW type     Flags       HW address            Mask     Device
/// 192.168.1.20     0x1         0x2         52:54:00:aa:bb:cc     *        br0
/// ```
pub fn parse_proc_arp(raw: &str) -> Vec<NeighborEntry> {
    raw.lines()
        .skip(1)
        .filter_map(|line| {
            let cols: Vec<&str> = line.split_whitespace().collect();
            if cols.len() < 6 {
                return None;
            }
            let flags = u32::from_str_radix(cols[2].trim_start_matches("0x"), 16).ok()?;
            if flags & ATF_COM == 0 || cols[3] == "00:00:00:00:00:00" {
                return None;
            }
            Some(NeighborEntry {
                ip: cols[0].parse().ok()?,
                mac: cols[3].to_lowercase(),
                device: cols[5].to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ARP: &str = "\
IP address       HW type     Flags       HW address            Mask     Device
192.168.1.20     0x1         0x2         52:54:00:AA:bb:cc     *        br0
192.168.1.21     0x1         0x0         00:00:00:00:00:00     *        br0
192.168.1.1      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth0
";

    #[test]
    fn test_parse_proc_arp() {
        let entries = parse_proc_arp(ARP);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, Ipv4Addr::new(192, 168, 1, 20));
        assert_eq!(entries[0].mac, "52:54:00:aa:bb:cc");
        assert_eq!(entries[0].device, "br0");
        assert_eq!(entries[1].device, "eth0");
    }

    #[test]
    fn test_parse_proc_arp_header_only() {
        let entries = parse_proc_arp(ARP.lines().next().unwrap());
        assert!(entries.is_empty());
    }
}
