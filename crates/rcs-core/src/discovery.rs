//! Broker discovery on the local network.
//!
//! The broker periodically broadcasts an [`Advertisement`] listing the IPv4
//! interfaces it listens on. A peer connects to the first advertised address
//! that shares a subnet with one of its own interfaces.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use tracing::debug;

/// One interface: address plus netmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HostEntry {
    #[serde(rename = "IP")]
    pub ip: Ipv4Addr,
    #[serde(rename = "MASK")]
    pub mask: Ipv4Addr,
}

impl HostEntry {
    pub fn new(ip: Ipv4Addr, mask: Ipv4Addr) -> Self {
        Self { ip, mask }
    }

    /// Build an entry from a CIDR prefix length.
    pub fn with_prefix(ip: Ipv4Addr, prefix: u8) -> Self {
        Self::new(ip, prefix_to_mask(prefix))
    }

    /// Network address (`ip & mask`).
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.ip) & u32::from(self.mask))
    }

    /// Same netmask and same network address.
    pub fn same_subnet(&self, other: &HostEntry) -> bool {
        self.mask == other.mask && self.network() == other.network()
    }
}

fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let bits = u32::MAX
        .checked_shl(32 - u32::from(prefix.min(32)))
        .unwrap_or(0);
    Ipv4Addr::from(bits)
}

/// Discovery datagram body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Advertisement {
    #[serde(rename = "hostAddress")]
    pub hosts: Vec<HostEntry>,
}

impl Advertisement {
    pub fn new(hosts: Vec<HostEntry>) -> Self {
        Self { hosts }
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Advertised addresses on a subnet shared with one of `local`, in
    /// advertisement order and without duplicates.
    pub fn reachable_from(&self, local: &[HostEntry]) -> Vec<Ipv4Addr> {
        let mut out = Vec::new();
        for remote in &self.hosts {
            if local.iter().any(|l| l.same_subnet(remote)) && !out.contains(&remote.ip) {
                out.push(remote.ip);
            }
        }
        out
    }
}

/// Non-loopback IPv4 interfaces of this host.
///
/// - Linux: parses `ip -4 -o addr show`
/// - other platforms, or no `ip` binary: `local_ip_address`, which reports no
///   netmask, so a /24 is assumed
pub fn local_entries() -> Vec<HostEntry> {
    let entries = local_entries_platform();
    for entry in &entries {
        debug!("local interface {} mask {}", entry.ip, entry.mask);
    }
    entries
}

#[cfg(target_os = "linux")]
fn local_entries_platform() -> Vec<HostEntry> {
    use std::process::Command;

    match Command::new("ip").args(["-4", "-o", "addr", "show"]).output() {
        Ok(output) => parse_ip_addr_output(&String::from_utf8_lossy(&output.stdout)),
        Err(_) => {
            debug!("'ip' command not found, using local_ip_address crate");
            local_entries_crate()
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn local_entries_platform() -> Vec<HostEntry> {
    local_entries_crate()
}

fn local_entries_crate() -> Vec<HostEntry> {
    let interfaces = match local_ip_address::list_afinet_netifas() {
        Ok(ifs) => ifs,
        Err(e) => {
            debug!("failed to list network interfaces: {}", e);
            return Vec::new();
        }
    };

    interfaces
        .into_iter()
        .filter_map(|(_name, ip)| match ip {
            IpAddr::V4(v4) if usable(v4) => Some(HostEntry::with_prefix(v4, 24)),
            _ => None,
        })
        .collect()
}

fn usable(ip: Ipv4Addr) -> bool {
    !ip.is_loopback() && !ip.is_unspecified()
}

/// Parse `ip -4 -o addr show` lines such as
/// `2: eth0    inet 10.0.0.5/24 brd 10.0.0.255 scope global eth0`.
pub(crate) fn parse_ip_addr_output(text: &str) -> Vec<HostEntry> {
    let mut entries = Vec::new();
    for line in text.lines() {
        let mut tokens = line.split_whitespace();
        if tokens.by_ref().find(|t| *t == "inet").is_none() {
            continue;
        }
        let Some(cidr) = tokens.next() else {
            continue;
        };
        let (addr, prefix) = cidr.split_once('/').unwrap_or((cidr, "32"));
        let (Ok(ip), Ok(prefix)) = (addr.parse::<Ipv4Addr>(), prefix.parse::<u8>()) else {
            continue;
        };
        if usable(ip) {
            entries.push(HostEntry::with_prefix(ip, prefix));
        }
    }
    entries
}
