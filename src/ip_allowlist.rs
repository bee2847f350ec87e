//! CIDR/IP allow-list parsing and matching.
//!
//! Not present in the teacher; grounded on `ip_network` usage in the
//! `RotaN8-firezone` example repo, the sibling pack crate that already
//! depends on it for CIDR containment checks.

use std::net::IpAddr;

use ip_network::IpNetwork;

/// An ordered set of allowed networks. An empty list allows every address.
#[derive(Debug, Clone, Default)]
pub struct IpAllowList {
    networks: Vec<IpNetwork>,
}

impl IpAllowList {
    /// Parses a comma-separated list of IPs or CIDR blocks. Bare IPs are
    /// normalized to `/32` (IPv4) or `/128` (IPv6).
    pub fn parse(list: &str) -> Result<Self, String> {
        let mut networks = Vec::new();
        for entry in list.split(',') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            networks.push(parse_one(entry)?);
        }
        Ok(Self { networks })
    }

    /// `true` iff the list is empty, or `addr` is contained by at least one
    /// network in the list.
    pub fn check(&self, addr: IpAddr) -> bool {
        if self.networks.is_empty() {
            return true;
        }
        self.networks.iter().any(|n| n.contains(addr))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }

    /// Canonical comma-separated form, one entry per network, in input order.
    pub fn normalized(&self) -> String {
        self.networks
            .iter()
            .map(|n| n.to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_one(entry: &str) -> Result<IpNetwork, String> {
    if let Some((addr, prefix)) = entry.split_once('/') {
        let addr: IpAddr = addr
            .parse()
            .map_err(|_| format!("invalid IP address: {addr}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| format!("invalid CIDR prefix: {prefix}"))?;
        IpNetwork::new(addr, prefix).map_err(|_| format!("invalid CIDR block: {entry}"))
    } else {
        let addr: IpAddr = entry
            .parse()
            .map_err(|_| format!("invalid IP address: {entry}"))?;
        IpNetwork::new_truncate(addr, if addr.is_ipv4() { 32 } else { 128 })
            .map_err(|_| format!("invalid IP address: {entry}"))
    }
}
