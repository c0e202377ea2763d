use std::net::IpAddr;

use ipnet::Ipv4Net;

/// Destinations the relay refuses to dial: private, loopback and
/// this-network ranges. The check protects the host network behind the
/// server from being reached through a tenant port.
pub struct IpPolicy {
    reject: Vec<Ipv4Net>,
}

impl IpPolicy {
    pub fn new() -> Self {
        let reject = [
            "10.0.0.0/8",
            "172.16.0.0/12",
            "192.168.0.0/16",
            "127.0.0.0/8",
            "0.0.0.0/8",
        ]
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();
        Self { reject }
    }

    /// IPv6 destinations carry no equivalent table; ULA and link-local
    /// egress is allowed there.
    pub fn is_rejected(&self, ip: IpAddr) -> bool {
        match ip {
            IpAddr::V4(v4) => self.reject.iter().any(|net| net.contains(&v4)),
            IpAddr::V6(_) => false,
        }
    }
}

impl Default for IpPolicy {
    fn default() -> Self {
        Self::new()
    }
}
