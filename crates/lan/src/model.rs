use serde::Serialize;
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InterfaceIp {
    pub name: String,
    pub ip: IpAddr,
    pub family: &'static str, //ipv4 or ipv6
    pub is_loopback: bool,
}

impl InterfaceIp {
    pub fn new(name: impl Into<String>, ip: IpAddr) -> Self {
        Self {
            name: name.into(),
            ip,
            family: if ip.is_ipv4() { "ipv4" } else { "ipv6" },
            is_loopback: ip.is_loopback(),
        }
    }

    /// Link-local IPv6 needs a scope id, which a descriptor cannot carry.
    pub fn is_link_local_v6(&self) -> bool {
        match self.ip {
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
            IpAddr::V4(_) => false,
        }
    }
}
