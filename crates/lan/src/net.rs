use std::io::Error;
use std::net::IpAddr;

use crate::model::InterfaceIp;

pub fn list_interface_ips_result() -> Result<Vec<InterfaceIp>, Error> {
    let ifs = if_addrs::get_if_addrs()?;

    let mut out: Vec<InterfaceIp> = ifs
        .into_iter()
        .map(|ifa| {
            let ip = ifa.ip();
            InterfaceIp::new(ifa.name, ip)
        })
        .collect();

    out.sort_by(|a, b| (&a.name, &a.ip).cmp(&(&b.name, &b.ip)));
    out.dedup_by(|a, b| a.name == b.name && a.ip == b.ip);
    Ok(out)
}

/// Pick the address a peer on the same network should dial.
///
/// A named interface wins when it has a usable address. Otherwise the first
/// non-loopback IPv4 address, then the first routable IPv6 address.
pub fn select_advertised_ip(ips: &[InterfaceIp], interface: Option<&str>) -> Option<IpAddr> {
    let usable = |i: &&InterfaceIp| !i.is_link_local_v6();

    if let Some(name) = interface {
        let on_iface: Vec<&InterfaceIp> = ips.iter().filter(|i| i.name == name).filter(usable).collect();
        if let Some(found) = on_iface
            .iter()
            .find(|i| i.ip.is_ipv4())
            .or_else(|| on_iface.first())
        {
            return Some(found.ip);
        }
        tracing::warn!("Interface {} has no usable address, falling back", name);
    }

    ips.iter()
        .filter(|i| !i.is_loopback)
        .find(|i| i.ip.is_ipv4())
        .or_else(|| {
            ips.iter()
                .filter(|i| !i.is_loopback)
                .filter(usable)
                .find(|i| i.ip.is_ipv6())
        })
        .map(|i| i.ip)
}
