//! Local network interface discovery.

use crate::arp::MacAddr;
use common::{Error, Result};
use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Interface names that never carry node traffic.
const INVALID_IFACES: &[&str] = &["lo", "docker0", "flannel.1", "cbr0"];

/// A local network interface with its primary IPv4 address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Interface {
    pub name: String,
    pub ip: Ipv4Addr,
    pub netmask: u8,
    pub mac: Option<MacAddr>,
}

fn is_valid_name(name: &str) -> bool {
    !name.starts_with("veth") && !INVALID_IFACES.contains(&name)
}

/// Enumerate local interfaces carrying an IPv4 address, excluding
/// loopback, veth and the well-known overlay/bridge devices.
pub fn interfaces() -> Result<Vec<Interface>> {
    let addrs = getifaddrs().map_err(Error::net)?;

    let mut macs: HashMap<String, MacAddr> = HashMap::new();
    let mut found: Vec<Interface> = Vec::new();

    for ifaddr in addrs {
        if let Some(link) = ifaddr.address.as_ref().and_then(|a| a.as_link_addr()) {
            if let Some(octets) = link.addr() {
                macs.insert(ifaddr.interface_name.clone(), MacAddr::from(octets));
            }
            continue;
        }

        if !is_valid_name(&ifaddr.interface_name) {
            continue;
        }
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }

        let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) else {
            continue;
        };
        let netmask = ifaddr
            .netmask
            .as_ref()
            .and_then(|m| m.as_sockaddr_in())
            .map(|m| u32::from(m.ip()).count_ones() as u8)
            .unwrap_or(32);

        found.push(Interface {
            name: ifaddr.interface_name.clone(),
            ip: sin.ip(),
            netmask,
            mac: None,
        });
    }

    for iface in &mut found {
        iface.mac = macs.get(&iface.name).copied();
    }

    Ok(found)
}

/// Return the local interface that carries the given IPv4 address.
pub fn interface_by_ip(ip: Ipv4Addr) -> Result<Interface> {
    interfaces()?
        .into_iter()
        .find(|iface| iface.ip == ip)
        .ok_or_else(|| Error::net(format!("no local interface carries {ip}")))
}

/// Return the loopback interface record.
pub fn interface_by_loopback() -> Result<Interface> {
    let addrs = getifaddrs().map_err(Error::net)?;

    for ifaddr in addrs {
        if !ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            let netmask = ifaddr
                .netmask
                .as_ref()
                .and_then(|m| m.as_sockaddr_in())
                .map(|m| u32::from(m.ip()).count_ones() as u8)
                .unwrap_or(8);
            return Ok(Interface {
                name: ifaddr.interface_name,
                ip: sin.ip(),
                netmask,
                mac: None,
            });
        }
    }

    Err(Error::net("no loopback interface found"))
}

/// True when `ip` is assigned to any non-loopback local interface.
///
/// The VIP lives on `lo` even while this node is backup, so the
/// loopback assignment must not count as holding the address.
pub fn ip_present_on_non_loopback(ip: Ipv4Addr) -> bool {
    let Ok(addrs) = getifaddrs() else {
        return false;
    };

    for ifaddr in addrs {
        if ifaddr.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        if let Some(sin) = ifaddr.address.as_ref().and_then(|a| a.as_sockaddr_in()) {
            if sin.ip() == ip {
                return true;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_names_filtered() {
        assert!(!is_valid_name("lo"));
        assert!(!is_valid_name("docker0"));
        assert!(!is_valid_name("veth1a2b"));
        assert!(!is_valid_name("flannel.1"));
        assert!(is_valid_name("eth0"));
        assert!(is_valid_name("ens3"));
    }

    #[test]
    fn test_loopback_lookup() {
        // every test host has a loopback device
        let lo = interface_by_loopback().unwrap();
        assert!(lo.ip.is_loopback());
    }

    #[test]
    fn test_loopback_excluded_from_interfaces() {
        let ifaces = interfaces().unwrap();
        assert!(ifaces.iter().all(|i| !i.ip.is_loopback()));
    }

    #[test]
    fn test_unknown_ip_is_error() {
        // TEST-NET-1, never assigned locally
        assert!(interface_by_ip("192.0.2.1".parse().unwrap()).is_err());
        assert!(!ip_present_on_non_loopback("192.0.2.1".parse().unwrap()));
    }
}
