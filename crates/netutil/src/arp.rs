//! ARP neighbor resolution.
//!
//! Resolution first consults the OS neighbor table, reloaded on every
//! call so a stale in-process cache can never answer. On a miss an ARP
//! request is sent on the interface with a hard deadline.

use crate::interface::Interface;
use common::{Error, Result};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

/// Deadline for an active ARP probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// A 48-bit hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl From<[u8; 6]> for MacAddr {
    fn from(octets: [u8; 6]) -> Self {
        MacAddr(octets)
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in octets.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| Error::arp(format!("malformed MAC address: {s}")))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| Error::arp(format!("malformed MAC address: {s}")))?;
        }
        if parts.next().is_some() {
            return Err(Error::arp(format!("malformed MAC address: {s}")));
        }
        Ok(MacAddr(octets))
    }
}

/// One row of the OS neighbor table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborEntry {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
    pub device: String,
}

/// Parse the Linux `/proc/net/arp` pseudo-file.
///
/// Rows are `IP HWtype Flags HWaddr Mask Device`. Malformed rows and
/// incomplete entries (flags 0x0) are skipped, never fatal.
pub fn parse_proc_net_arp(text: &str) -> Vec<NeighborEntry> {
    let mut entries = Vec::new();

    // first line is the column header
    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 6 {
            continue;
        }
        let Ok(ip) = fields[0].parse::<Ipv4Addr>() else {
            continue;
        };
        let Ok(flags) = u32::from_str_radix(fields[2].trim_start_matches("0x"), 16) else {
            continue;
        };
        if flags == 0 {
            // incomplete entry, no usable hardware address
            continue;
        }
        let Ok(mac) = fields[3].parse::<MacAddr>() else {
            continue;
        };
        entries.push(NeighborEntry {
            ip,
            mac,
            device: fields[5].to_string(),
        });
    }

    entries
}

/// Parse `arp -anl` output on non-Linux hosts.
///
/// Rows are `IP HWaddr Expire(O) Expire(I) Netif ...`; the resulting
/// record shape is identical to the Linux one.
pub fn parse_arp_output(text: &str) -> Vec<NeighborEntry> {
    let mut entries = Vec::new();

    for line in text.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            continue;
        }
        let Ok(ip) = fields[0].parse::<Ipv4Addr>() else {
            continue;
        };
        let Ok(mac) = fields[1].parse::<MacAddr>() else {
            continue;
        };
        entries.push(NeighborEntry {
            ip,
            mac,
            device: fields[4].to_string(),
        });
    }

    entries
}

#[cfg(target_os = "linux")]
fn load_neighbor_table() -> Result<Vec<NeighborEntry>> {
    let text = std::fs::read_to_string("/proc/net/arp")?;
    Ok(parse_proc_net_arp(&text))
}

#[cfg(not(target_os = "linux"))]
fn load_neighbor_table() -> Result<Vec<NeighborEntry>> {
    let output = std::process::Command::new("arp")
        .arg("-anl")
        .output()
        .map_err(Error::arp)?;
    Ok(parse_arp_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Resolves peer hardware addresses on a given interface.
///
/// Each resolver instance is owned by one backend; there is no shared
/// process-wide cache.
pub struct ArpResolver {
    timeout: Duration,
}

impl Default for ArpResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ArpResolver {
    pub fn new() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Resolve the hardware address of `ip` on `iface`.
    ///
    /// The neighbor table is reloaded before the lookup; a miss falls
    /// through to an active ARP request bounded by the probe timeout.
    pub fn resolve(&self, iface: &Interface, ip: Ipv4Addr) -> Result<MacAddr> {
        let table = load_neighbor_table().unwrap_or_default();
        if let Some(entry) = table
            .iter()
            .find(|e| e.device == iface.name && e.ip == ip)
        {
            return Ok(entry.mac);
        }

        probe::request(iface, ip, self.timeout)
    }
}

#[cfg(target_os = "linux")]
mod probe {
    //! Active ARP probing over an AF_PACKET socket.

    use super::MacAddr;
    use crate::interface::Interface;
    use common::{Error, Result};
    use socket2::{Domain, Protocol, SockAddr, Socket, Type};
    use std::mem::MaybeUninit;
    use std::net::Ipv4Addr;
    use std::time::{Duration, Instant};

    const ETHERTYPE_ARP: u16 = 0x0806;
    const ARP_OP_REQUEST: u16 = 1;
    const ARP_OP_REPLY: u16 = 2;

    /// Build an ARP who-has frame (14-byte ethernet header + 28-byte body).
    pub(super) fn build_request(src_mac: MacAddr, src_ip: Ipv4Addr, target: Ipv4Addr) -> [u8; 42] {
        let mut frame = [0u8; 42];

        frame[0..6].copy_from_slice(&[0xff; 6]); // broadcast
        frame[6..12].copy_from_slice(&src_mac.0);
        frame[12..14].copy_from_slice(&ETHERTYPE_ARP.to_be_bytes());

        frame[14..16].copy_from_slice(&1u16.to_be_bytes()); // htype: ethernet
        frame[16..18].copy_from_slice(&0x0800u16.to_be_bytes()); // ptype: IPv4
        frame[18] = 6; // hlen
        frame[19] = 4; // plen
        frame[20..22].copy_from_slice(&ARP_OP_REQUEST.to_be_bytes());
        frame[22..28].copy_from_slice(&src_mac.0);
        frame[28..32].copy_from_slice(&src_ip.octets());
        // target hardware address stays zeroed
        frame[38..42].copy_from_slice(&target.octets());

        frame
    }

    /// Extract the sender MAC from an ARP reply for `target`, if that is
    /// what this frame is.
    pub(super) fn parse_reply(frame: &[u8], target: Ipv4Addr) -> Option<MacAddr> {
        if frame.len() < 42 {
            return None;
        }
        if u16::from_be_bytes([frame[12], frame[13]]) != ETHERTYPE_ARP {
            return None;
        }
        if u16::from_be_bytes([frame[20], frame[21]]) != ARP_OP_REPLY {
            return None;
        }
        let sender_ip = Ipv4Addr::new(frame[28], frame[29], frame[30], frame[31]);
        if sender_ip != target {
            return None;
        }
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&frame[22..28]);
        Some(MacAddr(mac))
    }

    fn interface_index(name: &str) -> Result<i32> {
        let c_name = std::ffi::CString::new(name)
            .map_err(|_| Error::net(format!("invalid interface name: {name}")))?;
        let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
        if index == 0 {
            return Err(Error::net(format!("interface {name} not found")));
        }
        Ok(index as i32)
    }

    pub(super) fn request(iface: &Interface, target: Ipv4Addr, timeout: Duration) -> Result<MacAddr> {
        let src_mac = iface
            .mac
            .ok_or_else(|| Error::arp(format!("interface {} has no MAC address", iface.name)))?;
        let ifindex = interface_index(&iface.name)?;

        let proto = (ETHERTYPE_ARP).to_be() as i32;
        let socket = Socket::new(Domain::PACKET, Type::RAW, Some(Protocol::from(proto)))?;

        // bind to the interface so only its frames are delivered
        let ((), addr) = unsafe {
            SockAddr::try_init(|storage, len| {
                let sll = storage as *mut libc::sockaddr_ll;
                (*sll).sll_family = libc::AF_PACKET as libc::sa_family_t;
                (*sll).sll_protocol = (ETHERTYPE_ARP).to_be();
                (*sll).sll_ifindex = ifindex;
                *len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
                Ok(())
            })
        }?;
        socket.bind(&addr)?;
        socket.set_read_timeout(Some(Duration::from_millis(200)))?;

        let frame = build_request(src_mac, iface.ip, target);
        socket.send(&frame)?;

        let deadline = Instant::now() + timeout;
        let mut buf: [MaybeUninit<u8>; 1500] = [MaybeUninit::uninit(); 1500];

        while Instant::now() < deadline {
            match socket.recv(&mut buf) {
                Ok(len) => {
                    let bytes: &[u8] =
                        unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, len) };
                    if let Some(mac) = parse_reply(bytes, target) {
                        return Ok(mac);
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::arp(format!("no ARP reply from {target}")))
    }
}

#[cfg(not(target_os = "linux"))]
mod probe {
    use super::MacAddr;
    use crate::interface::Interface;
    use common::{Error, Result};
    use std::net::Ipv4Addr;
    use std::time::Duration;

    pub(super) fn request(_iface: &Interface, target: Ipv4Addr, _timeout: Duration) -> Result<MacAddr> {
        Err(Error::arp(format!(
            "active ARP resolution is not supported on this platform ({target} unresolved)"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_addr_roundtrip() {
        let mac: MacAddr = "00:1a:2b:3c:4d:5e".parse().unwrap();
        assert_eq!(mac.0, [0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]);
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");
    }

    #[test]
    fn test_mac_addr_malformed() {
        assert!("00:1a:2b:3c:4d".parse::<MacAddr>().is_err());
        assert!("00:1a:2b:3c:4d:5e:6f".parse::<MacAddr>().is_err());
        assert!("zz:1a:2b:3c:4d:5e".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_parse_proc_net_arp() {
        let text = "IP address       HW type     Flags       HW address            Mask     Device\n\
                    192.168.1.1      0x1         0x2         00:1a:2b:3c:4d:5e     *        eth0\n\
                    192.168.1.7      0x1         0x0         00:00:00:00:00:00     *        eth0\n\
                    garbage line that should be skipped\n\
                    192.168.1.9      0x1         0x2         aa:bb:cc:dd:ee:ff     *        eth1\n";

        let entries = parse_proc_net_arp(text);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].ip, "192.168.1.1".parse::<Ipv4Addr>().unwrap());
        assert_eq!(entries[0].mac.to_string(), "00:1a:2b:3c:4d:5e");
        assert_eq!(entries[0].device, "eth0");
        assert_eq!(entries[1].device, "eth1");
    }

    #[test]
    fn test_parse_proc_net_arp_skips_incomplete() {
        let text = "IP address HW type Flags HW address Mask Device\n\
                    10.0.0.2 0x1 0x0 00:00:00:00:00:00 * eth0\n";
        assert!(parse_proc_net_arp(text).is_empty());
    }

    #[test]
    fn test_parse_arp_output() {
        let text = "Neighbor        Linklayer Address Expire(O) Expire(I) Netif Refs Prbs\n\
                    192.168.1.1     00:1a:2b:3c:4d:5e 1m10s     1m10s     en0   1\n\
                    not an ip       ff:ff:ff:ff:ff:ff 1m        1m        en0   1\n";

        let entries = parse_arp_output(text);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device, "en0");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_arp_frame_roundtrip() {
        let src_mac = MacAddr([0x02, 0x00, 0x00, 0x00, 0x00, 0x01]);
        let src_ip = "192.168.1.2".parse().unwrap();
        let target = "192.168.1.1".parse().unwrap();

        let frame = probe::build_request(src_mac, src_ip, target);
        // a request is not a reply
        assert!(probe::parse_reply(&frame, target).is_none());

        // flip it into a reply from the target
        let mut reply = frame;
        reply[20..22].copy_from_slice(&2u16.to_be_bytes());
        reply[22..28].copy_from_slice(&[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        reply[28..32].copy_from_slice(&"192.168.1.1".parse::<Ipv4Addr>().unwrap().octets());

        let mac = probe::parse_reply(&reply, target).unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        // replies for other addresses are ignored
        assert!(probe::parse_reply(&reply, "192.168.1.3".parse().unwrap()).is_none());
    }
}
