//! Data types for the IPVS direct-routing backend.

use common::{Error, Result};
use netutil::MacAddr;
use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::Arc;

/// TCP ports always exposed, whatever the port-mapping config says.
pub const RESERVED_TCP_PORTS: &[u16] = &[80, 443, 450, 451];

/// Reserved UDP ports (none today).
pub const RESERVED_UDP_PORTS: &[u16] = &[];

/// IPVS scheduling algorithms understood by the failover daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
    /// round-robin
    Rr,
    /// weighted round-robin
    Wrr,
    /// least connections
    Lc,
    /// weighted least connections
    Wlc,
    /// locality-based least connections
    Lblc,
    /// destination hashing
    Dh,
    /// source hashing
    Sh,
}

impl fmt::Display for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scheduler::Rr => "rr",
            Scheduler::Wrr => "wrr",
            Scheduler::Lc => "lc",
            Scheduler::Wlc => "wlc",
            Scheduler::Lblc => "lblc",
            Scheduler::Dh => "dh",
            Scheduler::Sh => "sh",
        };
        f.write_str(name)
    }
}

impl FromStr for Scheduler {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "rr" => Ok(Scheduler::Rr),
            "wrr" => Ok(Scheduler::Wrr),
            "lc" => Ok(Scheduler::Lc),
            "wlc" => Ok(Scheduler::Wlc),
            "lblc" => Ok(Scheduler::Lblc),
            "dh" => Ok(Scheduler::Dh),
            "sh" => Ok(Scheduler::Sh),
            other => Err(Error::validation(format!("unknown scheduler: {other}"))),
        }
    }
}

/// One virtual service: a VIP, its scheduling policy and the member
/// nodes serving it. Built fresh on every reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualServer {
    pub vip: Ipv4Addr,
    pub scheduler: Scheduler,
    pub real_servers: Vec<Ipv4Addr>,
}

/// A cluster peer able to serve the same VIP, with its resolved
/// hardware address. Computed per pass, never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

/// The desired state handed to `on_update` by the reconciliation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct LoadBalancer {
    pub name: String,
    pub namespace: String,
    pub vip: String,
    pub scheduler: String,
    /// Member node names, in an order that must be identical on every
    /// node: priorities are positional.
    pub nodes: Vec<String>,
    /// VRRP virtual router id.
    pub vrid: u8,
}

impl LoadBalancer {
    /// Validate the fields the backend reads. A failure here rejects
    /// the update but never tears down running state.
    pub fn validate(&self) -> Result<()> {
        self.vip
            .parse::<Ipv4Addr>()
            .map_err(|_| Error::validation(format!("malformed VIP: {}", self.vip)))?;
        self.scheduler.parse::<Scheduler>()?;
        if self.nodes.is_empty() {
            return Err(Error::validation("no nodes selected"));
        }
        if self.vrid == 0 {
            return Err(Error::validation("vrid must be between 1 and 255"));
        }
        Ok(())
    }
}

/// Static identity metadata reported through `info()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub version: String,
    pub git_commit: String,
    pub git_remote: String,
}

/// Read-only node lookup injected by the hosting engine.
pub trait NodeLister: Send + Sync {
    /// The routable IP of the named cluster node, if known.
    fn node_ip(&self, name: &str) -> Option<Ipv4Addr>;
}

/// Read-only port-mapping lookup injected by the hosting engine.
pub trait PortLister: Send + Sync {
    /// Exported (tcp, udp) ports from the proxy port-mapping config.
    fn exported_ports(&self) -> (Vec<u16>, Vec<u16>);
}

/// Bundle of store accessors the engine shares with the backend.
#[derive(Clone)]
pub struct StoreLister {
    pub nodes: Arc<dyn NodeLister>,
    pub ports: Arc<dyn PortLister>,
}

/// Members minus self: the set of peers this node must coordinate with.
pub fn neighbors(self_ip: Ipv4Addr, members: &[Ipv4Addr]) -> Vec<Ipv4Addr> {
    members.iter().copied().filter(|ip| *ip != self_ip).collect()
}

/// VRRP priority of this node: 100 plus its position in the member
/// list. The list order is an upstream contract; all nodes must see
/// the same order or the election is not deterministic.
pub fn node_priority(self_ip: Ipv4Addr, members: &[Ipv4Addr]) -> Option<u32> {
    members
        .iter()
        .position(|ip| *ip == self_ip)
        .map(|pos| 100 + pos as u32)
}

/// Distinct VIPs across virtual servers, first-seen order preserved.
/// A VIP may be shared by several virtual servers.
pub fn dedup_vips(servers: &[VirtualServer]) -> Vec<Ipv4Addr> {
    let mut vips: Vec<Ipv4Addr> = Vec::new();
    for vs in servers {
        if !vips.contains(&vs.vip) {
            vips.push(vs.vip);
        }
    }
    vips
}

/// Merge the reserved ports with the exported ones, keeping reserved
/// ports first and dropping duplicates.
pub fn merge_ports(reserved: &[u16], exported: &[u16]) -> Vec<u16> {
    let mut ports: Vec<u16> = reserved.to_vec();
    for port in exported {
        if !ports.contains(port) {
            ports.push(*port);
        }
    }
    ports
}
