//! The IPVS direct-routing backend facade.
//!
//! Ties the pieces together: sysctl preparation, the packet-mark chain,
//! keepalived generation and supervision, peer resolution and the
//! connection-cache watchdog. The hosting engine drives it through the
//! [`Provider`] trait.

use crate::iptables::{IptablesRunner, MarkManager};
use crate::ipvscache::{CacheWatchdog, IpvsRunner};
use crate::keepalived::{ConfigData, Keepalived, checksum, render};
use crate::ratelimit::RateLimiter;
use crate::types::{
    Info, LoadBalancer, Peer, RESERVED_TCP_PORTS, RESERVED_UDP_PORTS, Scheduler, StoreLister,
    VirtualServer, merge_ports, neighbors, node_priority,
};
use async_trait::async_trait;
use common::{Error, Result};
use netutil::{ArpResolver, Interface, MacAddr, sysctl};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Kernel knobs required for direct-routing failover. Previous values
/// are captured on start and written back on stop.
pub const SYSCTL_ADJUSTMENTS: &[(&str, &str)] = &[
    // bind the VIP before the address is assigned locally
    ("net.ipv4.ip_nonlocal_bind", "1"),
    ("net.ipv4.vs.conntrack", "1"),
    // the loopback-held VIP must never answer ARP
    ("net.ipv4.conf.all.arp_ignore", "1"),
    ("net.ipv4.conf.all.arp_announce", "2"),
    ("net.ipv4.conf.lo.arp_ignore", "1"),
    ("net.ipv4.conf.lo.arp_announce", "2"),
];

/// Reconciliation updates beyond this rate are queued, not dropped.
const UPDATE_QPS: f64 = 10.0;
const UPDATE_BURST: u32 = 10;

const START_POLL_INTERVAL: Duration = Duration::from_secs(1);
const START_POLL_ATTEMPTS: u32 = 60;

/// The lifecycle and update surface a loadbalancer backend exposes to
/// the hosting engine.
#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> Info;

    /// Inject the store accessors. Must happen before the first update.
    fn set_listers(&self, listers: StoreLister);

    /// Converge on a new desired state. Degraded input is logged and
    /// skipped; only infrastructure failures surface as errors.
    async fn on_update(&self, lb: &LoadBalancer) -> Result<()>;

    async fn start(&self) -> Result<()>;

    /// Block until the failover daemon reports healthy, with a bounded
    /// wait. False means it never came up.
    async fn wait_for_start(&self) -> bool;

    /// Tear down everything this backend set up. Best effort; teardown
    /// keeps going past individual failures.
    async fn stop(&self) -> Result<()>;
}

/// Hardware-address lookup for cluster peers, swappable in tests.
pub trait PeerResolver: Send + Sync {
    fn resolve(&self, iface: &Interface, ip: Ipv4Addr) -> Result<MacAddr>;
}

impl PeerResolver for ArpResolver {
    fn resolve(&self, iface: &Interface, ip: Ipv4Addr) -> Result<MacAddr> {
        ArpResolver::resolve(self, iface, ip)
    }
}

/// Constructor inputs for [`IpvsdrProvider`], mostly so tests can swap
/// the kernel-facing pieces for fakes.
pub struct ProviderParts {
    pub node_ip: Ipv4Addr,
    pub vip: Ipv4Addr,
    pub use_unicast: bool,
    pub iface: Interface,
    pub ipt: Arc<dyn IptablesRunner>,
    pub ipvs: Arc<dyn IpvsRunner>,
    pub resolver: Arc<dyn PeerResolver>,
    pub config_path: PathBuf,
}

pub struct IpvsdrProvider {
    node_ip: Ipv4Addr,
    vip: Ipv4Addr,
    use_unicast: bool,
    iface: Interface,
    marks: MarkManager,
    keepalived: Keepalived,
    ipvs: Arc<dyn IpvsRunner>,
    resolver: Arc<dyn PeerResolver>,
    listers: Mutex<Option<StoreLister>>,
    limiter: RateLimiter,
    /// Digest of the last applied config, held across the whole apply
    /// so concurrent updates serialize.
    applied: tokio::sync::Mutex<String>,
    sysctl_snapshot: Mutex<HashMap<String, String>>,
    watchdog_stop: Mutex<Option<watch::Sender<bool>>>,
}

impl IpvsdrProvider {
    /// Build a provider against the real kernel interfaces.
    pub fn new(node_ip: Ipv4Addr, vip: Ipv4Addr, use_unicast: bool) -> Result<Self> {
        let iface = netutil::interface::interface_by_ip(node_ip)?;
        Ok(Self::with_parts(ProviderParts {
            node_ip,
            vip,
            use_unicast,
            iface,
            ipt: Arc::new(crate::iptables::IptablesCmd),
            ipvs: Arc::new(crate::ipvscache::IpvsadmCmd),
            resolver: Arc::new(ArpResolver::new()),
            config_path: PathBuf::from(crate::keepalived::KEEPALIVED_CONFIG),
        }))
    }

    pub fn with_parts(parts: ProviderParts) -> Self {
        let marks = MarkManager::new(parts.ipt.clone(), parts.iface.name.clone(), parts.vip);
        let keepalived = Keepalived::new(parts.iface.clone(), parts.ipt.clone())
            .with_config_path(parts.config_path);

        Self {
            node_ip: parts.node_ip,
            vip: parts.vip,
            use_unicast: parts.use_unicast,
            iface: parts.iface,
            marks,
            keepalived,
            ipvs: parts.ipvs,
            resolver: parts.resolver,
            listers: Mutex::new(None),
            limiter: RateLimiter::new(UPDATE_QPS, UPDATE_BURST),
            applied: tokio::sync::Mutex::new(String::new()),
            sysctl_snapshot: Mutex::new(HashMap::new()),
            watchdog_stop: Mutex::new(None),
        }
    }

    /// Member node IPs in the desired-state order, dropping nodes the
    /// store cannot place.
    fn member_ips(&self, lb: &LoadBalancer, listers: &StoreLister) -> Vec<Ipv4Addr> {
        let mut members = Vec::with_capacity(lb.nodes.len());
        for name in &lb.nodes {
            match listers.nodes.node_ip(name) {
                Some(ip) => members.push(ip),
                None => warn!(node = %name, "node has no routable address, skipping"),
            }
        }
        members
    }

    async fn resolve_peers(&self, neighbor_ips: &[Ipv4Addr]) -> Vec<Peer> {
        let mut peers = Vec::with_capacity(neighbor_ips.len());
        for &ip in neighbor_ips {
            let resolver = self.resolver.clone();
            let iface = self.iface.clone();
            match tokio::task::spawn_blocking(move || resolver.resolve(&iface, ip)).await {
                Ok(Ok(mac)) => peers.push(Peer { ip, mac }),
                Ok(Err(e)) => {
                    warn!(peer = %ip, error = %e, "could not resolve peer hardware address")
                }
                Err(e) => warn!(peer = %ip, error = %e, "peer resolution task failed"),
            }
        }
        peers
    }
}

#[async_trait]
impl Provider for IpvsdrProvider {
    fn info(&self) -> Info {
        Info {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            git_commit: option_env!("GIT_COMMIT").unwrap_or("unknown").to_string(),
            git_remote: option_env!("GIT_REMOTE").unwrap_or("unknown").to_string(),
        }
    }

    fn set_listers(&self, listers: StoreLister) {
        *lock(&self.listers) = Some(listers);
    }

    async fn on_update(&self, lb: &LoadBalancer) -> Result<()> {
        self.limiter.accept().await;

        if let Err(e) = lb.validate() {
            warn!(name = %lb.name, namespace = %lb.namespace, error = %e,
                "skipping invalid desired state");
            return Ok(());
        }
        // validate() vouched for both fields
        let vip: Ipv4Addr = lb
            .vip
            .parse()
            .map_err(|_| Error::validation("unreachable: vip validated"))?;
        let scheduler: Scheduler = lb.scheduler.parse()?;

        let listers = match lock(&self.listers).clone() {
            Some(listers) => listers,
            None => {
                warn!("no store listers injected yet, skipping update");
                return Ok(());
            }
        };

        let (tcp_exported, udp_exported) = listers.ports.exported_ports();
        let tcp_ports = merge_ports(RESERVED_TCP_PORTS, &tcp_exported);
        let udp_ports = merge_ports(RESERVED_UDP_PORTS, &udp_exported);

        let members = self.member_ips(lb, &listers);
        if members.is_empty() {
            warn!(name = %lb.name, "no resolvable member nodes, skipping update");
            return Ok(());
        }

        let priority = match node_priority(self.node_ip, &members) {
            Some(priority) => priority,
            None => {
                warn!(node_ip = %self.node_ip, "this node is not a member, skipping update");
                return Ok(());
            }
        };

        let neighbor_ips = neighbors(self.node_ip, &members);
        let peers = self.resolve_peers(&neighbor_ips).await;

        // the serving set is self plus every peer we can actually reach
        let mut real_servers = vec![self.node_ip];
        real_servers.extend(peers.iter().map(|p| p.ip));

        let servers = vec![VirtualServer {
            vip,
            scheduler,
            real_servers,
        }];

        let text = render(&ConfigData {
            iface: &self.iface.name,
            node_ip: self.node_ip,
            servers: &servers,
            peers: &peers,
            tcp_ports: &tcp_ports,
            udp_ports: &udp_ports,
            priority,
            vrid: lb.vrid,
            use_unicast: self.use_unicast,
        });
        let digest = checksum(&text);

        let mut applied = self.applied.lock().await;
        if *applied == digest {
            debug!("desired state unchanged, nothing to apply");
            return Ok(());
        }

        info!(name = %lb.name, priority, peers = peers.len(), "applying new desired state");
        self.keepalived.install_config(&text, &servers).await?;
        self.marks.ensure_rules(&peers, &tcp_ports, &udp_ports).await;
        self.keepalived.reload()?;
        *applied = digest;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        info!(node_ip = %self.node_ip, vip = %self.vip, iface = %self.iface.name,
            "starting ipvs direct-routing backend");

        let wanted: HashMap<String, String> = SYSCTL_ADJUSTMENTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let snapshot = sysctl::bulk_modify(&wanted)?;
        *lock(&self.sysctl_snapshot) = snapshot;

        // direct-routing backends answer for the VIP on loopback
        if let Err(e) = change_loopback_vip("add", self.vip).await {
            warn!(vip = %self.vip, error = %e, "could not add VIP to loopback");
        }

        self.marks.ensure_chain().await?;
        self.keepalived.start().await?;

        let (tx, rx) = watch::channel(false);
        *lock(&self.watchdog_stop) = Some(tx);
        let watchdog = CacheWatchdog::new(self.vip, self.ipvs.clone());
        tokio::spawn(watchdog.run(rx));

        Ok(())
    }

    async fn wait_for_start(&self) -> bool {
        for _ in 0..START_POLL_ATTEMPTS {
            if self.keepalived.is_running() {
                return true;
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }
        false
    }

    async fn stop(&self) -> Result<()> {
        info!("stopping ipvs direct-routing backend");

        if let Some(tx) = lock(&self.watchdog_stop).take() {
            let _ = tx.send(true);
        }

        let snapshot = std::mem::take(&mut *lock(&self.sysctl_snapshot));
        if !snapshot.is_empty() {
            if let Err(e) = sysctl::bulk_modify(&snapshot) {
                warn!(error = %e, "could not restore sysctl values");
            }
        }

        if let Err(e) = change_loopback_vip("del", self.vip).await {
            warn!(vip = %self.vip, error = %e, "could not remove VIP from loopback");
        }

        if let Err(e) = self.marks.delete_chain().await {
            warn!(error = %e, "could not remove packet mark chain");
        }

        self.keepalived.stop().await;
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn change_loopback_vip(op: &str, vip: Ipv4Addr) -> Result<()> {
    let output = tokio::process::Command::new("ip")
        .args(["addr", op, &format!("{vip}/32"), "dev", "lo"])
        .output()
        .await
        .map_err(|e| Error::net(format!("exec ip: {e}")))?;
    if !output.status.success() {
        return Err(Error::net(format!(
            "ip addr {op} {vip}/32 dev lo: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}
