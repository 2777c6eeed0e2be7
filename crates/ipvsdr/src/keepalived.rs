//! Generation and supervision of the keepalived failover daemon.
//!
//! The rendered configuration is the single artifact keepalived reads;
//! it is replaced wholesale and the daemon is told to reload only when
//! the content digest actually changed.

use crate::iptables::{ACCEPT_MARK, CHAIN, IptablesRunner, MARK_MASK, TABLE_FILTER};
use crate::types::{Peer, VirtualServer, dedup_vips};
use common::{Error, Result};
use execd::{Daemon, ExecError};
use netutil::Interface;
use nix::sys::signal::Signal;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

/// Where the supervised daemon reads its configuration.
pub const KEEPALIVED_CONFIG: &str = "/etc/keepalived/keepalived.conf";

/// Everything the configuration is rendered from.
///
/// The rendered text is the change-detection artifact, so every input
/// the apply step depends on must leave a trace in it. That includes
/// the exported ports and peer hardware addresses the mark rules are
/// programmed from.
#[derive(Debug)]
pub struct ConfigData<'a> {
    pub iface: &'a str,
    pub node_ip: Ipv4Addr,
    pub servers: &'a [VirtualServer],
    pub peers: &'a [Peer],
    pub tcp_ports: &'a [u16],
    pub udp_ports: &'a [u16],
    pub priority: u32,
    pub vrid: u8,
    pub use_unicast: bool,
}

fn port_list(ports: &[u16]) -> String {
    if ports.is_empty() {
        return "none".to_string();
    }
    ports
        .iter()
        .map(u16::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

/// Render the keepalived configuration text.
///
/// Byte-identical output for identical inputs: virtual servers are
/// sorted by VIP before rendering, everything else keeps the caller's
/// (stable) order. Change detection hashes this text.
pub fn render(data: &ConfigData) -> String {
    let mut servers = data.servers.to_vec();
    servers.sort_by_key(|vs| vs.vip);
    let vips = dedup_vips(&servers);

    let mut out = String::new();

    let _ = writeln!(out, "! Configuration generated by provider-ipvsdr");
    let _ = writeln!(out, "! iptables chain: {CHAIN}");
    let _ = writeln!(out, "! accept mark: {ACCEPT_MARK}/{MARK_MASK}");
    let _ = writeln!(out, "! node {}", data.node_ip);
    for peer in data.peers {
        let _ = writeln!(out, "! peer {} {}", peer.ip, peer.mac);
    }
    let _ = writeln!(out, "! tcp ports {}", port_list(data.tcp_ports));
    let _ = writeln!(out, "! udp ports {}", port_list(data.udp_ports));
    let _ = writeln!(out);

    let _ = writeln!(out, "vrrp_instance vips {{");
    let _ = writeln!(out, "  state BACKUP");
    let _ = writeln!(out, "  interface {}", data.iface);
    let _ = writeln!(out, "  virtual_router_id {}", data.vrid);
    let _ = writeln!(out, "  priority {}", data.priority);
    let _ = writeln!(out, "  nopreempt");
    let _ = writeln!(out, "  advert_int 1");
    let _ = writeln!(out);
    let _ = writeln!(out, "  track_interface {{");
    let _ = writeln!(out, "    {}", data.iface);
    let _ = writeln!(out, "  }}");

    if data.use_unicast {
        let _ = writeln!(out);
        let _ = writeln!(out, "  unicast_src_ip {}", data.node_ip);
        let _ = writeln!(out, "  unicast_peer {{");
        for peer in data.peers {
            let _ = writeln!(out, "    {}", peer.ip);
        }
        let _ = writeln!(out, "  }}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "  virtual_ipaddress {{");
    for vip in &vips {
        let _ = writeln!(out, "    {vip}");
    }
    let _ = writeln!(out, "  }}");
    let _ = writeln!(out, "}}");

    // dispatch is keyed on the accept mark, not the VIP: only traffic
    // the mangle chain marked (right ports, not peer-sourced) ever
    // reaches the virtual service
    for vs in &servers {
        let _ = writeln!(out);
        let _ = writeln!(out, "virtual_server fwmark {ACCEPT_MARK} {{");
        let _ = writeln!(out, "  delay_loop 5");
        let _ = writeln!(out, "  lb_algo {}", vs.scheduler);
        let _ = writeln!(out, "  lb_kind DR");
        let _ = writeln!(out, "  persistence_timeout 360");
        let _ = writeln!(out, "  protocol TCP");
        for rs in &vs.real_servers {
            let _ = writeln!(out);
            let _ = writeln!(out, "  real_server {rs} 0 {{");
            let _ = writeln!(out, "    weight 1");
            let _ = writeln!(out, "  }}");
        }
        let _ = writeln!(out, "}}");
    }

    out
}

/// Content digest of a rendered configuration.
pub fn checksum(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Handle on the supervised keepalived process and its config file.
pub struct Keepalived {
    iface: Interface,
    ipt: Arc<dyn IptablesRunner>,
    daemon: Daemon,
    config_path: PathBuf,
    /// VIPs from the last installed config, released on stop.
    vips: Mutex<Vec<Ipv4Addr>>,
}

impl Keepalived {
    pub fn new(iface: Interface, ipt: Arc<dyn IptablesRunner>) -> Self {
        let daemon = Daemon::new(
            "keepalived",
            [
                "--dont-fork",
                "--log-console",
                "--release-vips",
                "--pid",
                "/keepalived.pid",
            ],
        );
        daemon.set_grace_period(Duration::from_secs(1));

        Self {
            iface,
            ipt,
            daemon,
            config_path: PathBuf::from(KEEPALIVED_CONFIG),
            vips: Mutex::new(Vec::new()),
        }
    }

    /// Override the config path (tests).
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = path.into();
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Install a rendered configuration with a whole-file replace, so a
    /// reload racing the write never observes a torn file.
    pub async fn install_config(&self, text: &str, servers: &[VirtualServer]) -> Result<()> {
        info!(path = %self.config_path.display(), "installing keepalived config");

        *lock_vips(&self.vips) = dedup_vips(servers);

        let tmp = self.config_path.with_extension("tmp");
        tokio::fs::write(&tmp, text)
            .await
            .map_err(|e| Error::config(format!("write {}: {e}", tmp.display())))?;
        tokio::fs::rename(&tmp, &self.config_path)
            .await
            .map_err(|e| Error::config(format!("rename into {}: {e}", self.config_path.display())))
    }

    /// Start keepalived under supervision. The daemon's own VIP logic
    /// needs the filter-table chain, separate from the mangle chain the
    /// mark manager owns.
    pub async fn start(&self) -> Result<()> {
        let existed = self.ipt.ensure_chain(TABLE_FILTER, CHAIN).await?;
        if existed {
            info!(chain = CHAIN, "filter chain already existed");
        }

        self.daemon
            .run_forever()
            .map_err(|e| Error::daemon(e.to_string()))
    }

    pub fn is_running(&self) -> bool {
        self.daemon.is_running()
    }

    /// Ask the running daemon to re-read its configuration.
    ///
    /// A daemon that is not currently running is an expected transient
    /// state (crash-restart window), not a reload failure.
    pub fn reload(&self) -> Result<()> {
        info!("reloading keepalived");
        match self.daemon.signal(Signal::SIGHUP) {
            Ok(()) => Ok(()),
            Err(ExecError::NotRunning) => {
                warn!("keepalived is not running, skipping the reload");
                Ok(())
            }
            Err(e) => Err(Error::daemon(format!("reload keepalived: {e}"))),
        }
    }

    /// Release VIPs, drop the filter chain and stop the process.
    pub async fn stop(&self) {
        let vips = std::mem::take(&mut *lock_vips(&self.vips));
        for vip in vips {
            if let Err(e) = remove_vip(vip, &self.iface.name).await {
                warn!(%vip, error = %e, "could not remove VIP from service interface");
            }
        }

        if let Err(e) = self.ipt.flush_chain(TABLE_FILTER, CHAIN).await {
            warn!(chain = CHAIN, error = %e, "could not flush filter chain");
        }

        info!("stopping keepalived process");
        self.daemon.stop().await;
    }
}

fn lock_vips(vips: &Mutex<Vec<Ipv4Addr>>) -> std::sync::MutexGuard<'_, Vec<Ipv4Addr>> {
    vips.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

async fn remove_vip(vip: Ipv4Addr, dev: &str) -> Result<()> {
    let output = tokio::process::Command::new("ip")
        .args(["addr", "del", &format!("{vip}/32"), "dev", dev])
        .output()
        .await
        .map_err(|e| Error::net(format!("exec ip: {e}")))?;
    if !output.status.success() {
        return Err(Error::net(format!(
            "removing VIP {vip} from {dev}: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Scheduler;
    use netutil::MacAddr;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn sample_data<'a>(servers: &'a [VirtualServer], peers: &'a [Peer]) -> ConfigData<'a> {
        ConfigData {
            iface: "eth0",
            node_ip: ip("192.168.1.2"),
            servers,
            peers,
            tcp_ports: &[80, 443, 450, 451],
            udp_ports: &[],
            priority: 101,
            vrid: 110,
            use_unicast: true,
        }
    }

    fn sample_servers() -> Vec<VirtualServer> {
        vec![
            VirtualServer {
                vip: ip("192.168.99.201"),
                scheduler: Scheduler::Wrr,
                real_servers: vec![ip("192.168.1.1"), ip("192.168.1.2")],
            },
            VirtualServer {
                vip: ip("192.168.99.200"),
                scheduler: Scheduler::Rr,
                real_servers: vec![ip("192.168.1.1"), ip("192.168.1.2")],
            },
        ]
    }

    fn sample_peers() -> Vec<Peer> {
        vec![Peer {
            ip: ip("192.168.1.1"),
            mac: MacAddr([0, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]),
        }]
    }

    #[test]
    fn test_render_is_deterministic() {
        let servers = sample_servers();
        let peers = sample_peers();
        let a = render(&sample_data(&servers, &peers));
        let b = render(&sample_data(&servers, &peers));
        assert_eq!(a, b);

        // input order of virtual servers must not matter
        let mut reversed = servers.clone();
        reversed.reverse();
        let c = render(&sample_data(&reversed, &peers));
        assert_eq!(a, c);
    }

    #[test]
    fn test_render_contains_required_data() {
        let servers = sample_servers();
        let peers = sample_peers();
        let text = render(&sample_data(&servers, &peers));

        assert!(text.contains("interface eth0"));
        assert!(text.contains("priority 101"));
        assert!(text.contains("virtual_router_id 110"));
        assert!(text.contains("unicast_src_ip 192.168.1.2"));
        assert!(text.contains("    192.168.1.1\n")); // unicast peer
        assert!(text.contains("! node 192.168.1.2"));
        assert!(text.contains("! peer 192.168.1.1 00:1a:2b:3c:4d:5e"));
        assert!(text.contains("! tcp ports 80,443,450,451"));
        assert!(text.contains("    192.168.99.200\n")); // virtual_ipaddress
        assert!(text.contains("    192.168.99.201\n"));
        assert!(text.contains("lb_algo rr"));
        assert!(text.contains("lb_algo wrr"));
        assert!(text.contains("lb_kind DR"));
        assert!(text.contains("real_server 192.168.1.1 0 {"));
    }

    #[test]
    fn test_render_multicast_omits_unicast_block() {
        let servers = sample_servers();
        let peers = sample_peers();
        let mut data = sample_data(&servers, &peers);
        data.use_unicast = false;
        let text = render(&data);
        assert!(!text.contains("unicast_src_ip"));
        assert!(!text.contains("unicast_peer"));
        // the node and peer records are not a unicast concern
        assert!(text.contains("! node 192.168.1.2"));
        assert!(text.contains("! peer 192.168.1.1 00:1a:2b:3c:4d:5e"));
    }

    #[test]
    fn test_dispatch_is_keyed_on_the_accept_mark() {
        let servers = sample_servers();
        let peers = sample_peers();
        let text = render(&sample_data(&servers, &peers));

        // the virtual service must only see traffic the mangle chain
        // granted the accept mark, so it is fwmark-keyed, never
        // address-keyed
        assert_eq!(text.matches("virtual_server fwmark 1 {").count(), 2);
        assert!(!text.contains("virtual_server 192.168.99.200"));
        assert!(!text.contains("virtual_server 192.168.99.201"));
    }

    #[test]
    fn test_shared_vip_rendered_once() {
        let servers = vec![
            VirtualServer {
                vip: ip("192.168.99.200"),
                scheduler: Scheduler::Rr,
                real_servers: vec![ip("192.168.1.1")],
            },
            VirtualServer {
                vip: ip("192.168.99.200"),
                scheduler: Scheduler::Sh,
                real_servers: vec![ip("192.168.1.1")],
            },
        ];
        let peers = sample_peers();
        let text = render(&sample_data(&servers, &peers));

        let in_vip_block = text
            .split("virtual_ipaddress {")
            .nth(1)
            .unwrap()
            .split('}')
            .next()
            .unwrap();
        assert_eq!(in_vip_block.matches("192.168.99.200").count(), 1);
    }

    #[test]
    fn test_checksum_tracks_content() {
        let servers = sample_servers();
        let peers = sample_peers();
        let a = checksum(&render(&sample_data(&servers, &peers)));
        let b = checksum(&render(&sample_data(&servers, &peers)));
        assert_eq!(a, b);

        let mut data = sample_data(&servers, &peers);
        data.priority = 102;
        assert_ne!(a, checksum(&render(&data)));
    }

    #[test]
    fn test_checksum_tracks_ports_and_peer_macs() {
        let servers = sample_servers();
        let peers = sample_peers();
        let base = checksum(&render(&sample_data(&servers, &peers)));

        // exported ports feed the mark rules, so a port-map change must
        // not be mistaken for an unchanged desired state
        let mut data = sample_data(&servers, &peers);
        data.tcp_ports = &[80, 443, 450, 451, 9090];
        assert_ne!(base, checksum(&render(&data)));

        // same member set, new hardware address
        let moved = vec![Peer {
            ip: ip("192.168.1.1"),
            mac: MacAddr([0, 0x1a, 0x2b, 0x3c, 0x4d, 0x99]),
        }];
        assert_ne!(base, checksum(&render(&sample_data(&servers, &moved))));
    }
}
