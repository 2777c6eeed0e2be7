//! Packet-marking rules gating what the local IPVS table may serve.
//!
//! Traffic for the VIP on the exposed ports gets the accept mark; any
//! frame sourced from a peer's MAC is re-marked with the drop mark so
//! two nodes never both dispatch the same connection.

use crate::types::Peer;
use async_trait::async_trait;
use common::{Error, Result};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Chain owned by this backend, distinct from the ingress sidecar's.
pub const CHAIN: &str = "LOADBALANCER-IPVS-DR";

pub const TABLE_MANGLE: &str = "mangle";
pub const TABLE_FILTER: &str = "filter";

/// Mark granted to traffic the local IPVS table should serve.
pub const ACCEPT_MARK: u32 = 1;
/// Mark excluding traffic a peer has already claimed.
pub const DROP_MARK: u32 = 0;
/// Only the lowest bit is ours.
pub const MARK_MASK: &str = "0x00000001";

/// iptables refuses more ports than this in one multiport match.
pub const MAX_MULTIPORT: usize = 15;

/// Where a rule is placed relative to the chain's existing rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RulePosition {
    Append,
    Prepend,
}

/// Capability interface over the iptables binary, swappable in tests.
#[async_trait]
pub trait IptablesRunner: Send + Sync {
    /// Create the chain if missing; true when it already existed.
    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool>;

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()>;

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Install a rule if not already present.
    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<()>;

    /// Remove a rule if present.
    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<()>;
}

/// Runner shelling out to the system iptables binary.
pub struct IptablesCmd;

impl IptablesCmd {
    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        debug!(?args, "iptables");
        Command::new("iptables")
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| Error::iptables(format!("exec iptables: {e}")))
    }

    async fn rule_exists(&self, table: &str, chain: &str, args: &[String]) -> Result<bool> {
        let mut cmd = vec!["-t", table, "-C", chain];
        cmd.extend(args.iter().map(String::as_str));
        Ok(self.run(&cmd).await?.status.success())
    }
}

#[async_trait]
impl IptablesRunner for IptablesCmd {
    async fn ensure_chain(&self, table: &str, chain: &str) -> Result<bool> {
        let output = self.run(&["-t", table, "-N", chain]).await?;
        if output.status.success() {
            return Ok(false);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("already exists") {
            return Ok(true);
        }
        Err(Error::iptables(format!(
            "create chain {chain} in {table}: {stderr}"
        )))
    }

    async fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        let output = self.run(&["-t", table, "-F", chain]).await?;
        if !output.status.success() {
            return Err(Error::iptables(format!(
                "flush chain {chain} in {table}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        let output = self.run(&["-t", table, "-X", chain]).await?;
        if !output.status.success() {
            return Err(Error::iptables(format!(
                "delete chain {chain} in {table}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn ensure_rule(
        &self,
        position: RulePosition,
        table: &str,
        chain: &str,
        args: &[String],
    ) -> Result<()> {
        if self.rule_exists(table, chain, args).await? {
            return Ok(());
        }
        let op = match position {
            RulePosition::Append => "-A",
            RulePosition::Prepend => "-I",
        };
        let mut cmd = vec!["-t", table, op, chain];
        cmd.extend(args.iter().map(String::as_str));
        let output = self.run(&cmd).await?;
        if !output.status.success() {
            return Err(Error::iptables(format!(
                "install rule in {chain}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn delete_rule(&self, table: &str, chain: &str, args: &[String]) -> Result<()> {
        if !self.rule_exists(table, chain, args).await? {
            return Ok(());
        }
        let mut cmd = vec!["-t", table, "-D", chain];
        cmd.extend(args.iter().map(String::as_str));
        let output = self.run(&cmd).await?;
        if !output.status.success() {
            return Err(Error::iptables(format!(
                "delete rule in {chain}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Manages the backend's dedicated mangle chain.
pub struct MarkManager {
    ipt: Arc<dyn IptablesRunner>,
    iface: String,
    vip: Ipv4Addr,
}

impl MarkManager {
    pub fn new(ipt: Arc<dyn IptablesRunner>, iface: impl Into<String>, vip: Ipv4Addr) -> Self {
        Self {
            ipt,
            iface: iface.into(),
            vip,
        }
    }

    /// Create the chain and the PREROUTING jump into it.
    pub async fn ensure_chain(&self) -> Result<()> {
        let existed = self.ipt.ensure_chain(TABLE_MANGLE, CHAIN).await?;
        if existed {
            info!(chain = CHAIN, "chain already existed");
        }
        self.ipt
            .ensure_rule(
                RulePosition::Append,
                TABLE_MANGLE,
                "PREROUTING",
                &["-j".to_string(), CHAIN.to_string()],
            )
            .await
    }

    /// Tear down the chain and its jump rule.
    pub async fn delete_chain(&self) -> Result<()> {
        self.ipt.flush_chain(TABLE_MANGLE, CHAIN).await?;
        self.ipt
            .delete_rule(
                TABLE_MANGLE,
                "PREROUTING",
                &["-j".to_string(), CHAIN.to_string()],
            )
            .await?;
        self.ipt.delete_chain(TABLE_MANGLE, CHAIN).await
    }

    /// Rebuild the marking rules for the current peer set and ports.
    ///
    /// The previous rule set is flushed first so rules for a departed
    /// peer can never coexist with the new set. Peer drop rules are
    /// appended and the accept rules prepended afterwards: MARK does
    /// not terminate evaluation, so a frame from a peer traverses both
    /// and the later drop rule decides its final mark.
    pub async fn ensure_rules(&self, peers: &[Peer], tcp_ports: &[u16], udp_ports: &[u16]) {
        info!(
            peers = peers.len(),
            tcp = tcp_ports.len(),
            udp = udp_ports.len(),
            "rebuilding packet mark rules"
        );

        if let Err(e) = self.ipt.flush_chain(TABLE_MANGLE, CHAIN).await {
            warn!(error = %e, "could not flush mark chain");
        }

        for peer in peers {
            for protocol in ["tcp", "udp"] {
                let args = self.mark_args(protocol, DROP_MARK, Some(peer.mac.to_string()), &[]);
                if let Err(e) = self
                    .ipt
                    .ensure_rule(RulePosition::Append, TABLE_MANGLE, CHAIN, &args)
                    .await
                {
                    warn!(
                        ip = %peer.ip,
                        mac = %peer.mac,
                        protocol,
                        error = %e,
                        "failed to install peer drop rule"
                    );
                }
            }
        }

        self.prepend_accept_rules("tcp", tcp_ports).await;
        self.prepend_accept_rules("udp", udp_ports).await;
    }

    async fn prepend_accept_rules(&self, protocol: &str, ports: &[u16]) {
        // iptables caps multiport matches, so wide port sets become
        // several rules rather than a truncated one
        for chunk in ports.chunks(MAX_MULTIPORT) {
            let args = self.mark_args(protocol, ACCEPT_MARK, None, chunk);
            if let Err(e) = self
                .ipt
                .ensure_rule(RulePosition::Prepend, TABLE_MANGLE, CHAIN, &args)
                .await
            {
                warn!(protocol, ?chunk, error = %e, "failed to install accept rule");
            }
        }
    }

    fn mark_args(
        &self,
        protocol: &str,
        mark: u32,
        mac_source: Option<String>,
        ports: &[u16],
    ) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.iface.clone(),
            "-d".to_string(),
            self.vip.to_string(),
            "-p".to_string(),
            protocol.to_string(),
        ];
        if !ports.is_empty() {
            let list = ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(",");
            args.extend(["-m".to_string(), "multiport".to_string(), "--dports".to_string(), list]);
        }
        if let Some(mac) = mac_source {
            args.extend(["-m".to_string(), "mac".to_string(), "--mac-source".to_string(), mac]);
        }
        args.extend([
            "-j".to_string(),
            "MARK".to_string(),
            "--set-xmark".to_string(),
            format!("{mark}/{MARK_MASK}"),
        ]);
        args
    }
}
