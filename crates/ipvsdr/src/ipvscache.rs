//! Watchdog over the IPVS persistent-connection cache.
//!
//! A backup node whose connection table still references sessions now
//! owned by the new master must not keep its virtual-service rules
//! live. The watchdog saves the rules, clears the table and restores
//! the save once the node holds the VIP again (or the table drains).

use async_trait::async_trait;
use common::{Error, Result};
use std::net::Ipv4Addr;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// How often the watchdog inspects VIP and connection-table state.
pub const TICK_INTERVAL: Duration = Duration::from_secs(10);

/// Capability interface over the IPVS rule table, swappable in tests.
///
/// The watchdog is the only component that mutates the table through
/// this interface.
#[async_trait]
pub trait IpvsRunner: Send + Sync {
    /// Dump the current virtual-service rules (`ipvsadm -Sn`).
    async fn save(&self) -> Result<String>;

    /// Clear the whole table (`ipvsadm -C`).
    async fn clear(&self) -> Result<()>;

    /// Load a previously saved dump (`ipvsadm -R`).
    async fn restore(&self, rules: &str) -> Result<()>;
}

/// Runner shelling out to the ipvsadm binary.
pub struct IpvsadmCmd;

#[async_trait]
impl IpvsRunner for IpvsadmCmd {
    async fn save(&self) -> Result<String> {
        let output = Command::new("ipvsadm")
            .arg("-Sn")
            .output()
            .await
            .map_err(|e| Error::ipvs(format!("exec ipvsadm: {e}")))?;
        if !output.status.success() {
            return Err(Error::ipvs(format!(
                "save rules: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn clear(&self) -> Result<()> {
        let output = Command::new("ipvsadm")
            .arg("-C")
            .output()
            .await
            .map_err(|e| Error::ipvs(format!("exec ipvsadm: {e}")))?;
        if !output.status.success() {
            return Err(Error::ipvs(format!(
                "clear rules: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }

    async fn restore(&self, rules: &str) -> Result<()> {
        let mut child = Command::new("ipvsadm")
            .arg("-R")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::ipvs(format!("exec ipvsadm: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(rules.as_bytes())
                .await
                .map_err(|e| Error::ipvs(format!("feed rules: {e}")))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| Error::ipvs(format!("wait ipvsadm: {e}")))?;
        if !output.status.success() {
            return Err(Error::ipvs(format!(
                "restore rules: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// True when the connection listing has at least one entry row after
/// the header.
pub fn has_connection_entries(text: &str) -> bool {
    text.lines().skip(1).any(|line| !line.trim().is_empty())
}

/// Whether the kernel's persistent-connection table is non-empty.
fn connection_table_active() -> bool {
    match std::fs::read_to_string("/proc/net/ip_vs_conn") {
        Ok(text) => has_connection_entries(&text),
        Err(_) => false,
    }
}

type Probe = Box<dyn Fn() -> bool + Send + Sync>;

/// Periodic task keeping the IPVS table consistent with node role.
///
/// `saved` is a single-slot buffer: it is only ever refreshed from a
/// non-empty capture and emptied by a successful restore. No other
/// component touches it.
pub struct CacheWatchdog {
    ipvs: Arc<dyn IpvsRunner>,
    vip_present: Probe,
    conn_active: Probe,
    saved: String,
}

impl CacheWatchdog {
    pub fn new(vip: Ipv4Addr, ipvs: Arc<dyn IpvsRunner>) -> Self {
        Self {
            ipvs,
            vip_present: Box::new(move || netutil::interface::ip_present_on_non_loopback(vip)),
            conn_active: Box::new(connection_table_active),
            saved: String::new(),
        }
    }

    /// Build a watchdog with injected probes (tests).
    pub fn with_probes(ipvs: Arc<dyn IpvsRunner>, vip_present: Probe, conn_active: Probe) -> Self {
        Self {
            ipvs,
            vip_present,
            conn_active,
            saved: String::new(),
        }
    }

    pub fn saved(&self) -> &str {
        &self.saved
    }

    /// Run the tick loop until `stop` flips to true.
    pub async fn run(mut self, mut stop: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(TICK_INTERVAL);
        info!("ipvs cache watchdog started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = stop.changed() => {
                    if *stop.borrow() {
                        info!("ipvs cache watchdog stopped");
                        return;
                    }
                }
            }
        }
    }

    /// One inspection pass; pure given the two probe results.
    pub async fn tick(&mut self) {
        if (self.vip_present)() {
            // master: checking the connection cache can burn a lot of
            // cpu under load, so just re-apply any pending save
            self.restore().await;
            return;
        }

        if (self.conn_active)() {
            // backup with live connection state: park the rules until
            // the cache expires
            self.save_and_clear().await;
        } else {
            self.restore().await;
        }
    }

    async fn save_and_clear(&mut self) {
        if !self.saved.is_empty() {
            return;
        }

        let dump = match self.ipvs.save().await {
            Ok(dump) => dump,
            Err(e) => {
                error!(error = %e, "could not save ipvs rules");
                return;
            }
        };
        if dump.trim().is_empty() {
            // nothing to park; never clobber a previous good save
            return;
        }

        if let Err(e) = self.ipvs.clear().await {
            error!(error = %e, "could not clear ipvs rules");
            return;
        }

        self.saved = dump;
        info!("saved ipvs rules, waiting for the connection cache to drain");
        debug!(rules = %self.saved, "parked rule dump");
    }

    async fn restore(&mut self) {
        if self.saved.is_empty() {
            return;
        }

        if let Err(e) = self.ipvs.restore(&self.saved).await {
            error!(error = %e, "could not restore ipvs rules");
            return;
        }

        self.saved.clear();
        info!("restored ipvs rules");
    }
}
