//! Agent settings, loaded once at boot from a YAML file.

use crate::types::{LoadBalancer, NodeLister, PortLister};
use common::{Error, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;
use validator::Validate;

/// Environment variable overriding the settings file location.
pub const SETTINGS_PATH_ENV: &str = "PROVIDER_CONFIG";

/// Default settings file location inside the agent container.
pub const DEFAULT_SETTINGS_PATH: &str = "/etc/provider-ipvsdr/config.yaml";

fn default_true() -> bool {
    true
}

/// Everything the agent needs to run on one node.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct Settings {
    #[serde(default)]
    pub debug: bool,

    /// VRRP in unicast mode. Multicast needs switch support most
    /// clusters don't have, so unicast is the default.
    #[serde(default = "default_true")]
    pub unicast: bool,

    /// The desired-state object this agent reconciles; the embedded
    /// object must match.
    #[validate(length(min = 1))]
    pub loadbalancer_namespace: String,
    #[validate(length(min = 1))]
    pub loadbalancer_name: String,

    /// This node's own routable address.
    pub node_ip: Ipv4Addr,

    pub loadbalancer: LoadBalancer,

    /// Name to routable-address map for every candidate member node.
    pub nodes: HashMap<String, Ipv4Addr>,

    /// Ports exported by the proxy's port-mapping config.
    #[serde(default)]
    pub tcp_ports: Vec<u16>,
    #[serde(default)]
    pub udp_ports: Vec<u16>,
}

impl Settings {
    /// Load from `PROVIDER_CONFIG` or the default path.
    pub fn load() -> Result<Self> {
        let path =
            std::env::var(SETTINGS_PATH_ENV).unwrap_or_else(|_| DEFAULT_SETTINGS_PATH.to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("read {}: {e}", path.display())))?;
        let settings: Settings = serde_yaml::from_str(&text)
            .map_err(|e| Error::config(format!("parse {}: {e}", path.display())))?;
        settings
            .validate()
            .map_err(|e| Error::config(format!("invalid settings: {e}")))?;
        settings.loadbalancer.validate()?;
        settings.check_target()?;
        Ok(settings)
    }

    /// The embedded desired-state object must be the configured target.
    fn check_target(&self) -> Result<()> {
        if self.loadbalancer.namespace != self.loadbalancer_namespace
            || self.loadbalancer.name != self.loadbalancer_name
        {
            return Err(Error::config(format!(
                "loadbalancer object {}/{} does not match the configured target {}/{}",
                self.loadbalancer.namespace,
                self.loadbalancer.name,
                self.loadbalancer_namespace,
                self.loadbalancer_name,
            )));
        }
        Ok(())
    }
}

/// Store accessors backed by the loaded settings.
pub struct StaticStore {
    nodes: HashMap<String, Ipv4Addr>,
    tcp_ports: Vec<u16>,
    udp_ports: Vec<u16>,
}

impl StaticStore {
    pub fn new(settings: &Settings) -> Self {
        Self {
            nodes: settings.nodes.clone(),
            tcp_ports: settings.tcp_ports.clone(),
            udp_ports: settings.udp_ports.clone(),
        }
    }
}

impl NodeLister for StaticStore {
    fn node_ip(&self, name: &str) -> Option<Ipv4Addr> {
        self.nodes.get(name).copied()
    }
}

impl PortLister for StaticStore {
    fn exported_ports(&self) -> (Vec<u16>, Vec<u16>) {
        (self.tcp_ports.clone(), self.udp_ports.clone())
    }
}
