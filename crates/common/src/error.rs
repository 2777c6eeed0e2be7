//! Common error types for the loadbalancer provider components.

use std::fmt;

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for provider operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("network error: {0}")]
    Net(String),

    #[error("ARP error: {0}")]
    Arp(String),

    #[error("sysctl error: {0}")]
    Sysctl(String),

    #[error("iptables error: {0}")]
    Iptables(String),

    #[error("IPVS error: {0}")]
    Ipvs(String),

    #[error("daemon error: {0}")]
    Daemon(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("unknown error: {0}")]
    Other(String),
}

impl Error {
    /// Create a new network error.
    pub fn net(msg: impl fmt::Display) -> Self {
        Error::Net(msg.to_string())
    }

    /// Create a new ARP error.
    pub fn arp(msg: impl fmt::Display) -> Self {
        Error::Arp(msg.to_string())
    }

    /// Create a new sysctl error.
    pub fn sysctl(msg: impl fmt::Display) -> Self {
        Error::Sysctl(msg.to_string())
    }

    /// Create a new iptables error.
    pub fn iptables(msg: impl fmt::Display) -> Self {
        Error::Iptables(msg.to_string())
    }

    /// Create a new IPVS error.
    pub fn ipvs(msg: impl fmt::Display) -> Self {
        Error::Ipvs(msg.to_string())
    }

    /// Create a new daemon error.
    pub fn daemon(msg: impl fmt::Display) -> Self {
        Error::Daemon(msg.to_string())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl fmt::Display) -> Self {
        Error::Config(msg.to_string())
    }

    /// Create a new validation error.
    pub fn validation(msg: impl fmt::Display) -> Self {
        Error::Validation(msg.to_string())
    }

    /// Create a new other error.
    pub fn other(msg: impl fmt::Display) -> Self {
        Error::Other(msg.to_string())
    }
}
