//! Node-resident IPVS direct-routing failover backend.
//!
//! Each cluster node runs one instance. It elects a VIP holder through
//! a supervised keepalived process, marks VIP traffic so only locally
//! claimed connections reach the IPVS table, and keeps the table
//! consistent across role changes.

pub mod iptables;
pub mod ipvscache;
pub mod keepalived;
pub mod provider;
pub mod ratelimit;
pub mod settings;
pub mod types;

pub use provider::{IpvsdrProvider, Provider, ProviderParts};
pub use settings::{Settings, StaticStore};
pub use types::{Info, LoadBalancer, StoreLister};
