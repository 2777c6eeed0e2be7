//! Host networking utilities for the loadbalancer provider.
//!
//! Covers local interface discovery, ARP neighbor resolution and
//! sysctl manipulation. Everything here is read-mostly; the only
//! writes are sysctl values and the ARP probe frames.

pub mod arp;
pub mod interface;
pub mod sysctl;

pub use arp::{ArpResolver, MacAddr, NeighborEntry};
pub use interface::Interface;
