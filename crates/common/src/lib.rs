//! Common utilities and types shared across the loadbalancer provider components.

pub mod error;
pub mod logging;

pub use error::{Error, Result};
