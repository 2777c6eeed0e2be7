//! Kernel parameter access via `/proc/sys`.

use common::{Error, Result};
use std::collections::HashMap;
use std::path::PathBuf;

const SYSCTL_BASE: &str = "/proc/sys";

fn sysctl_path(name: &str) -> PathBuf {
    PathBuf::from(SYSCTL_BASE).join(name.replace('.', "/"))
}

/// Read a sysctl value by dotted name, e.g. `net.ipv4.ip_nonlocal_bind`.
pub fn get(name: &str) -> Result<String> {
    if !cfg!(target_os = "linux") {
        return Err(Error::sysctl("sysctl is only supported on linux"));
    }
    let data = std::fs::read_to_string(sysctl_path(name))
        .map_err(|e| Error::sysctl(format!("read {name}: {e}")))?;
    Ok(data.trim().to_string())
}

/// Set a sysctl value by dotted name.
pub fn set(name: &str, value: &str) -> Result<()> {
    if !cfg!(target_os = "linux") {
        return Err(Error::sysctl("sysctl is only supported on linux"));
    }
    std::fs::write(sysctl_path(name), value)
        .map_err(|e| Error::sysctl(format!("write {name}={value}: {e}")))
}

/// Apply a set of sysctl values, returning the previous values so the
/// caller can restore them exactly on shutdown.
///
/// Keys whose current value cannot be read are applied anyway but left
/// out of the snapshot; a failed write aborts with an error.
pub fn bulk_modify(values: &HashMap<String, String>) -> Result<HashMap<String, String>> {
    let mut previous = HashMap::with_capacity(values.len());

    for (name, value) in values {
        match get(name) {
            Ok(old) => {
                previous.insert(name.clone(), old);
            }
            Err(e) => {
                tracing::warn!(sysctl = %name, error = %e, "could not snapshot sysctl value");
            }
        }
        set(name, value)?;
    }

    Ok(previous)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sysctl_path() {
        assert_eq!(
            sysctl_path("net.ipv4.ip_nonlocal_bind"),
            PathBuf::from("/proc/sys/net/ipv4/ip_nonlocal_bind")
        );
        assert_eq!(
            sysctl_path("net/ipv4/ip_nonlocal_bind"),
            PathBuf::from("/proc/sys/net/ipv4/ip_nonlocal_bind")
        );
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_get_known_key() {
        // readable without privileges on any linux host
        let v = get("net.ipv4.ip_forward").unwrap();
        assert!(v == "0" || v == "1");
    }

    #[test]
    fn test_get_unknown_key() {
        assert!(get("net.ipv4.no_such_key_exists").is_err());
    }
}
