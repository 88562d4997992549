//! Network interface lookup.
//!
//! The operator runs in the host network namespace on Linux, so interface
//! metadata is read from sysfs.

use std::path::Path;

use crate::error::ReceiverError;

/// Index and hardware address of a network interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkInfo {
    /// Kernel interface index
    pub index: u32,

    /// Ethernet MAC address
    pub mac: [u8; 6],
}

/// Resolve an interface name to its index and MAC address.
pub fn lookup(name: &str) -> Result<LinkInfo, ReceiverError> {
    if name.is_empty() || name.contains('/') || name.contains("..") {
        return Err(ReceiverError::InterfaceNotFound {
            name: name.to_string(),
            reason: "invalid interface name".to_string(),
        });
    }

    let sysfs = Path::new("/sys/class/net").join(name);

    let index_raw =
        std::fs::read_to_string(sysfs.join("ifindex")).map_err(|e| not_found(name, &e))?;
    let index: u32 = index_raw
        .trim()
        .parse()
        .map_err(|e: std::num::ParseIntError| not_found(name, &e))?;

    let mac_raw =
        std::fs::read_to_string(sysfs.join("address")).map_err(|e| not_found(name, &e))?;
    let mac = parse_mac(mac_raw.trim()).ok_or_else(|| ReceiverError::InterfaceNotFound {
        name: name.to_string(),
        reason: format!("unparseable hardware address {:?}", mac_raw.trim()),
    })?;

    Ok(LinkInfo { index, mac })
}

fn not_found(name: &str, err: &dyn std::fmt::Display) -> ReceiverError {
    ReceiverError::InterfaceNotFound {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

fn parse_mac(s: &str) -> Option<[u8; 6]> {
    let mut mac = [0u8; 6];
    let mut parts = s.split(':');
    for byte in mac.iter_mut() {
        *byte = u8::from_str_radix(parts.next()?, 16).ok()?;
    }
    if parts.next().is_some() {
        return None;
    }
    Some(mac)
}
