//! Network discovery for heartbeat status
//!
//! This module handles:
//! - Network interface enumeration with IP addresses
//! - Interface classification and ordering (Ethernet > WiFi > Other)
//! - Hostname lookup

use anyhow::{Context, Result};
use fleet_proto::{Address, AddressType};
use if_addrs::{get_if_addrs, IfAddr};
use tracing::{debug, info, warn};

/// Interface type classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum InterfaceType {
    Ethernet,
    Wireless,
    Other,
    Loopback,
}

/// Non-loopback interface with its address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInterface {
    pub name: String,
    pub ip: String,
    pub interface_type: InterfaceType,
}

/// Classify interface type based on name patterns
pub fn classify_interface(name: &str) -> InterfaceType {
    let name_lower = name.to_lowercase();

    if name_lower == "lo" || name_lower.starts_with("lo0") || name_lower.contains("loopback") {
        return InterfaceType::Loopback;
    }

    if name_lower.contains("wlan") || name_lower.contains("wifi") ||
       name_lower.contains("wlp") || name_lower.contains("wlo") {
        return InterfaceType::Wireless;
    }

    if name_lower.starts_with("eth") || name_lower.starts_with("en") {
        return InterfaceType::Ethernet;
    }

    InterfaceType::Other
}

/// Enumerate non-loopback interfaces, Ethernet first, then WiFi, then the rest.
pub fn discover_interfaces() -> Result<Vec<NetworkInterface>> {
    debug!("Enumerating network interfaces...");
    let if_addrs = get_if_addrs().context("Failed to enumerate network interfaces")?;

    let mut interfaces: Vec<NetworkInterface> = if_addrs
        .into_iter()
        .filter(|a| !a.is_loopback())
        .map(|a| {
            let ip = match a.addr {
                IfAddr::V4(v4) => v4.ip.to_string(),
                IfAddr::V6(v6) => v6.ip.to_string(),
            };
            NetworkInterface {
                interface_type: classify_interface(&a.name),
                name: a.name,
                ip,
            }
        })
        .collect();
    interfaces.sort_by_key(|i| i.interface_type);

    info!("Found {} network interfaces", interfaces.len());
    Ok(interfaces)
}

pub fn hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "localhost".to_string())
}

/// Heartbeat addresses: every interface IP as InternalIP, then the hostname.
pub fn to_addresses(interfaces: &[NetworkInterface], host: &str) -> Vec<Address> {
    interfaces
        .iter()
        .map(|i| Address { address: i.ip.clone(), address_type: AddressType::InternalIp })
        .chain(std::iter::once(Address { address: host.to_string(), address_type: AddressType::HostName }))
        .collect()
}

/// Best-effort discovery: an enumeration failure leaves only the hostname.
pub fn discover_addresses() -> Vec<Address> {
    let host = hostname();
    let interfaces = discover_interfaces().unwrap_or_else(|e| {
        warn!("interface discovery failed: {:#}", e);
        Vec::new()
    });
    to_addresses(&interfaces, &host)
}
