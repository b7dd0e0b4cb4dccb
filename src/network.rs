//! Host network descriptions.
//!
//! Backends enumerate the host networks an instance can be bridged to.
//! Bridging onto a plain physical adapter reconfigures the host, so those
//! networks need explicit user authorization; networks that already are a
//! bridge or virtual switch do not.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Kind of host network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InterfaceType {
    /// Wired adapter.
    Ethernet,
    /// Wireless adapter.
    Wifi,
    /// Linux bridge (or macOS bridge).
    Bridge,
    /// Hyper-V virtual switch.
    Switch,
    /// Anything else.
    #[default]
    Unknown,
}

impl InterfaceType {
    /// Parse a native type string (sysfs `DEVTYPE`, PowerShell `SwitchType`).
    pub fn from_native(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "ethernet" | "802-3-ethernet" | "physical" => InterfaceType::Ethernet,
            "wifi" | "wlan" | "wireless" | "802-11-wireless" => InterfaceType::Wifi,
            "bridge" => InterfaceType::Bridge,
            "switch" | "external" | "internal" | "private" => InterfaceType::Switch,
            _ => InterfaceType::Unknown,
        }
    }
}

impl std::fmt::Display for InterfaceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InterfaceType::Ethernet => "ethernet",
            InterfaceType::Wifi => "wifi",
            InterfaceType::Bridge => "bridge",
            InterfaceType::Switch => "switch",
            InterfaceType::Unknown => "unknown",
        };
        write!(f, "{}", s)
    }
}

/// A host network an instance can attach to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterfaceInfo {
    /// Host identifier (`eth0`, `br0`, switch name).
    pub id: String,
    /// Kind of network.
    #[serde(rename = "type")]
    pub kind: InterfaceType,
    /// Human description.
    pub description: String,
    /// Member links, for bridges.
    #[serde(default)]
    pub links: Vec<String>,
    /// Whether attaching requires the user to authorize host changes.
    #[serde(default)]
    pub needs_authorization: bool,
}

impl NetworkInterfaceInfo {
    /// Create a network description; authorization is computed from the kind.
    pub fn new(id: impl Into<String>, kind: InterfaceType, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            description: description.into(),
            links: Vec::new(),
            needs_authorization: needs_authorization(kind),
        }
    }

    /// Set bridge members.
    pub fn with_links(mut self, links: Vec<String>) -> Self {
        self.links = links;
        self
    }
}

/// Whether bridging onto this kind of network changes host configuration.
pub fn needs_authorization(kind: InterfaceType) -> bool {
    !matches!(kind, InterfaceType::Bridge | InterfaceType::Switch)
}

/// Enumerate bridgeable host interfaces from a sysfs `class/net` directory.
///
/// Physical adapters (those with a `device` link) and bridges are listed;
/// loopback, tunnels and other purely virtual links are skipped.
pub fn host_interfaces(sys_class_net: &Path) -> Result<Vec<NetworkInterfaceInfo>> {
    let mut found = Vec::new();

    for entry in std::fs::read_dir(sys_class_net)? {
        let entry = entry?;
        let id = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if path.join("bridge").is_dir() {
            let mut links: Vec<String> = match std::fs::read_dir(path.join("brif")) {
                Ok(members) => members
                    .filter_map(|m| m.ok())
                    .map(|m| m.file_name().to_string_lossy().into_owned())
                    .collect(),
                Err(_) => Vec::new(),
            };
            links.sort();
            let description = if links.is_empty() {
                "Empty network bridge".to_string()
            } else {
                format!("Network bridge with {}", links.join(", "))
            };
            found.push(NetworkInterfaceInfo::new(id, InterfaceType::Bridge, description).with_links(links));
        } else if path.join("device").exists() {
            if path.join("wireless").is_dir() || path.join("phy80211").exists() {
                found.push(NetworkInterfaceInfo::new(id, InterfaceType::Wifi, "Wi-Fi device"));
            } else {
                found.push(NetworkInterfaceInfo::new(id, InterfaceType::Ethernet, "Ethernet device"));
            }
        }
    }

    found.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(found)
}
