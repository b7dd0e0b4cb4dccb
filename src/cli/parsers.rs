//! Shared CLI argument parsers.

use hvorch::vm::{MemorySize, NetworkInterface};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Parse a size string (e.g., "512M", "10G").
pub fn parse_size(s: &str) -> Result<MemorySize, String> {
    s.parse::<MemorySize>().map_err(|e| e.to_string())
}

/// Locally administered MAC address derived from `seed`.
///
/// Uses the QEMU/KVM OUI `52:54:00` so guests recognise it as virtual.
pub fn mac_for(seed: &str) -> String {
    let mut hasher = DefaultHasher::new();
    seed.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!("52:54:00:{:02x}:{:02x}:{:02x}", bytes[0], bytes[1], bytes[2])
}

/// Parse an interface specification.
///
/// Format: `ID[,mac=MAC][,mode=auto|manual]`. Without a MAC one is derived
/// from the instance and network names.
pub fn parse_interface(spec: &str, instance: &str) -> Result<NetworkInterface, String> {
    let mut parts = spec.split(',');
    let id = parts.next().unwrap_or_default().trim();
    if id.is_empty() {
        return Err(format!("missing network id in '{}'", spec));
    }

    let mut iface = NetworkInterface::new(id, mac_for(&format!("{}/{}", instance, id)));
    for part in parts {
        match part.split_once('=') {
            Some(("mac", mac)) => iface.mac_address = mac.to_lowercase(),
            Some(("mode", "auto")) => iface.auto_mode = true,
            Some(("mode", "manual")) => iface.auto_mode = false,
            _ => return Err(format!("invalid interface option '{}'", part)),
        }
    }
    Ok(iface)
}
