//! cloud-init seed data.
//!
//! When an interface is added to an instance, the guest learns about it on
//! the next boot through a rewritten netplan `network-config` and a new
//! `instance-id` in `meta-data` (cloud-init only re-applies network config
//! when the instance id changes).

use crate::error::{Error, Result};
use crate::vm::description::VirtualMachineDescription;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Network config file name.
pub const NETWORK_CONFIG_FILE: &str = "network-config";

/// Meta-data file name.
pub const META_DATA_FILE: &str = "meta-data";

/// Route metric for extra interfaces, so the default NIC keeps the default route.
const EXTRA_ROUTE_METRIC: u32 = 200;

/// Rewrites the cloud-init seed of an instance.
pub trait CloudInitConfigurator: Send + Sync {
    /// Regenerate the network config from the description and bump the
    /// instance id.
    fn update_network_config(&self, desc: &VirtualMachineDescription) -> Result<()>;

    /// Current cloud-init instance id.
    fn instance_id(&self, desc: &VirtualMachineDescription) -> Result<String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MatchMac {
    macaddress: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DhcpOverrides {
    #[serde(rename = "route-metric")]
    route_metric: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct Ethernet {
    #[serde(rename = "match")]
    match_mac: MatchMac,
    dhcp4: bool,
    #[serde(rename = "dhcp4-overrides", skip_serializing_if = "Option::is_none")]
    dhcp4_overrides: Option<DhcpOverrides>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    optional: bool,
}

/// netplan v2 document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkConfig {
    version: u8,
    ethernets: BTreeMap<String, Ethernet>,
}

impl NetworkConfig {
    /// Build the config for a description: the default NIC plus every
    /// automatically configured extra interface.
    pub fn for_description(desc: &VirtualMachineDescription) -> Self {
        let mut ethernets = BTreeMap::new();

        ethernets.insert(
            "default".to_string(),
            Ethernet {
                match_mac: MatchMac {
                    macaddress: desc.default_mac.clone(),
                },
                dhcp4: true,
                dhcp4_overrides: None,
                optional: false,
            },
        );

        for (i, iface) in desc.extra_interfaces.iter().enumerate() {
            if !iface.auto_mode {
                continue;
            }
            ethernets.insert(
                format!("extra{}", i),
                Ethernet {
                    match_mac: MatchMac {
                        macaddress: iface.mac_address.clone(),
                    },
                    dhcp4: true,
                    dhcp4_overrides: Some(DhcpOverrides {
                        route_metric: EXTRA_ROUTE_METRIC,
                    }),
                    optional: true,
                },
            );
        }

        Self {
            version: 2,
            ethernets,
        }
    }

    /// Interface names in the document.
    pub fn interface_names(&self) -> impl Iterator<Item = &str> {
        self.ethernets.keys().map(String::as_str)
    }

    /// Render as YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct MetaData {
    #[serde(rename = "instance-id")]
    instance_id: String,
    #[serde(rename = "local-hostname", default, skip_serializing_if = "Option::is_none")]
    local_hostname: Option<String>,
}

/// Next instance id: `name` -> `name-e1` -> `name-e2` ...
pub fn next_instance_id(current: &str) -> String {
    if let Some((base, n)) = current.rsplit_once("-e") {
        if let Ok(n) = n.parse::<u32>() {
            return format!("{}-e{}", base, n + 1);
        }
    }
    format!("{}-e1", current)
}

/// [`CloudInitConfigurator`] writing seed files under `<root>/<name>/cloud-init/`.
#[derive(Debug, Clone)]
pub struct SeedDirConfigurator {
    root: PathBuf,
}

impl SeedDirConfigurator {
    /// Seeds live under `root/<instance>/cloud-init`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Seed directory of an instance.
    pub fn seed_dir(&self, name: &str) -> PathBuf {
        self.root.join(name).join("cloud-init")
    }

    fn read_meta(&self, dir: &Path, name: &str) -> Result<MetaData> {
        let path = dir.join(META_DATA_FILE);
        if !path.exists() {
            return Ok(MetaData {
                instance_id: name.to_string(),
                local_hostname: Some(name.to_string()),
            });
        }
        let text = std::fs::read_to_string(&path)?;
        serde_yaml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }
}

impl CloudInitConfigurator for SeedDirConfigurator {
    fn update_network_config(&self, desc: &VirtualMachineDescription) -> Result<()> {
        let dir = self.seed_dir(&desc.name);
        std::fs::create_dir_all(&dir)?;

        let network = NetworkConfig::for_description(desc);
        std::fs::write(dir.join(NETWORK_CONFIG_FILE), network.to_yaml()?)?;

        let mut meta = self.read_meta(&dir, &desc.name)?;
        meta.instance_id = next_instance_id(&meta.instance_id);
        let text = serde_yaml::to_string(&meta).map_err(|e| Error::Config(e.to_string()))?;
        std::fs::write(dir.join(META_DATA_FILE), text)?;

        tracing::debug!(
            vm = %desc.name,
            instance_id = %meta.instance_id,
            interfaces = desc.extra_interfaces.len() + 1,
            "rewrote cloud-init network config"
        );
        Ok(())
    }

    fn instance_id(&self, desc: &VirtualMachineDescription) -> Result<String> {
        let dir = self.seed_dir(&desc.name);
        Ok(self.read_meta(&dir, &desc.name)?.instance_id)
    }
}
