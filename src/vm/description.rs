//! Instance description types.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

/// A size in bytes, parsed from strings like `512M` or `10G`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct MemorySize(u64);

impl MemorySize {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * 1024;
    const GIB: u64 = 1024 * 1024 * 1024;

    /// Create from a byte count.
    pub const fn from_bytes(bytes: u64) -> Self {
        Self(bytes)
    }

    /// Create from mebibytes.
    pub const fn from_mib(mib: u64) -> Self {
        Self(mib * Self::MIB)
    }

    /// Create from gibibytes.
    pub const fn from_gib(gib: u64) -> Self {
        Self(gib * Self::GIB)
    }

    /// Size in bytes.
    pub fn in_bytes(&self) -> u64 {
        self.0
    }

    /// Size in whole kibibytes.
    pub fn in_kib(&self) -> u64 {
        self.0 / Self::KIB
    }

    /// Size in whole mebibytes.
    pub fn in_mib(&self) -> u64 {
        self.0 / Self::MIB
    }

    /// Size in whole gibibytes.
    pub fn in_gib(&self) -> u64 {
        self.0 / Self::GIB
    }

    /// Whether the size is zero.
    pub fn is_zero(&self) -> bool {
        self.0 == 0
    }
}

impl std::str::FromStr for MemorySize {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let split = s
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);

        let value: u64 = digits
            .parse()
            .map_err(|_| Error::Config(format!("invalid size: {:?}", s)))?;

        let multiplier = match unit.trim().to_ascii_uppercase().as_str() {
            "" | "B" => 1,
            "K" | "KB" | "KIB" => Self::KIB,
            "M" | "MB" | "MIB" => Self::MIB,
            "G" | "GB" | "GIB" => Self::GIB,
            other => {
                return Err(Error::Config(format!(
                    "invalid size unit {:?} in {:?}",
                    other, s
                )))
            }
        };

        value
            .checked_mul(multiplier)
            .map(Self)
            .ok_or_else(|| Error::Config(format!("size overflows: {:?}", s)))
    }
}

impl std::fmt::Display for MemorySize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.0 != 0 && self.0 % Self::GIB == 0 {
            write!(f, "{}GiB", self.in_gib())
        } else if self.0 != 0 && self.0 % Self::MIB == 0 {
            write!(f, "{}MiB", self.in_mib())
        } else if self.0 != 0 && self.0 % Self::KIB == 0 {
            write!(f, "{}KiB", self.in_kib())
        } else {
            write!(f, "{}B", self.0)
        }
    }
}

/// An additional network interface attached to an instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkInterface {
    /// Host network this interface is bridged to.
    pub id: String,
    /// Guest MAC address.
    pub mac_address: String,
    /// Whether cloud-init should configure it automatically.
    #[serde(default = "default_true")]
    pub auto_mode: bool,
}

fn default_true() -> bool {
    true
}

impl NetworkInterface {
    /// Create an automatically configured interface.
    pub fn new(id: impl Into<String>, mac_address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            mac_address: mac_address.into(),
            auto_mode: true,
        }
    }
}

/// A host directory mounted into the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Path on the host.
    pub source: PathBuf,
    /// Extra native arguments used to attach it.
    #[serde(default)]
    pub arguments: Vec<String>,
    /// Read-only mount.
    #[serde(default)]
    pub read_only: bool,
}

/// File name of a stored description inside an instance directory.
pub const DESCRIPTION_FILE: &str = "description.json";

/// Complete description of one instance.
///
/// Owned by the `VirtualMachine`; changed only through its resize and
/// network operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VirtualMachineDescription {
    /// Instance name.
    pub name: String,

    /// User to log in as over SSH.
    pub ssh_username: String,

    /// MAC address of the default interface.
    pub default_mac: String,

    /// Extra interfaces, in attachment order.
    #[serde(default)]
    pub extra_interfaces: Vec<NetworkInterface>,

    /// Number of vCPUs.
    pub num_cores: u32,

    /// Memory size.
    pub mem_size: MemorySize,

    /// Disk size.
    pub disk_space: MemorySize,

    /// Path to the disk image.
    pub image_path: PathBuf,

    /// Path to the cloud-init seed ISO.
    pub cloud_init_iso: PathBuf,

    /// Host mounts by guest target path.
    #[serde(default)]
    pub mounts: BTreeMap<String, MountSpec>,
}

impl VirtualMachineDescription {
    /// Create a builder for an instance.
    pub fn builder(name: impl Into<String>) -> DescriptionBuilder {
        DescriptionBuilder::new(name)
    }

    /// Read `dir/description.json`.
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(DESCRIPTION_FILE);
        let text = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        let desc: Self = serde_json::from_str(&text)?;
        desc.validate()?;
        Ok(desc)
    }

    /// Write `dir/description.json` atomically.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()?;
        file.persist(dir.join(DESCRIPTION_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Check the description is usable.
    pub fn validate(&self) -> Result<()> {
        validate_instance_name(&self.name)?;
        if self.num_cores == 0 {
            return Err(Error::Config("core count must be positive".into()));
        }
        if self.mem_size.is_zero() {
            return Err(Error::Config("memory size must be positive".into()));
        }
        if self.disk_space.is_zero() {
            return Err(Error::Config("disk size must be positive".into()));
        }
        Ok(())
    }
}

/// Validate an instance name.
///
/// Names end up in file paths, URLs and native command lines: only
/// alphanumerics and dashes, starting with a letter, at most 63 characters.
pub fn validate_instance_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 63
        && name.starts_with(|c: char| c.is_ascii_alphabetic())
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
        && !name.ends_with('-');

    if valid {
        Ok(())
    } else {
        Err(Error::Config(format!("invalid instance name: {:?}", name)))
    }
}

/// Builder for VirtualMachineDescription.
#[derive(Debug)]
pub struct DescriptionBuilder {
    desc: VirtualMachineDescription,
}

impl DescriptionBuilder {
    /// Create a new builder with defaults (1 core, 1GiB memory, 5GiB disk).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            desc: VirtualMachineDescription {
                name: name.into(),
                ssh_username: "ubuntu".to_string(),
                default_mac: String::new(),
                extra_interfaces: Vec::new(),
                num_cores: 1,
                mem_size: MemorySize::from_gib(1),
                disk_space: MemorySize::from_gib(5),
                image_path: PathBuf::new(),
                cloud_init_iso: PathBuf::new(),
                mounts: BTreeMap::new(),
            },
        }
    }

    /// Set the SSH username.
    pub fn ssh_username(mut self, username: impl Into<String>) -> Self {
        self.desc.ssh_username = username.into();
        self
    }

    /// Set the default MAC address.
    pub fn default_mac(mut self, mac: impl Into<String>) -> Self {
        self.desc.default_mac = mac.into();
        self
    }

    /// Add an extra network interface.
    pub fn interface(mut self, iface: NetworkInterface) -> Self {
        self.desc.extra_interfaces.push(iface);
        self
    }

    /// Set the number of cores.
    pub fn cores(mut self, cores: u32) -> Self {
        self.desc.num_cores = cores;
        self
    }

    /// Set the memory size.
    pub fn memory(mut self, size: MemorySize) -> Self {
        self.desc.mem_size = size;
        self
    }

    /// Set the disk size.
    pub fn disk(mut self, size: MemorySize) -> Self {
        self.desc.disk_space = size;
        self
    }

    /// Set the disk image path.
    pub fn image(mut self, path: impl Into<PathBuf>) -> Self {
        self.desc.image_path = path.into();
        self
    }

    /// Set the cloud-init ISO path.
    pub fn cloud_init_iso(mut self, path: impl Into<PathBuf>) -> Self {
        self.desc.cloud_init_iso = path.into();
        self
    }

    /// Add a mount.
    pub fn mount(mut self, target: impl Into<String>, spec: MountSpec) -> Self {
        self.desc.mounts.insert(target.into(), spec);
        self
    }

    /// Build the description.
    pub fn build(self) -> VirtualMachineDescription {
        self.desc
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_size_parsing() {
        assert_eq!("512M".parse::<MemorySize>().unwrap(), MemorySize::from_mib(512));
        assert_eq!("1G".parse::<MemorySize>().unwrap(), MemorySize::from_gib(1));
        assert_eq!("2GiB".parse::<MemorySize>().unwrap(), MemorySize::from_gib(2));
        assert_eq!("1024".parse::<MemorySize>().unwrap().in_bytes(), 1024);
        assert_eq!("64k".parse::<MemorySize>().unwrap().in_kib(), 64);

        assert!("".parse::<MemorySize>().is_err());
        assert!("12X".parse::<MemorySize>().is_err());
        assert!("G".parse::<MemorySize>().is_err());
    }

    #[test]
    fn test_memory_size_display() {
        assert_eq!(MemorySize::from_gib(3).to_string(), "3GiB");
        assert_eq!(MemorySize::from_mib(1536).to_string(), "1536MiB");
        assert_eq!(MemorySize::from_bytes(100).to_string(), "100B");
    }

    #[test]
    fn test_instance_name_validation() {
        assert!(validate_instance_name("primary").is_ok());
        assert!(validate_instance_name("web-01").is_ok());

        // Names end up in paths and command lines
        assert!(validate_instance_name("").is_err());
        assert!(validate_instance_name("../etc").is_err());
        assert!(validate_instance_name("1abc").is_err());
        assert!(validate_instance_name("trailing-").is_err());
        assert!(validate_instance_name(&"a".repeat(64)).is_err());
    }

    #[test]
    fn test_description_builder() {
        let desc = VirtualMachineDescription::builder("primary")
            .cores(2)
            .memory(MemorySize::from_gib(2))
            .disk(MemorySize::from_gib(10))
            .default_mac("52:54:00:aa:bb:cc")
            .interface(NetworkInterface::new("br0", "52:54:00:dd:ee:ff"))
            .image("/images/primary.img")
            .build();

        assert_eq!(desc.num_cores, 2);
        assert_eq!(desc.mem_size.in_mib(), 2048);
        assert_eq!(desc.extra_interfaces.len(), 1);
        assert_eq!(desc.ssh_username, "ubuntu");
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn test_description_rejects_zero_resources() {
        let desc = VirtualMachineDescription::builder("primary").cores(0).build();
        assert!(desc.validate().is_err());
    }

    #[test]
    fn test_interface_auto_mode_defaults_true() {
        let iface: NetworkInterface =
            serde_json::from_str(r#"{"id": "eth1", "mac_address": "52:54:00:00:00:01"}"#).unwrap();
        assert!(iface.auto_mode);
    }

    #[test]
    fn test_description_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let desc = VirtualMachineDescription::builder("primary")
            .cores(4)
            .default_mac("52:54:00:aa:bb:cc")
            .build();

        desc.save(dir.path()).unwrap();
        assert!(dir.path().join(DESCRIPTION_FILE).exists());
        assert_eq!(VirtualMachineDescription::load(dir.path()).unwrap(), desc);
    }

    #[test]
    fn test_missing_description_is_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = VirtualMachineDescription::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::ConfigLoad(_)));
    }
}
