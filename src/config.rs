//! Daemon configuration.
//!
//! Settings are read from `config.toml` in the platform config directory
//! (`~/.config/hvorch/config.toml` on Linux). A missing file means defaults.

use crate::error::{Error, Result};
use crate::vm::backend::BackendKind;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name for config and data directories.
const APP_NAME: &str = "hvorch";

/// Config file name.
const CONFIG_FILE: &str = "config.toml";

/// Operation timeouts.
///
/// Defaults are the values the lifecycle layer was designed around; all of
/// them can be overridden in the config file as human-readable durations
/// (`"5s"`, `"10m"`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// Grace period between SIGTERM and SIGKILL for a hypervisor process.
    #[serde(with = "humantime_serde")]
    pub process_kill: Duration,

    /// Bound for graceful shutdown and suspend to complete.
    #[serde(with = "humantime_serde")]
    pub graceful_shutdown: Duration,

    /// LXD wait for light operations (state changes).
    #[serde(with = "humantime_serde")]
    pub lxd_task_short: Duration,

    /// LXD wait for heavy operations (create, snapshot).
    #[serde(with = "humantime_serde")]
    pub lxd_task_long: Duration,

    /// First retry interval while waiting for the network after a resume.
    #[serde(with = "humantime_serde")]
    pub network_settle_retry: Duration,

    /// Backoff interval once the first retry window has elapsed.
    #[serde(with = "humantime_serde")]
    pub network_settle_backoff: Duration,

    /// Bound for `ensure_vm_is_running`.
    #[serde(with = "humantime_serde")]
    pub start: Duration,

    /// Bound for guest IP discovery.
    #[serde(with = "humantime_serde")]
    pub ip_discovery: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            process_kill: Duration::from_secs(5),
            graceful_shutdown: Duration::from_secs(300),
            lxd_task_short: Duration::from_secs(30),
            lxd_task_long: Duration::from_secs(600),
            network_settle_retry: Duration::from_secs(5),
            network_settle_backoff: Duration::from_secs(30),
            start: Duration::from_secs(300),
            ip_discovery: Duration::from_secs(120),
        }
    }
}

mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

/// QEMU backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QemuSettings {
    /// QEMU system emulator binary.
    pub binary: String,
    /// `qemu-img` binary.
    pub img_binary: String,
    /// Machine type passed to `-machine`.
    pub machine_type: String,
    /// Host bridge or tap helper network.
    pub bridge: String,
}

impl Default for QemuSettings {
    fn default() -> Self {
        let arch = match std::env::consts::ARCH {
            "aarch64" => "aarch64",
            "x86" => "i386",
            other => other,
        };
        Self {
            binary: format!("qemu-system-{}", arch),
            img_binary: "qemu-img".to_string(),
            machine_type: "q35".to_string(),
            bridge: "hvorchbr0".to_string(),
        }
    }
}

/// libvirt backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtSettings {
    /// Connection URI.
    pub uri: String,
    /// Network the default interface attaches to.
    pub network: String,
}

impl Default for LibvirtSettings {
    fn default() -> Self {
        Self {
            uri: "qemu:///system".to_string(),
            network: "default".to_string(),
        }
    }
}

/// Hyper-V backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperVSettings {
    /// PowerShell executable.
    pub powershell: String,
    /// Virtual switch for the default interface.
    pub switch: String,
}

impl Default for HyperVSettings {
    fn default() -> Self {
        Self {
            powershell: "powershell.exe".to_string(),
            switch: "Default Switch".to_string(),
        }
    }
}

/// VirtualBox backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualBoxSettings {
    /// VBoxManage executable.
    pub vboxmanage: String,
}

impl Default for VirtualBoxSettings {
    fn default() -> Self {
        Self {
            vboxmanage: "VBoxManage".to_string(),
        }
    }
}

/// LXD backend settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LxdSettings {
    /// REST endpoint, e.g. `https://127.0.0.1:8443/1.0`.
    pub url: String,
    /// Client certificate (PEM).
    pub client_cert: Option<PathBuf>,
    /// Client key (PEM).
    pub client_key: Option<PathBuf>,
    /// LXD project.
    pub project: String,
    /// Accept self-signed server certificates.
    pub accept_invalid_certs: bool,
}

impl Default for LxdSettings {
    fn default() -> Self {
        Self {
            url: "https://127.0.0.1:8443/1.0".to_string(),
            client_cert: None,
            client_key: None,
            project: "default".to_string(),
            accept_invalid_certs: true,
        }
    }
}

/// Guest SSH settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    /// Private key used for every guest.
    pub private_key: Option<PathBuf>,
    /// `ssh` client executable.
    pub client: String,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            private_key: None,
            client: "ssh".to_string(),
        }
    }
}

/// Global configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Configuration format version.
    pub version: u8,

    /// Selected backend.
    pub backend: BackendKind,

    /// Where instance data and the state database live.
    pub data_dir: PathBuf,

    /// Operation timeouts.
    pub timeouts: Timeouts,

    /// QEMU settings.
    pub qemu: QemuSettings,

    /// libvirt settings.
    pub libvirt: LibvirtSettings,

    /// Hyper-V settings.
    pub hyperv: HyperVSettings,

    /// VirtualBox settings.
    pub virtualbox: VirtualBoxSettings,

    /// LXD settings.
    pub lxd: LxdSettings,

    /// SSH settings.
    pub ssh: SshSettings,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .or_else(dirs::data_dir)
            .unwrap_or_else(|| PathBuf::from("/var/lib"))
            .join(APP_NAME);

        Self {
            version: 1,
            backend: BackendKind::platform_default(),
            data_dir,
            timeouts: Timeouts::default(),
            qemu: QemuSettings::default(),
            libvirt: LibvirtSettings::default(),
            hyperv: HyperVSettings::default(),
            virtualbox: VirtualBoxSettings::default(),
            lxd: LxdSettings::default(),
            ssh: SshSettings::default(),
        }
    }
}

impl DaemonConfig {
    /// Default location of the config file.
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::ConfigLoad("could not determine config directory".into()))?;
        Ok(dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Load configuration from the default location.
    ///
    /// If the configuration file doesn't exist, returns the default configuration.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path()?)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no config file, using defaults");
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a specific file.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        std::fs::write(path, text).map_err(|e| Error::ConfigSave(e.to_string()))
    }

    /// Directory holding per-instance files.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.data_dir.join("instances").join(name)
    }

    /// Path of the state database.
    pub fn state_db_path(&self) -> PathBuf {
        self.data_dir.join("state.redb")
    }
}
