//! Hypervisor backend adapters.
//!
//! Every backend implements [`BackendDriver`], one flat interface that
//! translates abstract lifecycle operations into native calls and maps
//! native status back to [`VmState`]. Optional capabilities are declared up
//! front through [`Capabilities`] so the daemon can gate an operation before
//! any native call is made.
//!
//! Process-wide native handles (the LXD HTTP client, the libvirt
//! connection, the command runner) are built once into [`BackendServices`]
//! and shared read-only across instances.

pub mod hyperv;
pub mod libvirt;
pub mod lxd;
pub mod qemu;
pub mod virtualbox;

use crate::config::DaemonConfig;
use crate::error::{CapabilityError, Error, Result};
use crate::network::NetworkInterfaceInfo;
use crate::process::{CommandRunner, SystemCommandRunner};
use crate::vm::description::{MemorySize, NetworkInterface, VirtualMachineDescription};
use crate::vm::snapshot::Snapshot;
use crate::vm::state::{ShutdownPolicy, VmState};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::time::Duration;

pub use hyperv::HyperVBackend;
pub use libvirt::{LibvirtBackend, LibvirtConnection, VirshConnection};
pub use lxd::{HttpLxdClient, LxdBackend, LxdClient};
pub use qemu::{QemuBackend, QemuLauncher, SystemQemuLauncher};
pub use virtualbox::VirtualBoxBackend;

/// Supported virtualization technologies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// QEMU process driven over QMP.
    Qemu,
    /// libvirt domains.
    Libvirt,
    /// Hyper-V through PowerShell.
    #[serde(rename = "hyperv")]
    HyperV,
    /// VirtualBox through VBoxManage.
    #[serde(rename = "virtualbox")]
    VirtualBox,
    /// LXD REST API.
    Lxd,
}

impl BackendKind {
    /// All backends.
    pub const ALL: [BackendKind; 5] = [
        BackendKind::Qemu,
        BackendKind::Libvirt,
        BackendKind::HyperV,
        BackendKind::VirtualBox,
        BackendKind::Lxd,
    ];

    /// Backend name as used in configuration.
    pub fn name(&self) -> &'static str {
        match self {
            BackendKind::Qemu => "qemu",
            BackendKind::Libvirt => "libvirt",
            BackendKind::HyperV => "hyperv",
            BackendKind::VirtualBox => "virtualbox",
            BackendKind::Lxd => "lxd",
        }
    }

    /// Default backend for the host platform.
    pub fn platform_default() -> Self {
        if cfg!(target_os = "windows") {
            BackendKind::HyperV
        } else {
            BackendKind::Qemu
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        BackendKind::ALL
            .into_iter()
            .find(|k| k.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| Error::Config(format!("unknown backend: {}", s)))
    }
}

/// Optional operations a backend may provide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// Suspend to disk.
    Suspend,
    /// Snapshot capture/restore/delete.
    Snapshots,
    /// Instance cloning.
    Clone,
    /// CPU and memory changes on a running instance.
    LiveResize,
    /// Attaching interfaces to a running instance.
    NetworkHotAdd,
}

impl Capability {
    /// Operation name used in errors.
    pub fn operation(&self) -> &'static str {
        match self {
            Capability::Suspend => "suspend",
            Capability::Snapshots => "snapshots",
            Capability::Clone => "clone",
            Capability::LiveResize => "live resize",
            Capability::NetworkHotAdd => "network hot-add",
        }
    }
}

/// Capability set of one backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities {
    /// Suspend to disk.
    pub suspend: bool,
    /// Snapshots.
    pub snapshots: bool,
    /// Cloning.
    pub clone: bool,
    /// Live CPU/memory changes.
    pub live_resize: bool,
    /// Live interface attach.
    pub network_hot_add: bool,
}

impl Capabilities {
    /// Whether `capability` is present.
    pub fn has(&self, capability: Capability) -> bool {
        match capability {
            Capability::Suspend => self.suspend,
            Capability::Snapshots => self.snapshots,
            Capability::Clone => self.clone,
            Capability::LiveResize => self.live_resize,
            Capability::NetworkHotAdd => self.network_hot_add,
        }
    }
}

/// Asynchronous notification from a backend's native layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendEvent {
    /// Native process or domain came up.
    Started,
    /// Execution resumed from saved state.
    Resumed,
    /// Guest-initiated reset or reboot.
    Restarting,
    /// Guest is powering down.
    PoweringDown,
    /// Native process exited.
    Exited {
        /// Exit code if known.
        code: Option<i32>,
    },
    /// Native layer reported an error.
    Error(String),
}

/// Everything a backend needs to boot or resume an instance.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest<'a> {
    /// Current description.
    pub description: &'a VirtualMachineDescription,
    /// Resuming from a suspended state.
    pub resume: bool,
    /// Metadata the backend saved at suspend time (empty object if none).
    pub metadata: &'a Value,
}

/// Translates lifecycle operations into native calls.
///
/// `current_state` returning `Err` means the backend could not be queried
/// (transient); the orchestrator maps that to [`VmState::Unknown`]. Every
/// other `Err` is a foreground failure carrying the native diagnostic.
pub trait BackendDriver: Send + Sync {
    /// Which backend this is.
    fn kind(&self) -> BackendKind;

    /// Optional capabilities.
    fn capabilities(&self) -> Capabilities;

    /// Fail unless `capability` is present.
    fn require(&self, capability: Capability) -> std::result::Result<(), CapabilityError> {
        if self.capabilities().has(capability) {
            Ok(())
        } else {
            Err(CapabilityError {
                backend: self.kind().name(),
                operation: capability.operation(),
            })
        }
    }

    /// Fail unless suspend is supported.
    fn require_suspend_support(&self) -> std::result::Result<(), CapabilityError> {
        self.require(Capability::Suspend)
    }

    /// Fail unless snapshots are supported.
    fn require_snapshots_support(&self) -> std::result::Result<(), CapabilityError> {
        self.require(Capability::Snapshots)
    }

    /// Fail unless cloning is supported.
    fn require_clone_support(&self) -> std::result::Result<(), CapabilityError> {
        self.require(Capability::Clone)
    }

    /// Boot or resume.
    fn start(&self, request: &StartRequest<'_>) -> Result<()>;

    /// Stop, blocking until the native side confirms or `timeout` elapses.
    ///
    /// A graceful stop that does not complete in time returns
    /// [`Error::Timeout`]. A forced stop of a suspended instance discards
    /// the saved state.
    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()>;

    /// Suspend to disk, blocking until complete.
    fn suspend(&self) -> Result<()>;

    /// Live native status.
    fn current_state(&self) -> Result<VmState>;

    /// Apply a new core count. `running` tells whether the instance is up.
    fn update_cpus(&self, num_cores: u32, running: bool) -> Result<()>;

    /// Apply a new memory size.
    fn resize_memory(&self, size: MemorySize, running: bool) -> Result<()>;

    /// Apply a new disk size (never smaller than the current one).
    fn resize_disk(&self, size: MemorySize, running: bool) -> Result<()>;

    /// Attach an extra interface. `index` is its position among the extras.
    fn add_network_interface(
        &self,
        index: usize,
        default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()>;

    /// Address the daemon should SSH to, if known yet.
    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>>;

    /// Drop addresses that are not reachable from the host.
    fn filter_ipv4(&self, addresses: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
        addresses
    }

    /// Guest SSH port.
    fn ssh_port(&self) -> u16 {
        22
    }

    /// State to persist so the instance can be resumed after a daemon
    /// restart. `Null` if there is nothing to keep.
    fn metadata(&self) -> Value {
        Value::Null
    }

    /// Pick up a native instance left running by a previous daemon, using
    /// the metadata last persisted for it.
    fn reattach(&self, _metadata: &Value) -> Result<()> {
        Ok(())
    }

    /// Hand over the asynchronous event stream, if the backend has one.
    ///
    /// Returns `Some` at most once.
    fn take_events(&self) -> Option<Receiver<BackendEvent>> {
        None
    }

    /// Capture backend state for a new snapshot.
    fn capture_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Restore backend state from a snapshot.
    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Delete backend state of a snapshot.
    fn erase_snapshot(&self, snapshot: &Snapshot) -> Result<()>;

    /// Host networks instances can be bridged to.
    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>>;
}

/// Interval between native status polls while waiting for a transition.
pub(crate) const STATE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Poll `probe` until it reports `true` or `timeout` elapses.
pub(crate) fn wait_for<F>(operation: &str, timeout: Duration, mut probe: F) -> Result<()>
where
    F: FnMut() -> Result<bool>,
{
    crate::utils::try_action_for(
        operation,
        timeout,
        crate::utils::RetrySchedule::every(STATE_POLL_INTERVAL),
        || {
            Ok(if probe()? {
                crate::utils::TimeoutAction::Done(())
            } else {
                crate::utils::TimeoutAction::Retry
            })
        },
    )
}

/// Native handles shared by all instances of a daemon.
#[derive(Clone)]
pub struct BackendServices {
    /// Runner for CLI-driven backends.
    pub runner: Arc<dyn CommandRunner>,
    /// QEMU process launcher.
    pub qemu: Arc<dyn QemuLauncher>,
    /// libvirt connection.
    pub libvirt: Arc<dyn LibvirtConnection>,
    /// LXD client, if configured.
    pub lxd: Option<Arc<dyn LxdClient>>,
}

impl BackendServices {
    /// Build the services the configured backend needs.
    pub fn from_config(config: &DaemonConfig) -> Result<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemCommandRunner);
        let libvirt: Arc<dyn LibvirtConnection> =
            Arc::new(VirshConnection::new(config.libvirt.uri.clone(), Arc::clone(&runner)));
        let qemu: Arc<dyn QemuLauncher> = Arc::new(SystemQemuLauncher::new(config.qemu.binary.clone()));

        let lxd: Option<Arc<dyn LxdClient>> = if config.backend == BackendKind::Lxd {
            Some(Arc::new(HttpLxdClient::new(&config.lxd, &config.timeouts)?))
        } else {
            None
        };

        Ok(Self {
            runner,
            qemu,
            libvirt,
            lxd,
        })
    }
}

/// Create the configured backend for one instance.
pub fn create(
    config: &DaemonConfig,
    services: &BackendServices,
    desc: &VirtualMachineDescription,
) -> Result<Box<dyn BackendDriver>> {
    tracing::debug!(vm = %desc.name, backend = %config.backend, "creating backend");

    let backend: Box<dyn BackendDriver> = match config.backend {
        BackendKind::Qemu => Box::new(QemuBackend::new(
            desc,
            &config.qemu,
            &config.timeouts,
            Arc::clone(&services.qemu),
            Arc::clone(&services.runner),
        )),
        BackendKind::Libvirt => Box::new(LibvirtBackend::new(
            desc,
            &config.libvirt,
            Arc::clone(&services.libvirt),
        )?),
        BackendKind::HyperV => Box::new(HyperVBackend::new(
            desc,
            &config.hyperv,
            Arc::clone(&services.runner),
        )?),
        BackendKind::VirtualBox => Box::new(VirtualBoxBackend::new(
            desc,
            &config.virtualbox,
            Arc::clone(&services.runner),
        )?),
        BackendKind::Lxd => {
            let client = services
                .lxd
                .as_ref()
                .ok_or_else(|| Error::Config("lxd backend selected but no lxd client".into()))?;
            Box::new(LxdBackend::new(desc, &config.timeouts, Arc::clone(client))?)
        }
    };
    Ok(backend)
}

/// Capabilities per backend.
pub fn capabilities_of(kind: BackendKind) -> Capabilities {
    match kind {
        BackendKind::Qemu => Capabilities {
            suspend: true,
            snapshots: true,
            clone: true,
            live_resize: false,
            network_hot_add: false,
        },
        BackendKind::Libvirt => Capabilities {
            suspend: true,
            snapshots: true,
            clone: false,
            live_resize: true,
            network_hot_add: true,
        },
        BackendKind::HyperV => Capabilities {
            suspend: true,
            snapshots: true,
            clone: false,
            live_resize: true,
            network_hot_add: true,
        },
        BackendKind::VirtualBox => Capabilities {
            suspend: true,
            snapshots: true,
            clone: false,
            live_resize: false,
            network_hot_add: false,
        },
        BackendKind::Lxd => Capabilities {
            suspend: false,
            snapshots: false,
            clone: false,
            live_resize: true,
            network_hot_add: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_kind_parsing() {
        assert_eq!("qemu".parse::<BackendKind>().unwrap(), BackendKind::Qemu);
        assert_eq!("HyperV".parse::<BackendKind>().unwrap(), BackendKind::HyperV);
        assert_eq!("virtualbox".parse::<BackendKind>().unwrap(), BackendKind::VirtualBox);
        assert!("xen".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_backend_kind_serde_names() {
        for kind in BackendKind::ALL {
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.name()));
        }
    }

    #[test]
    fn test_capability_table() {
        // (backend, suspend, snapshots, clone)
        let cases = [
            (BackendKind::Qemu, true, true, true),
            (BackendKind::Libvirt, true, true, false),
            (BackendKind::HyperV, true, true, false),
            (BackendKind::VirtualBox, true, true, false),
            (BackendKind::Lxd, false, false, false),
        ];
        for (kind, suspend, snapshots, clone) in cases {
            let caps = capabilities_of(kind);
            assert_eq!(caps.has(Capability::Suspend), suspend, "{} suspend", kind);
            assert_eq!(caps.has(Capability::Snapshots), snapshots, "{} snapshots", kind);
            assert_eq!(caps.has(Capability::Clone), clone, "{} clone", kind);
        }
    }
}
