//! libvirt backend.
//!
//! Domain operations go through [`LibvirtConnection`]. The shipped
//! implementation drives `virsh` against one connection URI, shared by all
//! instances of the daemon.

use super::{wait_for, BackendDriver, BackendKind, Capabilities, StartRequest};
use crate::config::LibvirtSettings;
use crate::error::{Error, Result};
use crate::network::{host_interfaces, NetworkInterfaceInfo};
use crate::process::{args, CommandRunner};
use crate::vm::description::{MemorySize, NetworkInterface, VirtualMachineDescription};
use crate::vm::snapshot::Snapshot;
use crate::vm::state::{ShutdownPolicy, VmState};
use std::io::Write;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Domain-level libvirt calls, keyed by domain name.
pub trait LibvirtConnection: Send + Sync {
    /// Whether the domain is defined.
    fn domain_exists(&self, name: &str) -> Result<bool>;
    /// Define a persistent domain from XML.
    fn define(&self, xml: &str) -> Result<()>;
    /// Native state string (`running`, `shut off`, ...).
    fn state(&self, name: &str) -> Result<String>;
    /// Whether a managed save image exists.
    fn has_managed_save(&self, name: &str) -> Result<bool>;
    /// Boot, or restore from managed save.
    fn start(&self, name: &str) -> Result<()>;
    /// ACPI shutdown request.
    fn shutdown(&self, name: &str) -> Result<()>;
    /// Hard power off.
    fn destroy(&self, name: &str) -> Result<()>;
    /// Save memory to disk and stop.
    fn managed_save(&self, name: &str) -> Result<()>;
    /// Drop the managed save image.
    fn managed_save_remove(&self, name: &str) -> Result<()>;
    /// Set the vcpu count in the persistent config, and live if `live`.
    /// The configured maximum is raised first when the count exceeds it; a
    /// count above the live maximum only lands in the config.
    fn set_vcpus(&self, name: &str, count: u32, live: bool) -> Result<()>;
    /// Set memory in KiB.
    fn set_memory(&self, name: &str, kib: u64, live: bool) -> Result<()>;
    /// Grow the primary disk.
    fn resize_disk(&self, name: &str, image: &std::path::Path, bytes: u64, live: bool) -> Result<()>;
    /// Attach a bridged virtio interface.
    fn attach_interface(&self, name: &str, bridge: &str, mac: &str, live: bool) -> Result<()>;
    /// IPv4 address leased to the interface with `mac`.
    fn lease_ipv4(&self, name: &str, mac: &str) -> Result<Option<Ipv4Addr>>;
    /// Create an internal snapshot.
    fn snapshot_create(&self, name: &str, tag: &str) -> Result<()>;
    /// Revert to an internal snapshot.
    fn snapshot_revert(&self, name: &str, tag: &str) -> Result<()>;
    /// Delete an internal snapshot.
    fn snapshot_delete(&self, name: &str, tag: &str) -> Result<()>;
}

/// [`LibvirtConnection`] over the `virsh` CLI.
pub struct VirshConnection {
    uri: String,
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl VirshConnection {
    /// Connect to `uri` (e.g. `qemu:///system`).
    pub fn new(uri: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            uri: uri.into(),
            binary: "virsh".to_string(),
            runner,
        }
    }

    fn virsh(&self, command: &[&str]) -> Result<String> {
        let mut full = args(["-c", self.uri.as_str()]);
        full.extend(command.iter().map(|s| s.to_string()));
        self.runner.run_checked(&self.binary, &full)
    }

    /// `vcpucount --maximum` for `scope` (`--config` or `--live`).
    fn max_vcpus(&self, name: &str, scope: &str) -> Result<u32> {
        let output = self.virsh(&["vcpucount", name, "--maximum", scope])?;
        output.trim().parse().map_err(|_| {
            Error::command_failed(
                "virsh vcpucount",
                format!("unexpected output {:?}", output.trim()),
            )
        })
    }

    fn scope(live: bool) -> &'static [&'static str] {
        if live {
            &["--config", "--live"]
        } else {
            &["--config"]
        }
    }
}

impl LibvirtConnection for VirshConnection {
    fn domain_exists(&self, name: &str) -> Result<bool> {
        let full = args(["-c", self.uri.as_str(), "dominfo", name]);
        Ok(self.runner.run(&self.binary, &full)?.success())
    }

    fn define(&self, xml: &str) -> Result<()> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(xml.as_bytes())?;
        let path = file.path().display().to_string();
        self.virsh(&["define", path.as_str()])?;
        Ok(())
    }

    fn state(&self, name: &str) -> Result<String> {
        Ok(self.virsh(&["domstate", name])?.trim().to_string())
    }

    fn has_managed_save(&self, name: &str) -> Result<bool> {
        let info = self.virsh(&["dominfo", name])?;
        Ok(info
            .lines()
            .filter_map(|l| l.split_once(':'))
            .any(|(k, v)| k.trim() == "Managed save" && v.trim() == "yes"))
    }

    fn start(&self, name: &str) -> Result<()> {
        self.virsh(&["start", name]).map(drop)
    }

    fn shutdown(&self, name: &str) -> Result<()> {
        self.virsh(&["shutdown", name]).map(drop)
    }

    fn destroy(&self, name: &str) -> Result<()> {
        self.virsh(&["destroy", name]).map(drop)
    }

    fn managed_save(&self, name: &str) -> Result<()> {
        self.virsh(&["managedsave", name]).map(drop)
    }

    fn managed_save_remove(&self, name: &str) -> Result<()> {
        self.virsh(&["managedsave-remove", name]).map(drop)
    }

    fn set_vcpus(&self, name: &str, count: u32, live: bool) -> Result<()> {
        let wanted = count.to_string();
        if count > self.max_vcpus(name, "--config")? {
            self.virsh(&["setvcpus", name, wanted.as_str(), "--maximum", "--config"])?;
        }

        let live = if live && count > self.max_vcpus(name, "--live")? {
            tracing::info!(
                vm = %name,
                count,
                "vcpu count exceeds the live maximum, applies on next start"
            );
            false
        } else {
            live
        };

        let mut cmd = vec!["setvcpus", name, wanted.as_str()];
        cmd.extend_from_slice(Self::scope(live));
        self.virsh(&cmd).map(drop)
    }

    fn set_memory(&self, name: &str, kib: u64, live: bool) -> Result<()> {
        let size = format!("{}KiB", kib);
        self.virsh(&["setmaxmem", name, size.as_str(), "--config"])?;
        let mut cmd = vec!["setmem", name, size.as_str()];
        cmd.extend_from_slice(Self::scope(live));
        self.virsh(&cmd).map(drop)
    }

    fn resize_disk(&self, name: &str, image: &std::path::Path, bytes: u64, live: bool) -> Result<()> {
        if live {
            let size = format!("{}B", bytes);
            self.virsh(&["blockresize", name, "vda", size.as_str()]).map(drop)
        } else {
            let image = image.display().to_string();
            self.runner
                .run_checked("qemu-img", &args(["resize", image.as_str(), bytes.to_string().as_str()]))
                .map(drop)
        }
    }

    fn attach_interface(&self, name: &str, bridge: &str, mac: &str, live: bool) -> Result<()> {
        let mut cmd = vec![
            "attach-interface", name, "bridge", bridge, "--mac", mac, "--model", "virtio",
        ];
        cmd.extend_from_slice(Self::scope(live));
        self.virsh(&cmd).map(drop)
    }

    fn lease_ipv4(&self, name: &str, mac: &str) -> Result<Option<Ipv4Addr>> {
        let table = self.virsh(&["domifaddr", name, "--source", "lease"])?;
        Ok(parse_domifaddr(&table, mac))
    }

    fn snapshot_create(&self, name: &str, tag: &str) -> Result<()> {
        self.virsh(&["snapshot-create-as", name, tag]).map(drop)
    }

    fn snapshot_revert(&self, name: &str, tag: &str) -> Result<()> {
        self.virsh(&["snapshot-revert", name, tag]).map(drop)
    }

    fn snapshot_delete(&self, name: &str, tag: &str) -> Result<()> {
        self.virsh(&["snapshot-delete", name, tag]).map(drop)
    }
}

/// Find the IPv4 lease for `mac` in `virsh domifaddr` output.
pub fn parse_domifaddr(table: &str, mac: &str) -> Option<Ipv4Addr> {
    table
        .lines()
        .map(|l| l.split_whitespace().collect::<Vec<_>>())
        .filter(|cols| cols.len() >= 4)
        .filter(|cols| cols[1].eq_ignore_ascii_case(mac) && cols[2] == "ipv4")
        .find_map(|cols| cols[3].split('/').next()?.parse().ok())
}

/// Map `virsh domstate` output.
pub fn map_domain_state(native: &str, managed_save: bool) -> VmState {
    match native.trim() {
        "running" | "idle" | "blocked" | "in shutdown" => VmState::Running,
        "paused" | "pmsuspended" => VmState::Suspended,
        "shut off" | "crashed" if managed_save => VmState::Suspended,
        "shut off" | "crashed" => VmState::Off,
        _ => VmState::Unknown,
    }
}

/// Render the persistent domain definition.
pub fn domain_xml(desc: &VirtualMachineDescription, network: &str) -> String {
    let mut interfaces = format!(
        "    <interface type='network'>\n      <source network='{}'/>\n      <mac address='{}'/>\n      <model type='virtio'/>\n    </interface>\n",
        network, desc.default_mac
    );
    for iface in &desc.extra_interfaces {
        interfaces.push_str(&format!(
            "    <interface type='bridge'>\n      <source bridge='{}'/>\n      <mac address='{}'/>\n      <model type='virtio'/>\n    </interface>\n",
            iface.id, iface.mac_address
        ));
    }

    format!(
        "<domain type='kvm'>
  <name>{name}</name>
  <memory unit='KiB'>{mem}</memory>
  <currentMemory unit='KiB'>{mem}</currentMemory>
  <vcpu placement='static'>{cpus}</vcpu>
  <os>
    <type arch='{arch}'>hvm</type>
    <boot dev='hd'/>
  </os>
  <features>
    <acpi/>
    <apic/>
  </features>
  <cpu mode='host-passthrough'/>
  <devices>
    <disk type='file' device='disk'>
      <driver name='qemu' type='qcow2' discard='unmap'/>
      <source file='{image}'/>
      <target dev='vda' bus='virtio'/>
    </disk>
    <disk type='file' device='cdrom'>
      <driver name='qemu' type='raw'/>
      <source file='{iso}'/>
      <target dev='hdc' bus='sata'/>
      <readonly/>
    </disk>
{interfaces}    <serial type='pty'>
      <target port='0'/>
    </serial>
    <console type='pty'>
      <target type='serial' port='0'/>
    </console>
  </devices>
</domain>
",
        name = desc.name,
        mem = desc.mem_size.in_kib(),
        cpus = desc.num_cores,
        arch = std::env::consts::ARCH,
        image = desc.image_path.display(),
        iso = desc.cloud_init_iso.display(),
        interfaces = interfaces,
    )
}

/// libvirt adapter.
pub struct LibvirtBackend {
    name: String,
    default_mac: String,
    image_path: PathBuf,
    sys_class_net: PathBuf,
    connection: Arc<dyn LibvirtConnection>,
}

impl LibvirtBackend {
    /// Attach to the domain, defining it first if needed.
    pub fn new(
        desc: &VirtualMachineDescription,
        settings: &LibvirtSettings,
        connection: Arc<dyn LibvirtConnection>,
    ) -> Result<Self> {
        if !connection.domain_exists(&desc.name)? {
            tracing::info!(vm = %desc.name, uri = %settings.uri, "defining libvirt domain");
            connection.define(&domain_xml(desc, &settings.network))?;
        }

        Ok(Self {
            name: desc.name.clone(),
            default_mac: desc.default_mac.clone(),
            image_path: desc.image_path.clone(),
            sys_class_net: PathBuf::from("/sys/class/net"),
            connection,
        })
    }

    fn failed(&self, operation: &str, e: Error) -> Error {
        Error::operation_failed(operation, &self.name, e.diagnostic())
    }

    fn is_running(&self) -> Result<bool> {
        Ok(self.current_state()?.is_running())
    }
}

impl BackendDriver for LibvirtBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Libvirt
    }

    fn capabilities(&self) -> Capabilities {
        super::capabilities_of(BackendKind::Libvirt)
    }

    fn start(&self, request: &StartRequest<'_>) -> Result<()> {
        if request.resume {
            tracing::debug!(vm = %self.name, "restoring from managed save");
        }
        self.connection
            .start(&self.name)
            .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))
    }

    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()> {
        let state = self.current_state()?;

        match (state, policy) {
            (s, _) if s.is_stopped() => return Ok(()),
            (VmState::Suspended, ShutdownPolicy::Forced) => {
                return self
                    .connection
                    .managed_save_remove(&self.name)
                    .map_err(|e| self.failed("discard saved state", e));
            }
            (VmState::Suspended, ShutdownPolicy::Graceful) => return Ok(()),
            (VmState::Starting, _) | (_, ShutdownPolicy::Forced) => {
                self.connection
                    .destroy(&self.name)
                    .map_err(|e| self.failed("power off", e))?;
            }
            (_, ShutdownPolicy::Graceful) => {
                self.connection
                    .shutdown(&self.name)
                    .map_err(|e| self.failed("shutdown", e))?;
            }
        }

        wait_for("libvirt domain shutdown", timeout, || {
            Ok(self.current_state()?.is_stopped())
        })
    }

    fn suspend(&self) -> Result<()> {
        self.connection
            .managed_save(&self.name)
            .map_err(|e| self.failed("suspend", e))
    }

    fn current_state(&self) -> Result<VmState> {
        let native = self.connection.state(&self.name)?;
        let saved = native.starts_with("shut off") && self.connection.has_managed_save(&self.name)?;
        Ok(map_domain_state(&native, saved))
    }

    fn update_cpus(&self, num_cores: u32, running: bool) -> Result<()> {
        self.connection
            .set_vcpus(&self.name, num_cores, running)
            .map_err(|e| self.failed("update cpus", e))
    }

    fn resize_memory(&self, size: MemorySize, running: bool) -> Result<()> {
        self.connection
            .set_memory(&self.name, size.in_kib(), running)
            .map_err(|e| self.failed("resize memory", e))
    }

    fn resize_disk(&self, size: MemorySize, running: bool) -> Result<()> {
        self.connection
            .resize_disk(&self.name, &self.image_path, size.in_bytes(), running)
            .map_err(|e| self.failed("resize disk", e))
    }

    fn add_network_interface(
        &self,
        _index: usize,
        _default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()> {
        let live = self.is_running()?;
        self.connection
            .attach_interface(&self.name, &interface.id, &interface.mac_address, live)
            .map_err(|e| self.failed("add network interface", e))
    }

    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        self.connection.lease_ipv4(&self.name, &self.default_mac)
    }

    fn capture_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.connection
            .snapshot_create(&self.name, &snapshot.tag())
            .map_err(|e| self.failed("take snapshot", e))
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.connection
            .snapshot_revert(&self.name, &snapshot.tag())
            .map_err(|e| self.failed("restore snapshot", e))
    }

    fn erase_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.connection
            .snapshot_delete(&self.name, &snapshot.tag())
            .map_err(|e| self.failed("delete snapshot", e))
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        host_interfaces(&self.sys_class_net)
    }
}
