//! VirtualBox backend, driven through `VBoxManage`.
//!
//! Status comes from `showvminfo --machinereadable`. SSH goes through a NAT
//! port forward on localhost, set up each time the instance starts.

use super::{wait_for, BackendDriver, BackendKind, Capabilities, StartRequest};
use crate::config::VirtualBoxSettings;
use crate::error::{Error, Result};
use crate::network::{InterfaceType, NetworkInterfaceInfo};
use crate::process::{args, CommandRunner};
use crate::utils::CachedRegex;
use crate::vm::description::{MemorySize, NetworkInterface, VirtualMachineDescription};
use crate::vm::snapshot::Snapshot;
use crate::vm::state::{ShutdownPolicy, VmState};
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Guest address of the VirtualBox NAT adapter.
///
/// Every guest behind VirtualBox NAT sees itself at this address, so it is
/// useless to the host. The NAT subnet is VirtualBox's default and can be
/// changed per VM (`--natnet1`); instances we create never do.
pub const VIRTUALBOX_NAT_GUEST_IP: Ipv4Addr = Ipv4Addr::new(10, 0, 2, 15);

/// Map a `VMState` value to a lifecycle state.
pub fn map_vm_state(native: &str) -> VmState {
    match native {
        "starting" | "restoring" => VmState::Starting,
        "running" | "paused" | "onlinesnapshotting" | "stopping" => VmState::Running,
        "saving" => VmState::Suspending,
        "saved" => VmState::Suspended,
        "poweroff" | "aborted" => VmState::Stopped,
        _ => VmState::Unknown,
    }
}

static VM_STATE_LINE: CachedRegex = CachedRegex::new(r#"(?m)^VMState="([^"]+)""#);

/// Extract the state from `showvminfo --machinereadable` output.
pub fn parse_showvminfo(output: &str) -> Result<VmState> {
    match VM_STATE_LINE.get()?.captures(output).and_then(|c| c.get(1)) {
        Some(m) => Ok(map_vm_state(m.as_str())),
        None => Err(Error::command_failed(
            "VBoxManage showvminfo",
            "no VMState in output",
        )),
    }
}

/// Parse `VBoxManage list bridgedifs`.
pub fn parse_bridged_interfaces(output: &str) -> Vec<NetworkInterfaceInfo> {
    let mut networks = Vec::new();

    for block in output.split("\n\n") {
        let mut name = None;
        let mut medium = None;
        for line in block.lines() {
            if let Some((key, value)) = line.split_once(':') {
                match key.trim() {
                    "Name" => name = Some(value.trim().to_string()),
                    "MediumType" => medium = Some(value.trim().to_string()),
                    _ => {}
                }
            }
        }

        if let Some(name) = name {
            let kind = match medium.as_deref() {
                Some("Ethernet") => InterfaceType::Ethernet,
                Some("WirelessLAN") => InterfaceType::Wifi,
                _ => InterfaceType::Unknown,
            };
            let description = match kind {
                InterfaceType::Wifi => "Wi-Fi device".to_string(),
                InterfaceType::Ethernet => "Ethernet device".to_string(),
                _ => "Network adapter".to_string(),
            };
            networks.push(NetworkInterfaceInfo::new(name, kind, description));
        }
    }
    networks
}

/// VirtualBox adapter.
pub struct VirtualBoxBackend {
    name: String,
    image_path: PathBuf,
    vboxmanage: String,
    runner: Arc<dyn CommandRunner>,
    forwarded_port: Mutex<Option<u16>>,
}

impl VirtualBoxBackend {
    /// Attach to an existing VM, or create and configure it.
    pub fn new(
        desc: &VirtualMachineDescription,
        settings: &VirtualBoxSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let backend = Self {
            name: desc.name.clone(),
            image_path: desc.image_path.clone(),
            vboxmanage: settings.vboxmanage.clone(),
            runner,
            forwarded_port: Mutex::new(None),
        };

        let info = backend
            .runner
            .run(&backend.vboxmanage, &args(["showvminfo", desc.name.as_str(), "--machinereadable"]))?;
        if !info.success() {
            backend.create_vm(desc)?;
        }
        Ok(backend)
    }

    fn create_vm(&self, desc: &VirtualMachineDescription) -> Result<()> {
        tracing::info!(vm = %self.name, "creating virtualbox vm");

        self.vbox(&["createvm", "--name", &self.name, "--groups", "/hvorch", "--ostype", "ubuntu_64", "--register"])?;

        let cpus = desc.num_cores.to_string();
        let memory = desc.mem_size.in_mib().to_string();
        let mac = vbox_mac(&desc.default_mac);
        self.vbox(&[
            "modifyvm", &self.name, "--cpus", &cpus, "--memory", &memory, "--boot1", "disk", "--boot2",
            "none", "--acpi", "on", "--firmware", "bios", "--rtcuseutc", "on", "--audio", "none",
            "--nic1", "nat", "--macaddress1", &mac,
        ])?;

        self.vbox(&["storagectl", &self.name, "--add", "sata", "--name", "SATA_0", "--portcount", "2"])?;
        let image = desc.image_path.display().to_string();
        self.vbox(&[
            "storageattach", &self.name, "--storagectl", "SATA_0", "--port", "0", "--device", "0",
            "--type", "hdd", "--medium", &image,
        ])?;
        let iso = desc.cloud_init_iso.display().to_string();
        self.vbox(&[
            "storageattach", &self.name, "--storagectl", "SATA_0", "--port", "1", "--device", "0",
            "--type", "dvddrive", "--medium", &iso,
        ])?;

        for (i, iface) in desc.extra_interfaces.iter().enumerate() {
            self.add_network_interface(i, &desc.default_mac, iface)?;
        }
        Ok(())
    }

    fn vbox(&self, argv: &[&str]) -> Result<String> {
        self.runner.run_checked(&self.vboxmanage, &args(argv.iter().copied()))
    }

    fn failed(&self, operation: &str, e: Error) -> Error {
        Error::operation_failed(operation, &self.name, e.diagnostic())
    }

    fn forward_ssh_port(&self) -> Result<()> {
        let port = std::net::TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();

        // A stale rule from the previous run may or may not exist.
        let _ = self
            .runner
            .run(&self.vboxmanage, &args(["controlvm", self.name.as_str(), "natpf1", "delete", "ssh"]));
        let rule = format!("ssh,tcp,,{},,22", port);
        self.vbox(&["controlvm", &self.name, "natpf1", &rule])
            .map_err(|e| self.failed("port forwarding", e))?;

        *self.forwarded_port.lock() = Some(port);
        tracing::debug!(vm = %self.name, port, "forwarded ssh port");
        Ok(())
    }
}

/// VBoxManage wants MACs without separators.
fn vbox_mac(mac: &str) -> String {
    mac.chars().filter(|c| c.is_ascii_hexdigit()).collect::<String>().to_uppercase()
}

impl BackendDriver for VirtualBoxBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::VirtualBox
    }

    fn capabilities(&self) -> Capabilities {
        super::capabilities_of(BackendKind::VirtualBox)
    }

    fn start(&self, request: &StartRequest<'_>) -> Result<()> {
        let desc = request.description;
        if !request.resume {
            // Resizes made while running are applied on the next cold boot.
            let cpus = desc.num_cores.to_string();
            let memory = desc.mem_size.in_mib().to_string();
            self.vbox(&["modifyvm", &self.name, "--cpus", &cpus, "--memory", &memory])
                .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))?;
        }

        self.vbox(&["startvm", &self.name, "--type", "headless"])
            .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))?;

        self.forward_ssh_port()
    }

    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()> {
        let state = self.current_state()?;

        match (state, policy) {
            (s, _) if s.is_stopped() => Ok(()),
            (VmState::Suspended, ShutdownPolicy::Forced) => {
                self.vbox(&["discardstate", &self.name])
                    .map_err(|e| self.failed("discard saved state", e))?;
                Ok(())
            }
            (VmState::Suspended, ShutdownPolicy::Graceful) => Ok(()),
            (VmState::Starting, _) | (_, ShutdownPolicy::Forced) => {
                self.vbox(&["controlvm", &self.name, "poweroff"])
                    .map_err(|e| self.failed("power off", e))?;
                *self.forwarded_port.lock() = None;
                Ok(())
            }
            (_, ShutdownPolicy::Graceful) => {
                self.vbox(&["controlvm", &self.name, "acpipowerbutton"])
                    .map_err(|e| self.failed("shutdown", e))?;
                wait_for("virtualbox power off", timeout, || {
                    Ok(self.current_state()?.is_stopped())
                })?;
                *self.forwarded_port.lock() = None;
                Ok(())
            }
        }
    }

    fn suspend(&self) -> Result<()> {
        self.vbox(&["controlvm", &self.name, "savestate"])
            .map_err(|e| self.failed("suspend", e))?;
        *self.forwarded_port.lock() = None;
        Ok(())
    }

    fn current_state(&self) -> Result<VmState> {
        let output = self
            .runner
            .run_checked(&self.vboxmanage, &args(["showvminfo", self.name.as_str(), "--machinereadable"]))?;
        parse_showvminfo(&output)
    }

    fn update_cpus(&self, num_cores: u32, running: bool) -> Result<()> {
        if running {
            tracing::info!(vm = %self.name, num_cores, "cpu change applies on next start");
            return Ok(());
        }
        self.vbox(&["modifyvm", &self.name, "--cpus", &num_cores.to_string()])
            .map_err(|e| self.failed("update cpus", e))?;
        Ok(())
    }

    fn resize_memory(&self, size: MemorySize, running: bool) -> Result<()> {
        if running {
            tracing::info!(vm = %self.name, %size, "memory change applies on next start");
            return Ok(());
        }
        self.vbox(&["modifyvm", &self.name, "--memory", &size.in_mib().to_string()])
            .map_err(|e| self.failed("resize memory", e))?;
        Ok(())
    }

    fn resize_disk(&self, size: MemorySize, running: bool) -> Result<()> {
        if running {
            return Err(Error::invalid_state("stopped", VmState::Running));
        }
        let image = self.image_path.display().to_string();
        self.vbox(&["modifymedium", "disk", &image, "--resize", &size.in_mib().to_string()])
            .map_err(|e| self.failed("resize disk", e))?;
        Ok(())
    }

    fn add_network_interface(
        &self,
        index: usize,
        _default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()> {
        // nic1 is the NAT adapter.
        let nic = index + 2;
        self.vbox(&[
            "modifyvm",
            &self.name,
            &format!("--nic{}", nic),
            "bridged",
            &format!("--bridgeadapter{}", nic),
            &interface.id,
            &format!("--macaddress{}", nic),
            &vbox_mac(&interface.mac_address),
        ])
        .map_err(|e| self.failed("add network interface", e))?;
        Ok(())
    }

    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        Ok(self.forwarded_port.lock().map(|_| Ipv4Addr::LOCALHOST))
    }

    fn filter_ipv4(&self, addresses: Vec<Ipv4Addr>) -> Vec<Ipv4Addr> {
        addresses
            .into_iter()
            .filter(|a| *a != VIRTUALBOX_NAT_GUEST_IP)
            .collect()
    }

    fn ssh_port(&self) -> u16 {
        self.forwarded_port.lock().unwrap_or(22)
    }

    fn capture_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let tag = snapshot.tag();
        self.vbox(&["snapshot", &self.name, "take", &tag, "--description", snapshot.comment()])
            .map_err(|e| self.failed("take snapshot", e))?;
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.vbox(&["snapshot", &self.name, "restore", &snapshot.tag()])
            .map_err(|e| self.failed("restore snapshot", e))?;
        Ok(())
    }

    fn erase_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.vbox(&["snapshot", &self.name, "delete", &snapshot.tag()])
            .map_err(|e| self.failed("delete snapshot", e))?;
        Ok(())
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        let output = self.vbox(&["list", "bridgedifs"])?;
        Ok(parse_bridged_interfaces(&output))
    }
}
