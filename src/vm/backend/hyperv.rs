//! Hyper-V backend, driven through PowerShell cmdlets.

use super::{wait_for, BackendDriver, BackendKind, Capabilities, StartRequest};
use crate::config::HyperVSettings;
use crate::error::{Error, Result};
use crate::network::{InterfaceType, NetworkInterfaceInfo};
use crate::process::{args, CommandRunner};
use crate::utils::parse_ipv4_addresses;
use crate::vm::description::{MemorySize, NetworkInterface, VirtualMachineDescription};
use crate::vm::snapshot::Snapshot;
use crate::vm::state::{ShutdownPolicy, VmState};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Map the `State` property of `Get-VM`.
pub fn map_vm_state(native: &str) -> VmState {
    match native.trim() {
        "Off" => VmState::Off,
        "Starting" | "Resuming" => VmState::Starting,
        "Running" | "Stopping" => VmState::Running,
        "Reset" => VmState::Restarting,
        "Saving" | "Pausing" => VmState::Suspending,
        "Saved" | "Paused" => VmState::Suspended,
        _ => VmState::Unknown,
    }
}

/// Quote a value for a PowerShell single-quoted string.
fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Split one line of `ConvertTo-Csv` output.
fn csv_fields(line: &str) -> Vec<String> {
    line.split("\",\"")
        .map(|f| f.trim().trim_matches('"').to_string())
        .collect()
}

/// Parse `Get-VMSwitch | Select Name,SwitchType,NetAdapterInterfaceDescription | ConvertTo-Csv`.
pub fn parse_switches(csv: &str) -> Vec<NetworkInterfaceInfo> {
    csv.lines()
        .skip(1)
        .filter(|l| !l.trim().is_empty())
        .filter_map(|line| {
            let fields = csv_fields(line);
            let name = fields.first()?.clone();
            let switch_type = fields.get(1).map(String::as_str).unwrap_or("");
            let adapter = fields.get(2).map(String::as_str).unwrap_or("");
            let description = match switch_type {
                "External" if !adapter.is_empty() => {
                    format!("Virtual Switch with external networking via \"{}\"", adapter)
                }
                "External" => "Virtual Switch with external networking".to_string(),
                "Internal" => "Virtual Switch with internal networking".to_string(),
                "Private" => "Private virtual switch".to_string(),
                _ => "Unknown Virtual Switch type".to_string(),
            };
            Some(NetworkInterfaceInfo::new(name, InterfaceType::Switch, description))
        })
        .collect()
}

/// Hyper-V adapter.
pub struct HyperVBackend {
    name: String,
    image_path: PathBuf,
    powershell: String,
    runner: Arc<dyn CommandRunner>,
}

impl HyperVBackend {
    /// Attach to an existing VM, or create it.
    pub fn new(
        desc: &VirtualMachineDescription,
        settings: &HyperVSettings,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<Self> {
        let backend = Self {
            name: desc.name.clone(),
            image_path: desc.image_path.clone(),
            powershell: settings.powershell.clone(),
            runner,
        };

        let exists = backend
            .runner
            .run(&backend.powershell, &backend.command(&format!("Get-VM -Name {}", quote(&desc.name))))?
            .success();
        if !exists {
            backend.create_vm(desc, &settings.switch)?;
        }
        Ok(backend)
    }

    fn create_vm(&self, desc: &VirtualMachineDescription, switch: &str) -> Result<()> {
        tracing::info!(vm = %self.name, "creating hyper-v vm");
        let vm = quote(&self.name);

        self.ps(&format!(
            "New-VM -Name {} -Generation 2 -VHDPath {} -BootDevice VHD -SwitchName {} -MemoryStartupBytes {}",
            vm,
            quote(&desc.image_path.display().to_string()),
            quote(switch),
            desc.mem_size.in_bytes()
        ))?;
        self.ps(&format!("Set-VMFirmware -VMName {} -EnableSecureBoot Off", vm))?;
        self.ps(&format!("Set-VMProcessor -VMName {} -Count {}", vm, desc.num_cores))?;
        self.ps(&format!(
            "Add-VMDvdDrive -VMName {} -Path {}",
            vm,
            quote(&desc.cloud_init_iso.display().to_string())
        ))?;
        self.ps(&format!(
            "Set-VMNetworkAdapter -VMName {} -StaticMacAddress {}",
            vm,
            quote(&hyperv_mac(&desc.default_mac))
        ))?;

        for (i, iface) in desc.extra_interfaces.iter().enumerate() {
            self.add_network_interface(i, &desc.default_mac, iface)?;
        }
        Ok(())
    }

    fn command(&self, script: &str) -> Vec<String> {
        args(["-NoProfile", "-NonInteractive", "-Command", script])
    }

    fn ps(&self, script: &str) -> Result<String> {
        self.runner.run_checked(&self.powershell, &self.command(script))
    }

    fn failed(&self, operation: &str, e: Error) -> Error {
        Error::operation_failed(operation, &self.name, e.diagnostic())
    }
}

/// Hyper-V wants MACs without separators.
fn hyperv_mac(mac: &str) -> String {
    mac.chars().filter(|c| c.is_ascii_hexdigit()).collect::<String>().to_uppercase()
}

impl BackendDriver for HyperVBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::HyperV
    }

    fn capabilities(&self) -> Capabilities {
        super::capabilities_of(BackendKind::HyperV)
    }

    fn start(&self, _request: &StartRequest<'_>) -> Result<()> {
        self.ps(&format!("Start-VM -Name {}", quote(&self.name)))
            .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))?;
        Ok(())
    }

    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()> {
        let vm = quote(&self.name);
        let state = self.current_state()?;

        match (state, policy) {
            (s, _) if s.is_stopped() => return Ok(()),
            (VmState::Suspended, ShutdownPolicy::Forced) => {
                self.ps(&format!("Remove-VMSavedState -VMName {}", vm))
                    .map_err(|e| self.failed("discard saved state", e))?;
                return Ok(());
            }
            (VmState::Suspended, ShutdownPolicy::Graceful) => return Ok(()),
            (VmState::Starting, _) | (_, ShutdownPolicy::Forced) => {
                self.ps(&format!("Stop-VM -Name {} -TurnOff", vm))
                    .map_err(|e| self.failed("power off", e))?;
            }
            (_, ShutdownPolicy::Graceful) => {
                self.ps(&format!("Stop-VM -Name {} -Force", vm))
                    .map_err(|e| self.failed("shutdown", e))?;
            }
        }

        wait_for("hyper-v power off", timeout, || Ok(self.current_state()?.is_stopped()))
    }

    fn suspend(&self) -> Result<()> {
        self.ps(&format!("Save-VM -Name {}", quote(&self.name)))
            .map_err(|e| self.failed("suspend", e))?;
        Ok(())
    }

    fn current_state(&self) -> Result<VmState> {
        let output = self.ps(&format!(
            "Get-VM -Name {} | Select-Object -ExpandProperty State",
            quote(&self.name)
        ))?;
        Ok(map_vm_state(&output))
    }

    fn update_cpus(&self, num_cores: u32, _running: bool) -> Result<()> {
        self.ps(&format!("Set-VMProcessor -VMName {} -Count {}", quote(&self.name), num_cores))
            .map_err(|e| self.failed("update cpus", e))?;
        Ok(())
    }

    fn resize_memory(&self, size: MemorySize, _running: bool) -> Result<()> {
        self.ps(&format!(
            "Set-VMMemory -VMName {} -StartupBytes {}",
            quote(&self.name),
            size.in_bytes()
        ))
        .map_err(|e| self.failed("resize memory", e))?;
        Ok(())
    }

    fn resize_disk(&self, size: MemorySize, _running: bool) -> Result<()> {
        self.ps(&format!(
            "Resize-VHD -Path {} -SizeBytes {}",
            quote(&self.image_path.display().to_string()),
            size.in_bytes()
        ))
        .map_err(|e| self.failed("resize disk", e))?;
        Ok(())
    }

    fn add_network_interface(
        &self,
        _index: usize,
        _default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()> {
        self.ps(&format!(
            "Add-VMNetworkAdapter -VMName {} -SwitchName {} -StaticMacAddress {}",
            quote(&self.name),
            quote(&interface.id),
            quote(&hyperv_mac(&interface.mac_address))
        ))
        .map_err(|e| self.failed("add network interface", e))?;
        Ok(())
    }

    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        let output = self.ps(&format!(
            "Get-VMNetworkAdapter -VMName {} | Select-Object -First 1 -ExpandProperty IPAddresses",
            quote(&self.name)
        ))?;
        Ok(output
            .lines()
            .filter_map(|l| l.trim().parse::<Ipv4Addr>().ok())
            .next()
            .or_else(|| {
                parse_ipv4_addresses(&output)
                    .ok()
                    .and_then(|v| v.into_iter().next())
            }))
    }

    fn capture_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.ps(&format!(
            "Checkpoint-VM -Name {} -SnapshotName {}",
            quote(&self.name),
            quote(&snapshot.tag())
        ))
        .map_err(|e| self.failed("take snapshot", e))?;
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.ps(&format!(
            "Restore-VMCheckpoint -VMName {} -Name {} -Confirm:$false",
            quote(&self.name),
            quote(&snapshot.tag())
        ))
        .map_err(|e| self.failed("restore snapshot", e))?;
        Ok(())
    }

    fn erase_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.ps(&format!(
            "Remove-VMCheckpoint -VMName {} -Name {}",
            quote(&self.name),
            quote(&snapshot.tag())
        ))
        .map_err(|e| self.failed("delete snapshot", e))?;
        Ok(())
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        let csv = self.ps(
            "Get-VMSwitch | Select-Object -Property Name,SwitchType,NetAdapterInterfaceDescription \
             | ConvertTo-Csv -NoTypeInformation",
        )?;
        Ok(parse_switches(&csv))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::scripted::ScriptedRunner;
    use crate::process::CommandOutput;

    fn backend(runner: Arc<ScriptedRunner>) -> HyperVBackend {
        let desc = VirtualMachineDescription::builder("primary")
            .default_mac("52:54:00:aa:bb:cc")
            .image("C:\\vms\\primary.vhdx")
            .build();
        HyperVBackend::new(&desc, &HyperVSettings::default(), runner).unwrap()
    }

    #[test]
    fn test_state_mapping() {
        let cases = [
            ("Off", VmState::Off),
            ("Running\r\n", VmState::Running),
            ("Starting", VmState::Starting),
            ("Saved", VmState::Suspended),
            ("Saving", VmState::Suspending),
            ("Reset", VmState::Restarting),
            ("Other", VmState::Unknown),
        ];
        for (native, expected) in cases {
            assert_eq!(map_vm_state(native), expected, "State={:?}", native);
        }
    }

    #[test]
    fn test_creates_vm_when_missing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("Get-VM -Name", CommandOutput::failed(1, "Hyper-V was unable to find a virtual machine"));
        let _backend = backend(runner.clone());

        assert_eq!(runner.count("New-VM -Name 'primary'"), 1);
        assert_eq!(runner.count("-StaticMacAddress '525400AABBCC'"), 1);
    }

    #[test]
    fn test_forced_shutdown_turns_off() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("ExpandProperty State", CommandOutput::ok("Running"));
        let backend = backend(runner.clone());
        runner.on("ExpandProperty State", CommandOutput::ok("Off"));

        backend.shutdown(ShutdownPolicy::Forced, Duration::from_secs(2)).unwrap();
        assert_eq!(runner.count("Stop-VM -Name 'primary' -TurnOff"), 1);
    }

    #[test]
    fn test_graceful_shutdown_of_saved_vm_is_noop() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("ExpandProperty State", CommandOutput::ok("Saved"));
        let backend = backend(runner.clone());

        backend.shutdown(ShutdownPolicy::Graceful, Duration::from_secs(1)).unwrap();
        assert_eq!(runner.count("Stop-VM"), 0);
        assert_eq!(runner.count("Remove-VMSavedState"), 0);
    }

    #[test]
    fn test_graceful_timeout_is_reported() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("ExpandProperty State", CommandOutput::ok("Running"));
        let backend = backend(runner);

        let err = backend
            .shutdown(ShutdownPolicy::Graceful, Duration::from_millis(300))
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }

    #[test]
    fn test_names_are_quoted() {
        assert_eq!(quote("it's"), "'it''s'");
    }

    #[test]
    fn test_parse_switches() {
        let csv = "\"Name\",\"SwitchType\",\"NetAdapterInterfaceDescription\"\r\n\
                   \"Default Switch\",\"Internal\",\"\"\r\n\
                   \"LAN\",\"External\",\"Intel(R) Ethernet\"\r\n";
        let switches = parse_switches(csv);
        assert_eq!(switches.len(), 2);
        assert_eq!(switches[0].id, "Default Switch");
        assert_eq!(switches[1].description, "Virtual Switch with external networking via \"Intel(R) Ethernet\"");
        assert!(switches.iter().all(|s| !s.needs_authorization));
    }

    #[test]
    fn test_management_ip_picks_first_ipv4() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("IPAddresses", CommandOutput::ok("fe80::1\r\n172.20.1.5\r\n"));
        let backend = backend(runner);
        assert_eq!(
            backend.management_ipv4().unwrap(),
            Some(Ipv4Addr::new(172, 20, 1, 5))
        );
    }
}
