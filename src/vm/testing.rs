//! Test doubles for the orchestrator: a scripted backend, a recording
//! monitor and an in-memory SSH connector.

use super::backend::{capabilities_of, BackendDriver, BackendEvent, BackendKind, Capabilities, StartRequest};
use super::description::{MemorySize, NetworkInterface, VirtualMachineDescription};
use super::monitor::VmStatusMonitor;
use super::snapshot::Snapshot;
use super::state::{ShutdownPolicy, VmState};
use super::{VirtualMachine, VmServices};
use crate::cloud_init::SeedDirConfigurator;
use crate::config::Timeouts;
use crate::error::{Error, Result};
use crate::network::NetworkInterfaceInfo;
use crate::process::CommandOutput;
use crate::ssh::{FileKeyProvider, SshConnector, SshKeyProvider, SshSession};
use parking_lot::Mutex;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Backend whose native state is a field.
pub struct MockBackend {
    kind: BackendKind,
    state: Mutex<VmState>,
    started_state: Mutex<VmState>,
    calls: Mutex<Vec<String>>,
    probes: AtomicUsize,
    probe_fails: AtomicBool,
    start_error: Mutex<Option<String>>,
    graceful_fails: AtomicBool,
    erase_fails: AtomicBool,
    suspend_fails: AtomicBool,
    lingers: AtomicBool,
    ip: Mutex<Option<Ipv4Addr>>,
    metadata: Mutex<Value>,
    sender: Sender<BackendEvent>,
    events: Mutex<Option<Receiver<BackendEvent>>>,
}

impl MockBackend {
    pub fn new(kind: BackendKind, state: VmState) -> Arc<Self> {
        let (sender, events) = mpsc::channel();
        Arc::new(Self {
            kind,
            state: Mutex::new(state),
            started_state: Mutex::new(VmState::Running),
            calls: Mutex::new(Vec::new()),
            probes: AtomicUsize::new(0),
            probe_fails: AtomicBool::new(false),
            start_error: Mutex::new(None),
            graceful_fails: AtomicBool::new(false),
            erase_fails: AtomicBool::new(false),
            suspend_fails: AtomicBool::new(false),
            lingers: AtomicBool::new(false),
            ip: Mutex::new(Some(Ipv4Addr::new(10, 0, 0, 5))),
            metadata: Mutex::new(Value::Null),
            sender,
            events: Mutex::new(Some(events)),
        })
    }

    fn record(&self, call: impl Into<String>) {
        self.calls.lock().push(call.into());
    }

    pub fn set_state(&self, state: VmState) {
        *self.state.lock() = state;
    }

    /// State reported after a successful start.
    pub fn start_into(&self, state: VmState) {
        *self.started_state.lock() = state;
    }

    pub fn fail_start(&self, message: &str) {
        *self.start_error.lock() = Some(message.to_string());
    }

    pub fn fail_graceful(&self) {
        self.graceful_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_erase(&self) {
        self.erase_fails.store(true, Ordering::SeqCst);
    }

    pub fn fail_suspend(&self) {
        self.suspend_fails.store(true, Ordering::SeqCst);
    }

    /// Keep the current state after a shutdown until the test changes it.
    pub fn linger_on_shutdown(&self) {
        self.lingers.store(true, Ordering::SeqCst);
    }

    pub fn fail_probes(&self, fail: bool) {
        self.probe_fails.store(fail, Ordering::SeqCst);
    }

    pub fn set_ip(&self, ip: Option<Ipv4Addr>) {
        *self.ip.lock() = ip;
    }

    pub fn set_metadata(&self, metadata: Value) {
        *self.metadata.lock() = metadata;
    }

    pub fn emit(&self, event: BackendEvent) {
        let _ = self.sender.send(event);
    }

    /// Native calls made so far (probes excluded).
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls.lock().iter().filter(|c| *c == call).count()
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

impl BackendDriver for Arc<MockBackend> {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn capabilities(&self) -> Capabilities {
        capabilities_of(self.kind)
    }

    fn start(&self, request: &StartRequest<'_>) -> Result<()> {
        self.record(if request.resume { "start:resume" } else { "start" });
        if let Some(message) = self.start_error.lock().clone() {
            return Err(Error::command_failed("mock start", message));
        }
        *self.state.lock() = *self.started_state.lock();
        Ok(())
    }

    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()> {
        self.record(format!("shutdown:{}", policy));
        if policy == ShutdownPolicy::Graceful && self.graceful_fails.load(Ordering::SeqCst) {
            return Err(Error::timeout("guest power down", timeout));
        }
        if !self.lingers.load(Ordering::SeqCst) {
            *self.state.lock() = VmState::Off;
        }
        Ok(())
    }

    fn suspend(&self) -> Result<()> {
        self.record("suspend");
        if self.suspend_fails.load(Ordering::SeqCst) {
            return Err(Error::command_failed("mock savevm", "disk does not support snapshots"));
        }
        *self.state.lock() = VmState::Suspended;
        Ok(())
    }

    fn current_state(&self) -> Result<VmState> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.probe_fails.load(Ordering::SeqCst) {
            return Err(Error::command_failed("mock probe", "backend unreachable"));
        }
        Ok(*self.state.lock())
    }

    fn update_cpus(&self, num_cores: u32, running: bool) -> Result<()> {
        self.record(format!("cpus:{}:{}", num_cores, running));
        Ok(())
    }

    fn resize_memory(&self, size: MemorySize, running: bool) -> Result<()> {
        self.record(format!("memory:{}:{}", size, running));
        Ok(())
    }

    fn resize_disk(&self, size: MemorySize, running: bool) -> Result<()> {
        self.record(format!("disk:{}:{}", size, running));
        Ok(())
    }

    fn add_network_interface(
        &self,
        index: usize,
        _default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()> {
        self.record(format!("nic:{}:{}", index, interface.id));
        Ok(())
    }

    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        Ok(*self.ip.lock())
    }

    fn metadata(&self) -> Value {
        self.metadata.lock().clone()
    }

    fn take_events(&self) -> Option<Receiver<BackendEvent>> {
        self.events.lock().take()
    }

    fn capture_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.record(format!("capture:{}", snapshot.name()));
        Ok(())
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.record(format!("apply:{}", snapshot.name()));
        Ok(())
    }

    fn erase_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.record(format!("erase:{}", snapshot.name()));
        if self.erase_fails.load(Ordering::SeqCst) {
            return Err(Error::command_failed("mock erase", "snapshot is busy"));
        }
        Ok(())
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        Ok(Vec::new())
    }
}

/// Something the monitor was told.
#[derive(Debug, Clone, PartialEq)]
pub enum MonitorEvent {
    Persisted(VmState),
    Metadata(Value),
    Suspend,
    Resume,
    Shutdown,
    Restart(String),
}

/// Monitor that remembers every call.
#[derive(Default)]
pub struct RecordingMonitor {
    events: Mutex<Vec<MonitorEvent>>,
    metadata: Mutex<Option<Value>>,
    persist_fails: AtomicBool,
}

impl RecordingMonitor {
    pub fn events(&self) -> Vec<MonitorEvent> {
        self.events.lock().clone()
    }

    /// Persisted states in order.
    pub fn persisted(&self) -> Vec<VmState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                MonitorEvent::Persisted(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, predicate: impl Fn(&MonitorEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }

    pub fn set_metadata(&self, metadata: Value) {
        *self.metadata.lock() = Some(metadata);
    }

    /// Make every later state write fail.
    pub fn fail_persist(&self, fail: bool) {
        self.persist_fails.store(fail, Ordering::SeqCst);
    }
}

impl VmStatusMonitor for RecordingMonitor {
    fn persist_state_for(&self, _name: &str, state: VmState) -> Result<()> {
        if self.persist_fails.load(Ordering::SeqCst) {
            return Err(Error::command_failed("mock persist", "disk full"));
        }
        self.events.lock().push(MonitorEvent::Persisted(state));
        Ok(())
    }

    fn retrieve_metadata_for(&self, _name: &str) -> Result<Value> {
        Ok(self
            .metadata
            .lock()
            .clone()
            .unwrap_or_else(|| Value::Object(Default::default())))
    }

    fn update_metadata_for(&self, _name: &str, metadata: &Value) -> Result<()> {
        self.events.lock().push(MonitorEvent::Metadata(metadata.clone()));
        *self.metadata.lock() = Some(metadata.clone());
        Ok(())
    }

    fn on_suspend(&self) {
        self.events.lock().push(MonitorEvent::Suspend);
    }

    fn on_resume(&self) {
        self.events.lock().push(MonitorEvent::Resume);
    }

    fn on_shutdown(&self) {
        self.events.lock().push(MonitorEvent::Shutdown);
    }

    fn on_restart(&self, name: &str) {
        self.events.lock().push(MonitorEvent::Restart(name.to_string()));
    }
}

/// SSH connector whose sessions record commands.
#[derive(Default)]
pub struct MockSsh {
    commands: Arc<Mutex<Vec<String>>>,
    output: Arc<Mutex<String>>,
    connects: AtomicUsize,
    drops: Arc<AtomicUsize>,
    latency: Arc<Mutex<Duration>>,
}

impl MockSsh {
    /// Delay every command by `latency`.
    pub fn slow(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Stdout every command returns.
    pub fn reply(&self, stdout: &str) {
        *self.output.lock() = stdout.to_string();
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Sessions closed so far.
    pub fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }
}

struct MockSession {
    commands: Arc<Mutex<Vec<String>>>,
    output: Arc<Mutex<String>>,
    drops: Arc<AtomicUsize>,
    latency: Arc<Mutex<Duration>>,
}

impl SshSession for MockSession {
    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let latency = *self.latency.lock();
        std::thread::sleep(latency);
        self.commands.lock().push(command.to_string());
        Ok(CommandOutput::ok(self.output.lock().clone()))
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

impl SshConnector for MockSsh {
    fn connect(
        &self,
        _host: &str,
        _port: u16,
        _username: &str,
        _keys: &dyn SshKeyProvider,
    ) -> Result<Box<dyn SshSession>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSession {
            commands: Arc::clone(&self.commands),
            output: Arc::clone(&self.output),
            drops: Arc::clone(&self.drops),
            latency: Arc::clone(&self.latency),
        }))
    }
}

/// Handles on the doubles behind a test instance.
pub struct Fixture {
    pub backend: Arc<MockBackend>,
    pub monitor: Arc<RecordingMonitor>,
    pub ssh: Arc<MockSsh>,
    pub dir: tempfile::TempDir,
}

pub fn test_timeouts() -> Timeouts {
    Timeouts {
        process_kill: Duration::from_secs(1),
        graceful_shutdown: Duration::from_secs(1),
        lxd_task_short: Duration::from_secs(1),
        lxd_task_long: Duration::from_secs(1),
        network_settle_retry: Duration::from_millis(10),
        network_settle_backoff: Duration::from_millis(50),
        start: Duration::from_secs(2),
        ip_discovery: Duration::from_secs(1),
    }
}

pub fn description() -> VirtualMachineDescription {
    VirtualMachineDescription::builder("primary")
        .cores(2)
        .memory(MemorySize::from_gib(2))
        .disk(MemorySize::from_gib(10))
        .default_mac("52:54:00:00:00:01")
        .image("/images/primary.img")
        .build()
}

/// A `primary` instance on a mock `kind` backend currently in `state`.
pub fn harness(kind: BackendKind, state: VmState) -> (VirtualMachine, Fixture) {
    let dir = tempfile::tempdir().unwrap();
    let backend = MockBackend::new(kind, state);
    let monitor = Arc::new(RecordingMonitor::default());
    let ssh = Arc::new(MockSsh::default());

    let services = VmServices {
        monitor: monitor.clone(),
        ssh: ssh.clone(),
        keys: Arc::new(FileKeyProvider::new(dir.path().join("id_ed25519"))),
        cloud_init: Arc::new(SeedDirConfigurator::new(dir.path())),
    };

    let vm = VirtualMachine::new(
        description(),
        Box::new(Arc::clone(&backend)),
        services,
        test_timeouts(),
        dir.path().join("primary"),
    )
    .unwrap();

    (
        vm,
        Fixture {
            backend,
            monitor,
            ssh,
            dir,
        },
    )
}

/// Poll `condition` for up to five seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    condition()
}
