//! QEMU backend.
//!
//! Each instance is one `qemu-system-*` process controlled over QMP on its
//! stdio. A reader thread decodes QMP traffic and forwards lifecycle events
//! to the orchestrator as [`BackendEvent`]s.
//!
//! Suspend is `stop` + `savevm suspend` + `quit`: the guest state lands in
//! the image under the reserved [`SUSPEND_TAG`]. `quit` is only sent once
//! QEMU acknowledged the save; a failed save resumes the guest. The exact launch
//! command is saved as metadata so a later `start` can relaunch the same
//! machine with `-loadvm suspend`, even across daemon restarts. User
//! snapshots are internal qcow2 snapshots tagged `@s<index>`, managed with
//! `qemu-img` while the instance is stopped.

use super::{BackendDriver, BackendEvent, BackendKind, Capabilities, StartRequest};
use crate::config::{QemuSettings, Timeouts};
use crate::error::{Error, Result};
use crate::network::{host_interfaces, NetworkInterfaceInfo};
use crate::process::{self, args, CommandRunner};
use crate::vm::description::{MemorySize, MountSpec, NetworkInterface, VirtualMachineDescription};
use crate::vm::snapshot::Snapshot;
use crate::vm::state::{ShutdownPolicy, VmState};
use hvorch_qmp::{Command as QmpCommand, LineDecoder, Message, SUSPEND_TAG};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read, Write};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::time::Duration;

/// QEMU's answer to one numbered command.
pub type Reply = std::result::Result<Value, hvorch_qmp::QmpError>;

/// Commands still waiting for their reply, by id.
type PendingReplies = Mutex<HashMap<u64, Sender<Reply>>>;

/// A running QEMU process.
pub trait QemuProcess: Send {
    /// OS process id.
    fn pid(&self) -> u32;

    /// Write one QMP command.
    fn send(&mut self, command: &QmpCommand) -> Result<()>;

    /// Write one QMP command and return a channel that receives its reply.
    /// The channel disconnects if the process exits first.
    fn request(&mut self, command: &QmpCommand) -> Result<Receiver<Reply>>;

    /// `Some(exit code)` once the process has exited.
    fn try_wait(&mut self) -> Result<Option<Option<i32>>>;

    /// Kill the process.
    fn kill(&mut self) -> Result<()>;
}

/// Spawns QEMU processes.
pub trait QemuLauncher: Send + Sync {
    /// Launch with `arguments`, forwarding QMP events and the final exit
    /// to `events`.
    fn launch(
        &self,
        name: &str,
        arguments: &[String],
        events: Sender<BackendEvent>,
    ) -> Result<Box<dyn QemuProcess>>;
}

/// [`QemuLauncher`] spawning the configured system emulator.
#[derive(Debug, Clone)]
pub struct SystemQemuLauncher {
    binary: String,
}

impl SystemQemuLauncher {
    /// Launch `binary` (e.g. `qemu-system-x86_64`).
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

struct SystemQemuProcess {
    pid: u32,
    child: Arc<Mutex<Child>>,
    stdin: Arc<Mutex<ChildStdin>>,
    replies: Arc<PendingReplies>,
    next_id: u64,
}

fn write_command(stdin: &Mutex<ChildStdin>, command: &QmpCommand) -> Result<()> {
    let bytes = hvorch_qmp::encode_command(command)?;
    let mut stdin = stdin.lock();
    stdin.write_all(&bytes)?;
    stdin.flush()?;
    Ok(())
}

impl QemuProcess for SystemQemuProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn send(&mut self, command: &QmpCommand) -> Result<()> {
        tracing::debug!(pid = self.pid, command = %command.execute, "sending qmp command");
        write_command(&self.stdin, command)
    }

    fn request(&mut self, command: &QmpCommand) -> Result<Receiver<Reply>> {
        self.next_id += 1;
        let id = self.next_id;
        let (tx, rx) = mpsc::channel();
        self.replies.lock().insert(id, tx);

        tracing::debug!(pid = self.pid, command = %command.execute, id, "sending qmp request");
        if let Err(e) = write_command(&self.stdin, &command.clone().with_id(id)) {
            self.replies.lock().remove(&id);
            return Err(e);
        }
        Ok(rx)
    }

    fn try_wait(&mut self) -> Result<Option<Option<i32>>> {
        Ok(self.child.lock().try_wait()?.map(|status| status.code()))
    }

    fn kill(&mut self) -> Result<()> {
        let mut child = self.child.lock();
        if child.try_wait()?.is_none() {
            child.kill()?;
        }
        Ok(())
    }
}

/// Translate one QMP message into a backend event.
pub fn qmp_event(message: &Message) -> Option<BackendEvent> {
    match message {
        Message::Return { .. } | Message::Greeting { .. } => None,
        Message::Error { error, .. } => Some(BackendEvent::Error(error.to_string())),
        Message::Event { .. } => match message.event_kind()? {
            hvorch_qmp::EventKind::Reset => Some(BackendEvent::Restarting),
            hvorch_qmp::EventKind::Powerdown => Some(BackendEvent::PoweringDown),
            hvorch_qmp::EventKind::Resume => Some(BackendEvent::Resumed),
            _ => None,
        },
    }
}

impl QemuLauncher for SystemQemuLauncher {
    fn launch(
        &self,
        name: &str,
        arguments: &[String],
        events: Sender<BackendEvent>,
    ) -> Result<Box<dyn QemuProcess>> {
        tracing::info!(vm = %name, program = %self.binary, ?arguments, "launching qemu");

        let mut child = std::process::Command::new(&self.binary)
            .args(arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::start_failure(name, format!("{}: {}", self.binary, e)))?;

        let pid = child.id();
        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            let _ = child.kill();
            return Err(Error::start_failure(name, "qemu stdio unavailable"));
        };

        let child = Arc::new(Mutex::new(child));
        let stdin = Arc::new(Mutex::new(stdin));
        let replies = Arc::new(PendingReplies::default());
        let last_error = Arc::new(Mutex::new(String::new()));

        {
            let name = name.to_string();
            let last_error = Arc::clone(&last_error);
            std::thread::Builder::new()
                .name(format!("qemu-stderr-{}", pid))
                .spawn(move || {
                    for line in BufReader::new(stderr).lines().map_while(|l| l.ok()) {
                        tracing::warn!(vm = %name, "qemu: {}", line);
                        *last_error.lock() = line;
                    }
                })?;
        }

        {
            let name = name.to_string();
            let child = Arc::clone(&child);
            let stdin = Arc::clone(&stdin);
            let replies = Arc::clone(&replies);
            std::thread::Builder::new()
                .name(format!("qmp-{}", pid))
                .spawn(move || {
                    read_qmp(&name, stdout, &stdin, &child, &replies, &last_error, &events)
                })?;
        }

        Ok(Box::new(SystemQemuProcess {
            pid,
            child,
            stdin,
            replies,
            next_id: 0,
        }))
    }
}

/// Hand a numbered reply to the command waiting for it. Anything else is
/// given back.
fn route_reply(replies: &PendingReplies, message: Message) -> Option<Message> {
    let Some(id) = message.reply_id() else {
        return Some(message);
    };
    let Some(waiter) = replies.lock().remove(&id) else {
        return Some(message);
    };
    let reply = match message {
        Message::Return { value, .. } => Ok(value),
        Message::Error { error, .. } => Err(error),
        other => return Some(other),
    };
    let _ = waiter.send(reply);
    None
}

/// QMP reader loop: negotiate capabilities, answer requests, forward
/// events, report exit.
fn read_qmp(
    name: &str,
    mut stdout: impl Read,
    stdin: &Mutex<ChildStdin>,
    child: &Mutex<Child>,
    replies: &PendingReplies,
    last_error: &Mutex<String>,
    events: &Sender<BackendEvent>,
) {
    let mut decoder = LineDecoder::new();
    let mut negotiated = false;
    let mut buf = [0u8; 4096];

    loop {
        let n = match stdout.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        for message in decoder.feed(&buf[..n]) {
            let message = match message {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!(vm = %name, error = %e, "ignoring undecodable qmp line");
                    continue;
                }
            };
            tracing::trace!(vm = %name, ?message, "qmp message");
            let Some(message) = route_reply(replies, message) else {
                continue;
            };

            match &message {
                Message::Greeting { .. } => {
                    if let Err(e) = write_command(stdin, &QmpCommand::capabilities()) {
                        tracing::warn!(vm = %name, error = %e, "qmp negotiation failed");
                    }
                }
                Message::Return { .. } if !negotiated => {
                    negotiated = true;
                    let _ = events.send(BackendEvent::Started);
                }
                Message::Event { event, .. } if event == "POWERDOWN" => {
                    tracing::info!(vm = %name, "guest powering down");
                }
                _ => {}
            }
            if let Some(event) = qmp_event(&message) {
                let _ = events.send(event);
            }
        }
    }

    // stdout closed: the process is gone or about to be.
    replies.lock().clear();
    let code = loop {
        match child.lock().try_wait() {
            Ok(Some(status)) => break status.code(),
            Ok(None) => {}
            Err(_) => break None,
        }
        std::thread::sleep(Duration::from_millis(50));
    };

    if code != Some(0) {
        let stderr = last_error.lock().clone();
        if !stderr.is_empty() {
            let _ = events.send(BackendEvent::Error(stderr));
        }
    }
    tracing::info!(vm = %name, ?code, "qemu process exited");
    let _ = events.send(BackendEvent::Exited { code });
}

/// `human-monitor-command` succeeds at the QMP level even when the HMP
/// command failed; any output text is its error message.
fn hmp_output(command: &str, output: &Value) -> Result<()> {
    match output.as_str().map(str::trim) {
        None | Some("") => Ok(()),
        Some(text) => Err(Error::command_failed(command, text)),
    }
}

/// Mount entry in the resume metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountData {
    /// Host directory.
    pub source: PathBuf,
    /// Launch arguments for this mount.
    pub arguments: Vec<String>,
}

/// Metadata persisted so the exact machine can be relaunched.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QemuMetadata {
    /// `-machine` type used at launch.
    pub machine_type: String,
    /// Launch arguments, without mount arguments.
    pub arguments: Vec<String>,
    /// Mount tag -> mount arguments.
    #[serde(default)]
    pub mount_data: BTreeMap<String, MountData>,
    /// Pid of the live process, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

/// Launch arguments for a description, without mounts.
pub fn launch_arguments(desc: &VirtualMachineDescription, settings: &QemuSettings) -> Vec<String> {
    let mut a = args([
        "-machine".to_string(),
        format!("{},accel=kvm:tcg", settings.machine_type),
        "-cpu".to_string(),
        "max".to_string(),
        "-smp".to_string(),
        desc.num_cores.to_string(),
        "-m".to_string(),
        format!("{}M", desc.mem_size.in_mib()),
        "-drive".to_string(),
        format!(
            "file={},if=virtio,format=qcow2,discard=unmap",
            desc.image_path.display()
        ),
        "-drive".to_string(),
        format!(
            "file={},if=virtio,format=raw,readonly=on",
            desc.cloud_init_iso.display()
        ),
        "-device".to_string(),
        format!("virtio-net-pci,netdev=hostnet0,id=net0,mac={}", desc.default_mac),
        "-netdev".to_string(),
        format!("bridge,id=hostnet0,br={}", settings.bridge),
    ]);

    for (i, iface) in desc.extra_interfaces.iter().enumerate() {
        let n = i + 1;
        a.push("-device".to_string());
        a.push(format!(
            "virtio-net-pci,netdev=hostnet{n},id=net{n},mac={}",
            iface.mac_address
        ));
        a.push("-netdev".to_string());
        a.push(format!("bridge,id=hostnet{n},br={}", iface.id));
    }

    a.extend(args([
        "-qmp",
        "stdio",
        "-chardev",
        "null,id=char0",
        "-serial",
        "chardev:char0",
        "-nographic",
    ]));
    a
}

/// Launch arguments for one mount.
pub fn mount_arguments(tag: &str, spec: &MountSpec) -> Vec<String> {
    let mut fs = format!(
        "local,security_model=passthrough,path={},mount_tag={}",
        spec.source.display(),
        tag
    );
    if spec.read_only {
        fs.push_str(",readonly=on");
    }
    let mut a = vec!["-virtfs".to_string(), fs];
    a.extend(spec.arguments.iter().cloned());
    a
}

/// Whether `qemu-img snapshot -l` output lists `tag`.
pub fn lists_snapshot(listing: &str, tag: &str) -> bool {
    listing
        .lines()
        .any(|l| l.split_whitespace().nth(1) == Some(tag))
}

/// Find the IPv4 neighbour with `mac` in `ip neigh` output.
pub fn parse_neighbour(output: &str, mac: &str) -> Option<Ipv4Addr> {
    output.lines().find_map(|line| {
        let cols: Vec<_> = line.split_whitespace().collect();
        let at = cols.iter().position(|c| *c == "lladdr")?;
        if cols.get(at + 1)?.eq_ignore_ascii_case(mac) {
            cols.first()?.parse().ok()
        } else {
            None
        }
    })
}

#[derive(Default)]
struct QemuInner {
    process: Option<Box<dyn QemuProcess>>,
    /// Process found alive from a previous daemon run; no stdio handle.
    adopted_pid: Option<u32>,
    metadata: QemuMetadata,
    pending_disk: Option<MemorySize>,
}

impl QemuInner {
    fn pid(&self) -> Option<u32> {
        self.process
            .as_ref()
            .map(|p| p.pid())
            .or(self.adopted_pid)
    }

    /// Whether a process is alive, reaping it if it has exited.
    fn alive(&mut self) -> Result<bool> {
        if let Some(process) = self.process.as_mut() {
            if process.try_wait()?.is_none() {
                return Ok(true);
            }
            self.process = None;
        }
        if let Some(pid) = self.adopted_pid {
            if process::is_alive(pid) {
                return Ok(true);
            }
            self.adopted_pid = None;
        }
        Ok(false)
    }
}

/// QEMU adapter.
pub struct QemuBackend {
    name: String,
    image_path: PathBuf,
    default_mac: String,
    settings: QemuSettings,
    kill_timeout: Duration,
    suspend_timeout: Duration,
    sys_class_net: PathBuf,
    launcher: Arc<dyn QemuLauncher>,
    runner: Arc<dyn CommandRunner>,
    inner: Mutex<QemuInner>,
    events_tx: Sender<BackendEvent>,
    events_rx: Mutex<Option<Receiver<BackendEvent>>>,
}

impl QemuBackend {
    /// Create the adapter. Nothing is launched until `start`.
    pub fn new(
        desc: &VirtualMachineDescription,
        settings: &QemuSettings,
        timeouts: &Timeouts,
        launcher: Arc<dyn QemuLauncher>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel();
        Self {
            name: desc.name.clone(),
            image_path: desc.image_path.clone(),
            default_mac: desc.default_mac.clone(),
            settings: settings.clone(),
            kill_timeout: timeouts.process_kill,
            suspend_timeout: timeouts.graceful_shutdown,
            sys_class_net: PathBuf::from("/sys/class/net"),
            launcher,
            runner,
            inner: Mutex::new(QemuInner::default()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
        }
    }

    fn qemu_img(&self, command: &[&str]) -> Result<String> {
        let image = self.image_path.display().to_string();
        let mut full: Vec<String> = command.iter().map(|s| s.to_string()).collect();
        full.push(image);
        self.runner.run_checked(&self.settings.img_binary, &full)
    }

    fn failed(&self, operation: &str, e: Error) -> Error {
        Error::operation_failed(operation, &self.name, e.diagnostic())
    }

    /// `qemu-img resize <image> <bytes>`.
    fn grow_image(&self, size: MemorySize) -> Result<()> {
        let image = self.image_path.display().to_string();
        let bytes = size.in_bytes().to_string();
        self.runner
            .run_checked(
                &self.settings.img_binary,
                &args(["resize", image.as_str(), bytes.as_str()]),
            )
            .map(drop)
    }

    fn has_suspend_image(&self) -> Result<bool> {
        let listing = self.qemu_img(&["snapshot", "-l"])?;
        Ok(lists_snapshot(&listing, SUSPEND_TAG))
    }

    /// Poll until the process is gone, holding the lock only per probe.
    fn wait_exit(&self, operation: &str, timeout: Duration) -> Result<()> {
        super::wait_for(operation, timeout, || Ok(!self.inner.lock().alive()?))
    }

    fn send(&self, command: QmpCommand) -> Result<()> {
        let mut inner = self.inner.lock();
        let process = inner
            .process
            .as_mut()
            .ok_or_else(|| Error::invalid_state("running", VmState::Off))?;
        process.send(&command)
    }

    /// Send `command` and wait up to `timeout` for its reply, without
    /// holding the process lock while waiting.
    fn execute(&self, command: QmpCommand, timeout: Duration) -> Result<Value> {
        let reply = {
            let mut inner = self.inner.lock();
            let process = inner
                .process
                .as_mut()
                .ok_or_else(|| Error::invalid_state("running", VmState::Off))?;
            process.request(&command)?
        };

        match reply.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Error::command_failed(&command.execute, error.to_string())),
            Err(RecvTimeoutError::Timeout) => {
                Err(Error::timeout(format!("qmp {}", command.execute), timeout))
            }
            Err(RecvTimeoutError::Disconnected) => Err(Error::command_failed(
                &command.execute,
                "qemu exited before replying",
            )),
        }
    }

    fn require_stopped(&self, operation: &str) -> Result<()> {
        if self.inner.lock().alive()? {
            return Err(Error::operation_failed(
                operation,
                &self.name,
                "qemu snapshots require a stopped instance",
            ));
        }
        Ok(())
    }

    /// Arguments for this launch and the metadata describing them.
    fn plan_launch(&self, request: &StartRequest<'_>) -> Result<(Vec<String>, QemuMetadata)> {
        let desc = request.description;

        if request.resume {
            match serde_json::from_value::<QemuMetadata>(request.metadata.clone()) {
                Ok(saved) if !saved.arguments.is_empty() => {
                    if saved.machine_type != self.settings.machine_type {
                        tracing::warn!(
                            vm = %self.name,
                            saved = %saved.machine_type,
                            configured = %self.settings.machine_type,
                            "resuming with the machine type the instance was suspended with"
                        );
                    }
                    let mut arguments = saved.arguments.clone();
                    for mount in saved.mount_data.values() {
                        arguments.extend(mount.arguments.iter().cloned());
                    }
                    arguments.extend(args(["-loadvm", SUSPEND_TAG]));
                    return Ok((arguments, QemuMetadata { pid: None, ..saved }));
                }
                _ => {
                    tracing::warn!(
                        vm = %self.name,
                        "no usable launch metadata, resuming with arguments rebuilt from the description"
                    );
                }
            }
        }

        let base = launch_arguments(desc, &self.settings);
        let mount_data: BTreeMap<String, MountData> = desc
            .mounts
            .iter()
            .map(|(tag, spec)| {
                (
                    tag.clone(),
                    MountData {
                        source: spec.source.clone(),
                        arguments: mount_arguments(tag, spec),
                    },
                )
            })
            .collect();

        let mut arguments = base.clone();
        for mount in mount_data.values() {
            arguments.extend(mount.arguments.iter().cloned());
        }
        if request.resume {
            arguments.extend(args(["-loadvm", SUSPEND_TAG]));
        }

        Ok((
            arguments,
            QemuMetadata {
                machine_type: self.settings.machine_type.clone(),
                arguments: base,
                mount_data,
                pid: None,
            },
        ))
    }
}

impl BackendDriver for QemuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Qemu
    }

    fn capabilities(&self) -> Capabilities {
        super::capabilities_of(BackendKind::Qemu)
    }

    fn reattach(&self, metadata: &Value) -> Result<()> {
        let Ok(saved) = serde_json::from_value::<QemuMetadata>(metadata.clone()) else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        if let Some(pid) = saved.pid.filter(|pid| process::is_alive(*pid)) {
            tracing::info!(vm = %self.name, pid, "re-attaching to running qemu process");
            inner.adopted_pid = Some(pid);
        }
        inner.metadata = saved;
        Ok(())
    }

    fn start(&self, request: &StartRequest<'_>) -> Result<()> {
        if self.inner.lock().alive()? {
            return Ok(());
        }

        let pending_disk = self.inner.lock().pending_disk.take();
        if let Some(size) = pending_disk {
            tracing::info!(vm = %self.name, %size, "applying deferred disk resize");
            self.grow_image(size)
                .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))?;
        }

        let (arguments, mut metadata) = self.plan_launch(request)?;
        let mut process = self
            .launcher
            .launch(&self.name, &arguments, self.events_tx.clone())
            .map_err(|e| Error::start_failure(&self.name, e.diagnostic()))?;

        if request.resume {
            // The internal suspend image is consumed once loaded.
            if let Err(e) = process.send(&QmpCommand::delvm(SUSPEND_TAG)) {
                tracing::warn!(vm = %self.name, error = %e, "failed to drop suspend image");
            }
        }

        metadata.pid = Some(process.pid());
        let mut inner = self.inner.lock();
        inner.metadata = metadata;
        inner.adopted_pid = None;
        inner.process = Some(process);
        Ok(())
    }

    fn shutdown(&self, policy: ShutdownPolicy, timeout: Duration) -> Result<()> {
        let (alive, adopted) = {
            let mut inner = self.inner.lock();
            let alive = inner.alive()?;
            (alive, inner.process.is_none().then_some(inner.adopted_pid).flatten())
        };

        if !alive {
            if policy == ShutdownPolicy::Forced && self.has_suspend_image()? {
                tracing::info!(vm = %self.name, "discarding suspended state");
                self.qemu_img(&["snapshot", "-d", SUSPEND_TAG])
                    .map_err(|e| self.failed("discard suspend image", e))?;
            }
            return Ok(());
        }

        if let Some(pid) = adopted {
            process::terminate(pid, self.kill_timeout)?;
            self.inner.lock().adopted_pid = None;
            return Ok(());
        }

        match policy {
            ShutdownPolicy::Graceful => {
                self.send(QmpCommand::system_powerdown())
                    .map_err(|e| self.failed("shutdown", e))?;
                self.wait_exit("qemu powerdown", timeout)
            }
            ShutdownPolicy::Forced => {
                if let Some(process) = self.inner.lock().process.as_mut() {
                    process.kill().map_err(|e| self.failed("power off", e))?;
                }
                self.wait_exit("qemu kill", self.kill_timeout)
            }
        }
    }

    fn suspend(&self) -> Result<()> {
        {
            let mut inner = self.inner.lock();
            if !inner.alive()? {
                return Ok(());
            }
            if inner.process.is_none() {
                return Err(self.failed(
                    "suspend",
                    Error::command_failed("qmp", "no monitor connection to re-attached process"),
                ));
            }
        }

        self.execute(QmpCommand::stop(), self.kill_timeout)
            .map_err(|e| self.failed("suspend", e))?;

        let saved = self
            .execute(QmpCommand::savevm(SUSPEND_TAG), self.suspend_timeout)
            .and_then(|output| hmp_output("savevm", &output));
        if let Err(e) = saved {
            tracing::warn!(vm = %self.name, error = %e, "savevm failed, resuming guest");
            if let Err(resume) = self.send(QmpCommand::cont()) {
                tracing::warn!(vm = %self.name, error = %resume, "failed to resume guest");
            }
            return Err(self.failed("suspend", e));
        }

        self.send(QmpCommand::quit())
            .map_err(|e| self.failed("suspend", e))?;

        self.wait_exit("qemu suspend", self.suspend_timeout)?;
        self.inner.lock().metadata.pid = None;
        Ok(())
    }

    fn current_state(&self) -> Result<VmState> {
        if self.inner.lock().alive()? {
            return Ok(VmState::Running);
        }
        Ok(if self.has_suspend_image()? {
            VmState::Suspended
        } else {
            VmState::Off
        })
    }

    fn update_cpus(&self, num_cores: u32, _running: bool) -> Result<()> {
        tracing::debug!(vm = %self.name, num_cores, "cpu count applies on next start");
        Ok(())
    }

    fn resize_memory(&self, size: MemorySize, _running: bool) -> Result<()> {
        tracing::debug!(vm = %self.name, %size, "memory size applies on next start");
        Ok(())
    }

    fn resize_disk(&self, size: MemorySize, running: bool) -> Result<()> {
        if running {
            tracing::debug!(vm = %self.name, %size, "disk resize deferred to next start");
            self.inner.lock().pending_disk = Some(size);
            return Ok(());
        }
        self.grow_image(size).map_err(|e| self.failed("resize disk", e))
    }

    fn add_network_interface(
        &self,
        _index: usize,
        _default_mac: &str,
        interface: &NetworkInterface,
    ) -> Result<()> {
        tracing::debug!(vm = %self.name, id = %interface.id, "interface applies on next start");
        Ok(())
    }

    fn management_ipv4(&self) -> Result<Option<Ipv4Addr>> {
        let output = self.runner.run_checked(
            "ip",
            &args(["neigh", "show", "dev", self.settings.bridge.as_str()]),
        )?;
        Ok(parse_neighbour(&output, &self.default_mac))
    }

    fn metadata(&self) -> Value {
        let inner = self.inner.lock();
        let mut metadata = inner.metadata.clone();
        metadata.pid = inner.pid();
        serde_json::to_value(metadata).unwrap_or(Value::Null)
    }

    fn take_events(&self) -> Option<Receiver<BackendEvent>> {
        self.events_rx.lock().take()
    }

    fn capture_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.require_stopped("take snapshot")?;
        self.qemu_img(&["snapshot", "-c", snapshot.tag().as_str()])
            .map(drop)
            .map_err(|e| self.failed("take snapshot", e))
    }

    fn apply_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.require_stopped("restore snapshot")?;
        self.qemu_img(&["snapshot", "-a", snapshot.tag().as_str()])
            .map(drop)
            .map_err(|e| self.failed("restore snapshot", e))
    }

    fn erase_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        self.require_stopped("delete snapshot")?;
        self.qemu_img(&["snapshot", "-d", snapshot.tag().as_str()])
            .map(drop)
            .map_err(|e| self.failed("delete snapshot", e))
    }

    fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        Ok(host_interfaces(&self.sys_class_net)?
            .into_iter()
            .filter(|n| n.id != self.settings.bridge)
            .collect())
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Shared view of a mock QEMU process.
    #[derive(Default)]
    pub struct MockProcessState {
        pub sent: Vec<String>,
        pub exited: Option<Option<i32>>,
        pub killed: bool,
        /// Exit when `system_powerdown` arrives.
        pub obey_powerdown: bool,
        /// HMP output returned for `savevm`.
        pub savevm_error: Option<String>,
    }

    pub struct MockQemuProcess {
        pid: u32,
        state: Arc<Mutex<MockProcessState>>,
        events: Sender<BackendEvent>,
    }

    impl MockQemuProcess {
        fn record(&self, state: &mut MockProcessState, command: &QmpCommand) -> Result<String> {
            if state.exited.is_some() {
                return Err(Error::Io(std::io::Error::from(std::io::ErrorKind::BrokenPipe)));
            }
            let line = match &command.arguments {
                Some(Value::Object(a)) => match a.get("command-line").and_then(Value::as_str) {
                    Some(cmd) => format!("{} {}", command.execute, cmd),
                    None => command.execute.clone(),
                },
                _ => command.execute.clone(),
            };
            state.sent.push(line.clone());
            match command.execute.as_str() {
                "quit" => self.exit(state, Some(0)),
                "system_powerdown" if state.obey_powerdown => self.exit(state, Some(0)),
                _ => {}
            }
            Ok(line)
        }

        fn exit(&self, state: &mut MockProcessState, code: Option<i32>) {
            if state.exited.is_none() {
                state.exited = Some(code);
                let _ = self.events.send(BackendEvent::Exited { code });
            }
        }
    }

    impl QemuProcess for MockQemuProcess {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn send(&mut self, command: &QmpCommand) -> Result<()> {
            let mut state = self.state.lock();
            self.record(&mut state, command).map(drop)
        }

        fn request(&mut self, command: &QmpCommand) -> Result<Receiver<Reply>> {
            let mut state = self.state.lock();
            let line = self.record(&mut state, command)?;
            let reply = if line.starts_with("human-monitor-command savevm") {
                Value::String(state.savevm_error.clone().unwrap_or_default())
            } else if command.execute == "human-monitor-command" {
                Value::String(String::new())
            } else {
                Value::Object(Default::default())
            };
            let (tx, rx) = mpsc::channel();
            let _ = tx.send(Ok(reply));
            Ok(rx)
        }

        fn try_wait(&mut self) -> Result<Option<Option<i32>>> {
            Ok(self.state.lock().exited)
        }

        fn kill(&mut self) -> Result<()> {
            let mut state = self.state.lock();
            state.killed = true;
            self.exit(&mut state, None);
            Ok(())
        }
    }

    /// Launcher recording argument lists and handing out mock processes.
    #[derive(Default)]
    pub struct MockQemuLauncher {
        pub launches: Mutex<Vec<Vec<String>>>,
        pub processes: Mutex<Vec<Arc<Mutex<MockProcessState>>>>,
        pub obey_powerdown: bool,
        pub fail_with: Option<String>,
        pub savevm_error: Option<String>,
    }

    impl MockQemuLauncher {
        pub fn last(&self) -> Arc<Mutex<MockProcessState>> {
            self.processes.lock().last().cloned().unwrap_or_default()
        }
    }

    impl QemuLauncher for MockQemuLauncher {
        fn launch(
            &self,
            name: &str,
            arguments: &[String],
            events: Sender<BackendEvent>,
        ) -> Result<Box<dyn QemuProcess>> {
            self.launches.lock().push(arguments.to_vec());
            if let Some(reason) = &self.fail_with {
                return Err(Error::start_failure(name, reason.clone()));
            }
            let state = Arc::new(Mutex::new(MockProcessState {
                obey_powerdown: self.obey_powerdown,
                savevm_error: self.savevm_error.clone(),
                ..Default::default()
            }));
            self.processes.lock().push(Arc::clone(&state));
            let _ = events.send(BackendEvent::Started);
            Ok(Box::new(MockQemuProcess {
                pid: 4242,
                state,
                events,
            }))
        }
    }
}
