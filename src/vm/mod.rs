//! Virtual machine lifecycle orchestration.
//!
//! A [`VirtualMachine`] owns one instance: its description, its snapshot
//! tree and the [`BackendDriver`] that talks to the hypervisor. Foreground
//! transitions (start, shutdown, suspend, resize, snapshots) are serialized
//! by an operation lock. The cached [`VmState`] lives behind a separate,
//! short-lived lock so status queries and backend events never wait behind
//! a slow native call.
//!
//! Every transition is reported to the [`VmStatusMonitor`] before the call
//! that caused it returns.

pub mod backend;
pub mod description;
pub mod monitor;
pub mod shutdown;
pub mod snapshot;
pub mod state;

#[cfg(test)]
mod testing;

pub use backend::{BackendDriver, BackendEvent, BackendKind, Capabilities, Capability, StartRequest};
pub use description::{MemorySize, NetworkInterface, VirtualMachineDescription};
pub use monitor::{StateStore, VmStatusMonitor};
pub use shutdown::DelayedShutdownTimer;
pub use snapshot::{Snapshot, SnapshotTree, VmSpecs};
pub use state::{ShutdownPolicy, VmState};

use crate::cloud_init::CloudInitConfigurator;
use crate::config::Timeouts;
use crate::error::{CapabilityError, Error, Result};
use crate::network::NetworkInterfaceInfo;
use crate::process::CommandOutput;
use crate::ssh::{SshConnector, SshKeyProvider, SshSession};
use crate::utils::{
    parse_ipv4_addresses, try_action_for, RetrySchedule, TimeoutAction, LIST_IPV4_COMMAND,
};
use backend::STATE_POLL_INTERVAL;
use parking_lot::Mutex;
use serde_json::Value;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// How often the event thread checks whether its instance is gone.
const EVENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Probe cadence while a shutdown waits for an interrupted start to exit.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Collaborators shared by every instance of a daemon.
#[derive(Clone)]
pub struct VmServices {
    /// Receives state changes and stores backend metadata.
    pub monitor: Arc<dyn VmStatusMonitor>,
    /// Opens guest SSH sessions.
    pub ssh: Arc<dyn SshConnector>,
    /// Key used for every guest session.
    pub keys: Arc<dyn SshKeyProvider>,
    /// Rewrites cloud-init seeds after network changes.
    pub cloud_init: Arc<dyn CloudInitConfigurator>,
}

/// One managed instance.
pub struct VirtualMachine {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    instance_dir: PathBuf,
    backend: Box<dyn BackendDriver>,
    services: VmServices,
    timeouts: Timeouts,
    /// Serializes foreground transitions.
    op_lock: Mutex<()>,
    cache: Mutex<Cache>,
    description: Mutex<VirtualMachineDescription>,
    snapshots: Mutex<SnapshotTree>,
    session: Mutex<Option<Box<dyn SshSession>>>,
    /// Cleared on drop so the final suspend leaves the persisted state alone.
    update_suspend_status: AtomicBool,
    suspend_on_drop: AtomicBool,
}

#[derive(Default)]
struct Cache {
    state: VmState,
    /// Bumped on every write; a probe that started before a bump is stale.
    epoch: u64,
    /// A foreground shutdown or suspend is waiting for the native process to go away.
    expecting_exit: bool,
    /// Wakes a shutdown that interrupted a start.
    exit_waiter: Option<Sender<()>>,
    /// Set when a shutdown interrupted a start; cleared by the next start.
    start_aborted: bool,
    management_ip: Option<Ipv4Addr>,
    last_error: Option<String>,
}

impl Inner {
    fn monitor(&self) -> &dyn VmStatusMonitor {
        self.services.monitor.as_ref()
    }

    /// Persist `state` if it changed, then write it into the cache.
    ///
    /// The cache keeps its old value when persisting fails.
    fn store_state(&self, cache: &mut Cache, state: VmState) -> Result<()> {
        cache.epoch += 1;
        if cache.state == state {
            return Ok(());
        }

        self.monitor().persist_state_for(&self.name, state)?;
        tracing::debug!(vm = %self.name, from = %cache.state, to = %state, "state change");
        cache.state = state;
        Ok(())
    }

    /// Store a state the orchestrator itself asked for.
    ///
    /// Unlike backend truth, these moves must follow the lifecycle table.
    fn transition(&self, cache: &mut Cache, next: VmState) -> Result<()> {
        if !cache.state.can_transition_to(next) {
            return Err(Error::invalid_state(
                format!("a state that may move to {}", next),
                cache.state,
            ));
        }
        self.store_state(cache, next)
    }

    /// Ask the backend, mapping an unreachable backend to `Unknown`.
    fn probe(&self) -> VmState {
        match self.backend.current_state() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!(vm = %self.name, error = %e, "could not query backend state");
                VmState::Unknown
            }
        }
    }

    /// Probe and merge into the cache.
    ///
    /// The probe runs without any lock held. Its result is dropped if a
    /// foreground transition wrote the cache in the meantime or is still
    /// waiting for the native process to exit.
    fn refresh_state(&self) -> VmState {
        let epoch = self.cache.lock().epoch;
        let probed = self.probe();

        let mut cache = self.cache.lock();
        if cache.epoch != epoch || cache.expecting_exit {
            return cache.state;
        }

        let next = VmState::reconcile(cache.state, probed);
        if let Err(e) = self.store_state(&mut cache, next) {
            tracing::warn!(vm = %self.name, error = %e, "failed to persist state");
        }
        next
    }

    /// Resync the cache to backend truth after a failed transition.
    fn resync_after_failure(&self, error: &Error) {
        let truth = match self.probe() {
            VmState::Starting | VmState::Suspending => VmState::Unknown,
            state => state,
        };

        let mut cache = self.cache.lock();
        cache.expecting_exit = false;
        cache.last_error = Some(error.diagnostic());
        if let Err(e) = self.store_state(&mut cache, truth) {
            tracing::warn!(vm = %self.name, error = %e, "failed to persist state");
        }
    }

    /// One step of waiting for a start to settle.
    ///
    /// Promotes `Starting` to `Running` once the backend agrees, and fails
    /// fast when the instance stopped or a shutdown interrupted the start.
    /// An interrupting shutdown keeps waiting for the real exit.
    fn confirm_running(&self) -> Result<bool> {
        let epoch = self.cache.lock().epoch;
        let probed = self.probe();

        let mut cache = self.cache.lock();
        if cache.start_aborted {
            return Err(Error::start_failure(&self.name, "Instance shutdown during start"));
        }
        if cache.epoch != epoch || cache.expecting_exit {
            return Ok(false);
        }

        match probed {
            VmState::Running if cache.state == VmState::Starting => {
                self.transition(&mut cache, VmState::Running)?;
                Ok(true)
            }
            VmState::Running => Ok(true),
            VmState::Starting | VmState::Restarting | VmState::Unknown => Ok(false),
            stopped => {
                self.store_state(&mut cache, stopped)?;
                let reason = cache
                    .last_error
                    .clone()
                    .unwrap_or_else(|| format!("instance is {}", stopped));
                Err(Error::VmNotRunning {
                    name: self.name.clone(),
                    reason,
                })
            }
        }
    }

    fn drop_session(&self) {
        if self.session.lock().take().is_some() {
            tracing::debug!(vm = %self.name, "dropped ssh session");
        }
    }

    fn handle_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Started => tracing::debug!(vm = %self.name, "native process started"),
            BackendEvent::Resumed => tracing::debug!(vm = %self.name, "execution resumed"),
            BackendEvent::PoweringDown => tracing::info!(vm = %self.name, "guest is powering down"),
            BackendEvent::Error(message) => {
                tracing::warn!(vm = %self.name, error = %message, "backend reported an error");
                self.cache.lock().last_error = Some(message);
            }
            BackendEvent::Restarting => {
                {
                    let mut cache = self.cache.lock();
                    cache.management_ip = None;
                    if let Err(e) = self.store_state(&mut cache, VmState::Restarting) {
                        tracing::warn!(vm = %self.name, error = %e, "failed to persist state");
                    }
                }
                self.drop_session();
                self.monitor().on_restart(&self.name);
            }
            BackendEvent::Exited { code } => {
                {
                    let mut cache = self.cache.lock();
                    if let Some(waiter) = cache.exit_waiter.take() {
                        let _ = waiter.send(());
                        return;
                    }
                    // A suspended QEMU quits after saving; that exit may land
                    // after the suspend already finished.
                    if cache.expecting_exit
                        || cache.state.is_stopped()
                        || matches!(cache.state, VmState::Suspending | VmState::Suspended)
                    {
                        tracing::debug!(vm = %self.name, ?code, "expected exit");
                        return;
                    }

                    tracing::info!(vm = %self.name, ?code, "instance exited");
                    cache.management_ip = None;
                    if let Err(e) = self.store_state(&mut cache, VmState::Off) {
                        tracing::warn!(vm = %self.name, error = %e, "failed to persist state");
                    }
                }
                self.drop_session();
                self.monitor().on_shutdown();
            }
        }
    }
}

fn watch_events(inner: Weak<Inner>, events: Receiver<BackendEvent>) {
    loop {
        match events.recv_timeout(EVENT_POLL_INTERVAL) {
            Ok(event) => match inner.upgrade() {
                Some(inner) => inner.handle_event(event),
                None => return,
            },
            Err(RecvTimeoutError::Timeout) => {
                if inner.strong_count() == 0 {
                    return;
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

impl VirtualMachine {
    /// Take ownership of an instance.
    ///
    /// Loads the snapshot tree from `instance_dir`, hands any stored backend
    /// metadata to the driver and starts listening for backend events.
    pub fn new(
        description: VirtualMachineDescription,
        backend: Box<dyn BackendDriver>,
        services: VmServices,
        timeouts: Timeouts,
        instance_dir: impl Into<PathBuf>,
    ) -> Result<Self> {
        description.validate()?;
        let name = description.name.clone();
        let instance_dir = instance_dir.into();

        let metadata = services.monitor.retrieve_metadata_for(&name)?;
        backend.reattach(&metadata)?;
        let snapshots = SnapshotTree::load(&name, &instance_dir)?;

        let inner = Arc::new(Inner {
            name: name.clone(),
            instance_dir,
            backend,
            services,
            timeouts,
            op_lock: Mutex::new(()),
            cache: Mutex::new(Cache::default()),
            description: Mutex::new(description),
            snapshots: Mutex::new(snapshots),
            session: Mutex::new(None),
            update_suspend_status: AtomicBool::new(true),
            suspend_on_drop: AtomicBool::new(true),
        });

        let initial = inner.probe();
        inner.cache.lock().state = initial;

        if let Some(events) = inner.backend.take_events() {
            let weak = Arc::downgrade(&inner);
            std::thread::Builder::new()
                .name(format!("{}-events", name))
                .spawn(move || watch_events(weak, events))?;
        }

        tracing::debug!(vm = %name, backend = %inner.backend.kind(), state = %initial, "instance loaded");
        Ok(Self { inner })
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Directory holding the instance's files.
    pub fn instance_dir(&self) -> &Path {
        &self.inner.instance_dir
    }

    /// Copy of the current description.
    pub fn description(&self) -> VirtualMachineDescription {
        self.inner.description.lock().clone()
    }

    /// Backend driving this instance.
    pub fn backend_kind(&self) -> BackendKind {
        self.inner.backend.kind()
    }

    /// Optional features of the backend.
    pub fn capabilities(&self) -> Capabilities {
        self.inner.backend.capabilities()
    }

    /// Fail unless the backend can suspend.
    pub fn require_suspend_support(&self) -> std::result::Result<(), CapabilityError> {
        self.inner.backend.require_suspend_support()
    }

    /// Fail unless the backend can snapshot.
    pub fn require_snapshots_support(&self) -> std::result::Result<(), CapabilityError> {
        self.inner.backend.require_snapshots_support()
    }

    /// Fail unless the backend can clone.
    pub fn require_clone_support(&self) -> std::result::Result<(), CapabilityError> {
        self.inner.backend.require_clone_support()
    }

    /// Whether dropping this handle suspends a running instance (the default).
    ///
    /// Short-lived front ends turn this off so the instance keeps running
    /// after they exit.
    pub fn set_suspend_on_drop(&self, enabled: bool) {
        self.inner.suspend_on_drop.store(enabled, Ordering::SeqCst);
    }

    /// Last diagnostic reported by the backend or a failed operation.
    pub fn last_error(&self) -> Option<String> {
        self.inner.cache.lock().last_error.clone()
    }

    /// Cached state, without probing.
    pub fn cached_state(&self) -> VmState {
        self.inner.cache.lock().state
    }

    /// Probe the backend and return the reconciled state.
    ///
    /// Never fails: an unreachable backend reports `Unknown`.
    pub fn current_state(&self) -> VmState {
        self.inner.refresh_state()
    }

    /// Boot or resume the instance.
    ///
    /// Leaves the instance in `Starting`; [`Self::ensure_vm_is_running`]
    /// confirms the boot.
    pub fn start(&self) -> Result<()> {
        let inner = &*self.inner;
        let _op = inner.op_lock.lock();

        let state = inner.refresh_state();
        match state {
            s if s.is_running() => {
                tracing::info!(vm = %inner.name, "already running");
                return Ok(());
            }
            VmState::Starting => {
                tracing::info!(vm = %inner.name, "already starting");
                return Ok(());
            }
            s if !s.can_start() => {
                return Err(Error::invalid_state("stopped or suspended", s));
            }
            _ => {}
        }

        let resume = state == VmState::Suspended;
        let metadata = if resume {
            tracing::info!(vm = %inner.name, "resuming from a suspended state");
            inner.monitor().retrieve_metadata_for(&inner.name)?
        } else {
            tracing::info!(vm = %inner.name, "starting instance");
            Value::Object(Default::default())
        };

        {
            let mut cache = inner.cache.lock();
            cache.start_aborted = false;
            cache.last_error = None;
            cache.management_ip = None;
            inner.transition(&mut cache, VmState::Starting)?;
        }

        let desc = inner.description.lock().clone();
        let request = StartRequest {
            description: &desc,
            resume,
            metadata: &metadata,
        };

        if let Err(e) = inner.backend.start(&request) {
            tracing::error!(vm = %inner.name, error = %e, "start failed");
            inner.resync_after_failure(&e);
            return Err(match e {
                Error::StartFailure { .. } => e,
                other => Error::start_failure(&inner.name, other.diagnostic()),
            });
        }

        let saved = inner.backend.metadata();
        if !saved.is_null() {
            inner.monitor().update_metadata_for(&inner.name, &saved)?;
        }
        if resume {
            inner.monitor().on_resume();
        }
        Ok(())
    }

    /// Wait up to the configured start timeout for the instance to run.
    pub fn ensure_vm_is_running(&self) -> Result<()> {
        self.ensure_vm_is_running_for(self.inner.timeouts.start)
    }

    /// Wait up to `timeout` for the instance to run.
    ///
    /// Fails with `VmNotRunning` (carrying the last diagnostic) if it
    /// stopped, and with a start failure if a shutdown interrupted the boot.
    pub fn ensure_vm_is_running_for(&self, timeout: Duration) -> Result<()> {
        try_action_for(
            "instance to run",
            timeout,
            RetrySchedule::every(STATE_POLL_INTERVAL),
            || {
                Ok(if self.inner.confirm_running()? {
                    TimeoutAction::Done(())
                } else {
                    TimeoutAction::Retry
                })
            },
        )
    }

    /// Power the instance off.
    ///
    /// A graceful request that fails or times out is retried forced. Calling
    /// this on a stopped instance does nothing.
    pub fn shutdown(&self, policy: ShutdownPolicy) -> Result<()> {
        let inner = &*self.inner;
        let _op = inner.op_lock.lock();

        let state = inner.refresh_state();
        if state.is_stopped() {
            tracing::info!(vm = %inner.name, %state, "ignoring shutdown, instance is not running");
            return Ok(());
        }
        if state == VmState::Suspended && policy == ShutdownPolicy::Graceful {
            tracing::info!(vm = %inner.name, "ignoring shutdown issued while suspended");
            return Ok(());
        }

        inner.drop_session();

        if state == VmState::Starting {
            return self.shutdown_while_starting();
        }

        tracing::info!(vm = %inner.name, %policy, "shutting down");
        {
            let mut cache = inner.cache.lock();
            cache.expecting_exit = true;
            cache.epoch += 1;
        }

        let result = match policy {
            ShutdownPolicy::Graceful => inner
                .backend
                .shutdown(ShutdownPolicy::Graceful, inner.timeouts.graceful_shutdown)
                .or_else(|e| {
                    tracing::warn!(vm = %inner.name, error = %e, "graceful shutdown failed, forcing");
                    inner
                        .backend
                        .shutdown(ShutdownPolicy::Forced, inner.timeouts.process_kill)
                }),
            ShutdownPolicy::Forced => inner
                .backend
                .shutdown(ShutdownPolicy::Forced, inner.timeouts.process_kill),
        };

        if let Err(e) = result {
            tracing::error!(vm = %inner.name, error = %e, "shutdown failed");
            inner.resync_after_failure(&e);
            return Err(match e {
                Error::Timeout { .. } | Error::NotSupported(_) => e,
                other => Error::operation_failed("shutdown", &inner.name, other.diagnostic()),
            });
        }

        let stopped = match inner.probe() {
            s if s.is_stopped() => s,
            _ => VmState::Off,
        };
        {
            let mut cache = inner.cache.lock();
            cache.expecting_exit = false;
            cache.management_ip = None;
            inner.store_state(&mut cache, stopped)?;
        }
        inner.monitor().on_shutdown();
        Ok(())
    }

    /// Stop a boot in progress.
    ///
    /// The cache moves to `Off` first so a concurrent
    /// [`Self::ensure_vm_is_running`] fails fast. Then the process is killed
    /// and we wait for it to go away: an exit event or a stopped probe
    /// releases us, bounded by the process-kill timeout.
    fn shutdown_while_starting(&self) -> Result<()> {
        let inner = &*self.inner;
        tracing::info!(vm = %inner.name, "shutdown issued while starting, aborting start");

        let (tx, rx) = mpsc::channel();
        {
            let mut cache = inner.cache.lock();
            inner.transition(&mut cache, VmState::Off)?;
            cache.start_aborted = true;
            cache.expecting_exit = true;
            cache.exit_waiter = Some(tx);
            cache.management_ip = None;
        }

        if let Err(e) = inner
            .backend
            .shutdown(ShutdownPolicy::Forced, inner.timeouts.process_kill)
        {
            tracing::warn!(vm = %inner.name, error = %e, "failed to stop starting instance");
        }

        let deadline = Instant::now() + inner.timeouts.process_kill;
        loop {
            match rx.recv_timeout(EXIT_POLL_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    if matches!(inner.backend.current_state(), Ok(s) if s.is_stopped()) {
                        break;
                    }
                    if Instant::now() >= deadline {
                        tracing::warn!(vm = %inner.name, "timed out waiting for the instance to exit");
                        break;
                    }
                }
            }
        }

        {
            let mut cache = inner.cache.lock();
            cache.exit_waiter = None;
            cache.expecting_exit = false;
            cache.epoch += 1;
        }
        inner.monitor().on_shutdown();
        Ok(())
    }

    /// Save the instance state to disk and stop it.
    ///
    /// Capability is checked before anything else. Suspending a stopped or
    /// already suspended instance does nothing.
    pub fn suspend(&self) -> Result<()> {
        let inner = &*self.inner;
        inner.backend.require_suspend_support()?;
        let _op = inner.op_lock.lock();

        let update = inner.update_suspend_status.load(Ordering::SeqCst);
        let state = inner.refresh_state();
        match state {
            s if s.can_suspend() => {
                inner.drop_session();
                tracing::info!(vm = %inner.name, "suspending");
                {
                    let mut cache = inner.cache.lock();
                    if update {
                        inner.transition(&mut cache, VmState::Suspending)?;
                    } else {
                        cache.epoch += 1;
                    }
                    cache.expecting_exit = true;
                }

                if let Err(e) = inner.backend.suspend() {
                    tracing::error!(vm = %inner.name, error = %e, "suspend failed");
                    inner.resync_after_failure(&e);
                    return Err(match e {
                        Error::NotSupported(_) => e,
                        other => Error::operation_failed("suspend", &inner.name, other.diagnostic()),
                    });
                }

                let saved = inner.backend.metadata();
                if !saved.is_null() {
                    inner.monitor().update_metadata_for(&inner.name, &saved)?;
                }

                let mut cache = inner.cache.lock();
                cache.expecting_exit = false;
                cache.management_ip = None;
                if update {
                    inner.transition(&mut cache, VmState::Suspended)?;
                } else {
                    cache.epoch += 1;
                }
            }
            s if s.is_stopped() => {
                tracing::info!(vm = %inner.name, "ignoring suspend issued while stopped");
            }
            VmState::Suspended | VmState::Suspending => {
                tracing::info!(vm = %inner.name, "ignoring suspend, already suspended");
            }
            other => return Err(Error::invalid_state("running", other)),
        }

        inner.monitor().on_suspend();
        Ok(())
    }

    /// Move a running instance into `DelayedShutdown`; returns the state to
    /// restore if the countdown is cancelled.
    pub(crate) fn enter_delayed_shutdown(&self) -> Result<VmState> {
        let inner = &*self.inner;
        let _op = inner.op_lock.lock();

        let state = inner.refresh_state();
        if state != VmState::Running {
            return Err(Error::invalid_state("running", state));
        }
        let mut cache = inner.cache.lock();
        inner.transition(&mut cache, VmState::DelayedShutdown)?;
        Ok(state)
    }

    /// Undo [`Self::enter_delayed_shutdown`] unless the instance already
    /// left `DelayedShutdown`. Returns whether anything was restored.
    pub(crate) fn leave_delayed_shutdown(&self, prior: VmState) -> Result<bool> {
        let inner = &*self.inner;
        let _op = inner.op_lock.lock();

        let mut cache = inner.cache.lock();
        if cache.state != VmState::DelayedShutdown {
            return Ok(false);
        }
        inner.transition(&mut cache, prior)?;
        Ok(true)
    }

    /// User to log in as.
    pub fn ssh_username(&self) -> String {
        self.inner.description.lock().ssh_username.clone()
    }

    /// Port the guest's SSH server listens on.
    pub fn ssh_port(&self) -> u16 {
        self.inner.backend.ssh_port()
    }

    /// Management address, if the backend already knows it.
    pub fn management_ipv4(&self) -> Option<Ipv4Addr> {
        let inner = &*self.inner;
        if let Some(ip) = inner.cache.lock().management_ip {
            return Some(ip);
        }

        match inner.backend.management_ipv4() {
            Ok(Some(ip)) => {
                inner.cache.lock().management_ip = Some(ip);
                Some(ip)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::debug!(vm = %inner.name, error = %e, "management address lookup failed");
                None
            }
        }
    }

    /// Host to SSH to, waiting up to `timeout` for the guest network.
    pub fn ssh_hostname(&self, timeout: Duration) -> Result<String> {
        let inner = &*self.inner;
        if let Some(ip) = inner.cache.lock().management_ip {
            return Ok(ip.to_string());
        }

        let schedule = RetrySchedule {
            initial: inner.timeouts.network_settle_retry,
            backoff: inner.timeouts.network_settle_backoff,
        };
        let ip = try_action_for("management address", timeout, schedule, || {
            inner.confirm_running()?;
            match inner.backend.management_ipv4() {
                Ok(Some(ip)) => Ok(TimeoutAction::Done(ip)),
                Ok(None) => Ok(TimeoutAction::Retry),
                Err(e) => {
                    tracing::debug!(vm = %inner.name, error = %e, "management address not ready");
                    Ok(TimeoutAction::Retry)
                }
            }
        })
        .map_err(|e| match e {
            Error::Timeout { .. } => Error::operation_failed(
                "address discovery",
                &inner.name,
                "failed to determine IP address",
            ),
            other => other,
        })?;

        inner.cache.lock().management_ip = Some(ip);
        Ok(ip.to_string())
    }

    fn connect_session(&self) -> Result<Box<dyn SshSession>> {
        let inner = &*self.inner;
        let host = self.ssh_hostname(inner.timeouts.ip_discovery)?;
        let username = self.ssh_username();
        inner.services.ssh.connect(
            &host,
            inner.backend.ssh_port(),
            &username,
            inner.services.keys.as_ref(),
        )
    }

    /// Run a command in the guest, opening the session on first use.
    ///
    /// A session that fails at the transport level is discarded.
    pub fn ssh_exec(&self, command: &str) -> Result<CommandOutput> {
        let fresh = if self.inner.session.lock().is_none() {
            Some(self.connect_session()?)
        } else {
            None
        };

        let mut guard = self.inner.session.lock();
        if let Some(fresh) = fresh {
            guard.get_or_insert(fresh);
        }

        let result = match guard.as_mut() {
            Some(session) => session.exec(command),
            None => Err(Error::Ssh("session closed".into())),
        };
        if matches!(result, Err(Error::Ssh(_))) {
            *guard = None;
        }
        result
    }

    /// Close the guest session, if any.
    pub fn drop_ssh_session(&self) {
        self.inner.drop_session();
    }

    /// Every IPv4 address the guest reports, filtered for the backend.
    ///
    /// Empty unless the instance is running.
    pub fn get_all_ipv4(&self) -> Result<Vec<Ipv4Addr>> {
        if !self.cached_state().is_running() {
            return Ok(Vec::new());
        }

        let output = self.ssh_exec(LIST_IPV4_COMMAND)?;
        if !output.success() {
            return Err(Error::Ssh(output.diagnostic()));
        }
        let addresses = parse_ipv4_addresses(&output.stdout)?;
        Ok(self.inner.backend.filter_ipv4(addresses))
    }

    fn save_description(&self, desc: &VirtualMachineDescription) -> Result<()> {
        desc.save(&self.inner.instance_dir)
    }

    /// Change the vCPU count.
    pub fn update_cpus(&self, num_cores: u32) -> Result<()> {
        if num_cores == 0 {
            return Err(Error::InvalidResize {
                what: "cpus",
                reason: "core count must be positive".into(),
            });
        }

        let inner = &*self.inner;
        let _op = inner.op_lock.lock();
        let running = inner.refresh_state().is_running();

        inner.backend.update_cpus(num_cores, running)?;

        let mut desc = inner.description.lock();
        desc.num_cores = num_cores;
        self.save_description(&desc)?;
        tracing::info!(vm = %inner.name, num_cores, "updated cpus");
        Ok(())
    }

    /// Change the memory size.
    pub fn resize_memory(&self, size: MemorySize) -> Result<()> {
        if size.is_zero() {
            return Err(Error::InvalidResize {
                what: "memory",
                reason: "size must be positive".into(),
            });
        }

        let inner = &*self.inner;
        let _op = inner.op_lock.lock();
        let running = inner.refresh_state().is_running();

        inner.backend.resize_memory(size, running)?;

        let mut desc = inner.description.lock();
        desc.mem_size = size;
        self.save_description(&desc)?;
        tracing::info!(vm = %inner.name, %size, "resized memory");
        Ok(())
    }

    /// Grow the disk. Shrinking is rejected.
    pub fn resize_disk(&self, size: MemorySize) -> Result<()> {
        let inner = &*self.inner;
        let _op = inner.op_lock.lock();

        let current = inner.description.lock().disk_space;
        if size < current {
            return Err(Error::InvalidResize {
                what: "disk",
                reason: format!("disk can only grow (current {}, requested {})", current, size),
            });
        }

        let running = inner.refresh_state().is_running();

        inner.backend.resize_disk(size, running)?;

        let mut desc = inner.description.lock();
        desc.disk_space = size;
        self.save_description(&desc)?;
        tracing::info!(vm = %inner.name, %size, "resized disk");
        Ok(())
    }

    /// Attach an extra network interface and refresh the guest's
    /// cloud-init network config.
    pub fn add_network_interface(&self, interface: NetworkInterface) -> Result<()> {
        let inner = &*self.inner;
        let _op = inner.op_lock.lock();

        if inner.refresh_state().is_running() {
            inner.backend.require(Capability::NetworkHotAdd)?;
        }

        let (index, default_mac) = {
            let desc = inner.description.lock();
            (desc.extra_interfaces.len(), desc.default_mac.clone())
        };
        inner
            .backend
            .add_network_interface(index, &default_mac, &interface)?;

        let desc = {
            let mut desc = inner.description.lock();
            desc.extra_interfaces.push(interface);
            self.save_description(&desc)?;
            desc.clone()
        };
        inner.services.cloud_init.update_network_config(&desc)?;
        tracing::info!(vm = %inner.name, index, "added network interface");
        Ok(())
    }

    /// Host networks the backend can bridge to.
    pub fn networks(&self) -> Result<Vec<NetworkInterfaceInfo>> {
        self.inner.backend.networks()
    }

    /// Capture a snapshot. An empty `name` gets a generated one.
    ///
    /// The tree is only updated once the backend capture succeeded. If the
    /// tree cannot be saved the capture is erased again.
    pub fn take_snapshot(&self, name: &str, comment: &str) -> Result<Snapshot> {
        let inner = &*self.inner;
        inner.backend.require_snapshots_support()?;
        let _op = inner.op_lock.lock();

        let state = inner.refresh_state();
        let desc = inner.description.lock().clone();
        let instance_id = inner.services.cloud_init.instance_id(&desc)?;

        let mut tree = inner.snapshots.lock();
        let name = if name.is_empty() {
            tree.generate_name()
        } else {
            name.to_string()
        };
        let snapshot = tree.prepare(&name, comment, VmSpecs::capture(&desc, state), &instance_id)?;

        inner.backend.capture_snapshot(&snapshot)?;

        let before = tree.clone();
        let registered = tree.register(snapshot.clone()).map(|_| ());
        let committed =
            registered.and_then(|()| save_or_revert(&mut tree, before, &inner.instance_dir));
        if let Err(e) = committed {
            if let Err(erase) = inner.backend.erase_snapshot(&snapshot) {
                tracing::warn!(
                    vm = %inner.name,
                    snapshot = %snapshot.name(),
                    error = %erase,
                    "failed to discard captured snapshot"
                );
            }
            return Err(e);
        }
        tracing::info!(vm = %inner.name, snapshot = %snapshot.name(), "took snapshot");
        Ok(snapshot)
    }

    /// Delete a snapshot, promoting its children to its parent.
    pub fn delete_snapshot(&self, name: &str) -> Result<Snapshot> {
        let inner = &*self.inner;
        inner.backend.require_snapshots_support()?;
        let _op = inner.op_lock.lock();

        let mut tree = inner.snapshots.lock();
        let deleted = tree.delete_with(name, |s| inner.backend.erase_snapshot(s))?;
        tree.save(&inner.instance_dir)?;
        tracing::info!(vm = %inner.name, snapshot = %name, "deleted snapshot");
        Ok(deleted)
    }

    /// Roll the instance back to a snapshot. The instance must be stopped.
    pub fn restore_snapshot(&self, name: &str) -> Result<()> {
        let inner = &*self.inner;
        inner.backend.require_snapshots_support()?;
        let _op = inner.op_lock.lock();

        let state = inner.refresh_state();
        if !state.is_stopped() {
            return Err(Error::invalid_state("stopped", state));
        }

        let mut tree = inner.snapshots.lock();
        let snapshot = tree.get(name)?.clone();
        inner.backend.apply_snapshot(&snapshot)?;

        {
            let mut desc = inner.description.lock();
            snapshot.specs().apply_to(&mut desc);
            self.save_description(&desc)?;
        }
        tree.set_head(name)?;
        tree.save(&inner.instance_dir)?;
        tracing::info!(vm = %inner.name, snapshot = %name, "restored snapshot");
        Ok(())
    }

    /// Rename a snapshot.
    pub fn rename_snapshot(&self, old: &str, new: &str) -> Result<()> {
        let mut tree = self.inner.snapshots.lock();
        let before = tree.clone();
        tree.rename(old, new)?;
        save_or_revert(&mut tree, before, &self.inner.instance_dir)
    }

    /// Replace a snapshot's comment.
    pub fn set_snapshot_comment(&self, name: &str, comment: &str) -> Result<()> {
        let mut tree = self.inner.snapshots.lock();
        let before = tree.clone();
        tree.set_comment(name, comment)?;
        save_or_revert(&mut tree, before, &self.inner.instance_dir)
    }

    /// Look up a snapshot.
    pub fn get_snapshot(&self, name: &str) -> Result<Snapshot> {
        self.inner.snapshots.lock().get(name).cloned()
    }

    /// All snapshots in index order.
    pub fn list_snapshots(&self) -> Vec<Snapshot> {
        self.inner.snapshots.lock().list().cloned().collect()
    }

    /// The snapshot the next one will be parented to.
    pub fn head_snapshot(&self) -> Option<Snapshot> {
        self.inner.snapshots.lock().head().cloned()
    }
}

/// Save `tree`, putting `before` back if that fails.
fn save_or_revert(tree: &mut SnapshotTree, before: SnapshotTree, dir: &Path) -> Result<()> {
    if let Err(e) = tree.save(dir) {
        *tree = before;
        return Err(e);
    }
    Ok(())
}

impl Drop for VirtualMachine {
    fn drop(&mut self) {
        let inner = &*self.inner;
        inner.update_suspend_status.store(false, Ordering::SeqCst);

        if !inner.suspend_on_drop.load(Ordering::SeqCst)
            || inner.backend.require_suspend_support().is_err()
        {
            return;
        }

        if inner.probe() == VmState::Running {
            if let Err(e) = self.suspend() {
                tracing::warn!(vm = %inner.name, error = %e, "failed to suspend on release");
            }
        }
    }
}

impl std::fmt::Debug for VirtualMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualMachine")
            .field("name", &self.inner.name)
            .field("backend", &self.inner.backend.kind())
            .field("state", &self.cached_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{harness, MonitorEvent};
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shutdown_and_suspend_are_idempotent_when_stopped() {
        for state in [VmState::Off, VmState::Stopped] {
            let (vm, h) = harness(BackendKind::Qemu, state);

            vm.shutdown(ShutdownPolicy::Graceful).unwrap();
            vm.shutdown(ShutdownPolicy::Graceful).unwrap();
            vm.shutdown(ShutdownPolicy::Forced).unwrap();
            vm.suspend().unwrap();

            assert!(h.monitor.persisted().is_empty(), "{} wrote state", state);
            assert!(h.backend.calls().is_empty(), "{} made native calls", state);
            assert_eq!(vm.cached_state(), state);
        }
    }

    #[test]
    fn test_graceful_shutdown_of_running_instance() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        vm.ssh_exec("uptime").unwrap();
        assert_eq!(h.ssh.connects(), 1);

        vm.shutdown(ShutdownPolicy::Graceful).unwrap();

        assert_eq!(vm.cached_state(), VmState::Off);
        assert_eq!(h.monitor.persisted(), vec![VmState::Off]);
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Shutdown), 1);
        assert_eq!(h.ssh.drops(), 1);
        assert_eq!(h.backend.calls(), vec!["shutdown:graceful"]);
    }

    #[test]
    fn test_failed_graceful_shutdown_is_forced() {
        let (vm, h) = harness(BackendKind::Libvirt, VmState::Running);
        h.backend.fail_graceful();

        vm.shutdown(ShutdownPolicy::Graceful).unwrap();

        assert_eq!(h.backend.calls(), vec!["shutdown:graceful", "shutdown:forced"]);
        assert_eq!(vm.cached_state(), VmState::Off);
    }

    #[test]
    fn test_shutdown_of_suspended_instance() {
        let (vm, h) = harness(BackendKind::HyperV, VmState::Suspended);

        vm.shutdown(ShutdownPolicy::Graceful).unwrap();
        assert!(h.backend.calls().is_empty());
        assert_eq!(vm.cached_state(), VmState::Suspended);

        vm.shutdown(ShutdownPolicy::Forced).unwrap();
        assert_eq!(h.backend.calls(), vec!["shutdown:forced"]);
        assert_eq!(vm.cached_state(), VmState::Off);
    }

    #[test]
    fn test_unsupported_suspend_makes_no_native_call() {
        let (vm, h) = harness(BackendKind::Lxd, VmState::Running);

        let err = vm.suspend().unwrap_err();

        assert!(matches!(err, Error::NotSupported(_)));
        assert!(h.backend.calls().is_empty());
        assert!(h.monitor.events().is_empty());
        assert_eq!(vm.cached_state(), VmState::Running);
    }

    #[test]
    fn test_suspend_persists_state_and_metadata() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        h.backend.set_metadata(json!({"machine_type": "pc-q35-8.2"}));

        vm.suspend().unwrap();

        assert_eq!(
            h.monitor.events(),
            vec![
                MonitorEvent::Persisted(VmState::Suspending),
                MonitorEvent::Metadata(json!({"machine_type": "pc-q35-8.2"})),
                MonitorEvent::Persisted(VmState::Suspended),
                MonitorEvent::Suspend,
            ]
        );
        assert_eq!(h.backend.calls(), vec!["suspend"]);
    }

    #[test]
    fn test_suspend_while_stopped_still_notifies() {
        let (vm, h) = harness(BackendKind::VirtualBox, VmState::Stopped);

        vm.suspend().unwrap();

        assert!(h.backend.calls().is_empty());
        assert_eq!(h.monitor.events(), vec![MonitorEvent::Suspend]);
    }

    #[test]
    fn test_resume_from_suspended() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Suspended);
        h.monitor.set_metadata(json!({"machine_type": "pc-q35-8.2"}));

        vm.start().unwrap();
        assert_eq!(vm.cached_state(), VmState::Starting);
        assert_eq!(h.backend.calls(), vec!["start:resume"]);

        vm.ensure_vm_is_running().unwrap();

        assert_eq!(vm.cached_state(), VmState::Running);
        assert_eq!(
            h.monitor.events(),
            vec![
                MonitorEvent::Persisted(VmState::Starting),
                MonitorEvent::Resume,
                MonitorEvent::Persisted(VmState::Running),
            ]
        );
    }

    #[test]
    fn test_starting_hides_running_probe() {
        let (vm, h) = harness(BackendKind::Libvirt, VmState::Off);

        vm.start().unwrap();
        assert_eq!(h.backend.calls(), vec!["start"]);
        // Backend already reports running; the start has not been confirmed.
        assert_eq!(vm.current_state(), VmState::Starting);

        vm.ensure_vm_is_running().unwrap();
        assert_eq!(vm.current_state(), VmState::Running);
        assert_eq!(h.monitor.persisted(), vec![VmState::Starting, VmState::Running]);
    }

    #[test]
    fn test_start_on_running_instance_is_a_no_op() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        vm.start().unwrap();
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn test_failed_start_resyncs_to_backend_truth() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Off);
        h.backend.fail_start("could not access KVM kernel module");

        let err = vm.start().unwrap_err();

        assert!(matches!(err, Error::StartFailure { .. }));
        assert!(err.to_string().contains("KVM"));
        assert_eq!(vm.cached_state(), VmState::Off);
        assert_eq!(h.monitor.persisted(), vec![VmState::Starting, VmState::Off]);
        assert!(vm.last_error().unwrap().contains("KVM"));
    }

    #[test]
    fn test_unreachable_backend_reports_unknown() {
        let (vm, h) = harness(BackendKind::Lxd, VmState::Running);

        h.backend.fail_probes(true);
        assert_eq!(vm.current_state(), VmState::Unknown);

        h.backend.fail_probes(false);
        assert_eq!(vm.current_state(), VmState::Running);
    }

    #[test]
    fn test_shutdown_while_starting_aborts_start() {
        let (vm, h) = harness(BackendKind::Lxd, VmState::Off);
        h.backend.start_into(VmState::Starting);
        vm.start().unwrap();

        let vm = Arc::new(vm);
        let starter = {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || vm.ensure_vm_is_running_for(Duration::from_secs(5)))
        };

        vm.shutdown(ShutdownPolicy::Graceful).unwrap();
        let err = starter.join().unwrap().unwrap_err();

        assert!(matches!(err, Error::StartFailure { .. }));
        assert!(err.to_string().contains("Instance shutdown during start"));
        assert_eq!(vm.cached_state(), VmState::Off);
        assert_eq!(h.backend.calls(), vec!["start", "shutdown:forced"]);
        assert_eq!(h.monitor.persisted(), vec![VmState::Starting, VmState::Off]);
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Shutdown), 1);
    }

    #[test]
    fn test_ensure_reports_last_diagnostic() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Off);
        h.backend.start_into(VmState::Starting);
        vm.start().unwrap();

        h.backend.emit(BackendEvent::Error("qemu: could not open disk image".into()));
        assert!(testing::wait_until(|| vm.last_error().is_some()));
        h.backend.set_state(VmState::Off);

        let err = vm.ensure_vm_is_running_for(Duration::from_secs(1)).unwrap_err();
        match err {
            Error::VmNotRunning { reason, .. } => {
                assert_eq!(reason, "qemu: could not open disk image")
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_unsolicited_exit_marks_instance_off() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);

        h.backend.set_state(VmState::Off);
        h.backend.emit(BackendEvent::Exited { code: Some(0) });

        assert!(testing::wait_until(|| {
            h.monitor.count(|e| *e == MonitorEvent::Shutdown) == 1
        }));
        assert_eq!(vm.cached_state(), VmState::Off);
        assert_eq!(h.monitor.persisted(), vec![VmState::Off]);
    }

    #[test]
    fn test_restart_event_notifies_monitor() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);

        h.backend.emit(BackendEvent::Restarting);

        assert!(testing::wait_until(|| {
            h.monitor.count(|e| *e == MonitorEvent::Restart("primary".into())) == 1
        }));
        assert_eq!(vm.cached_state(), VmState::Restarting);
        // Reboot done once the backend reports running again.
        assert_eq!(vm.current_state(), VmState::Running);
    }

    #[test]
    fn test_concurrent_probes_during_shutdown() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        let vm = Arc::new(vm);

        let probers: Vec<_> = (0..2)
            .map(|_| {
                let vm = Arc::clone(&vm);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        vm.current_state();
                    }
                })
            })
            .collect();

        vm.shutdown(ShutdownPolicy::Graceful).unwrap();
        h.backend.emit(BackendEvent::Exited { code: Some(0) });
        for prober in probers {
            prober.join().unwrap();
        }
        std::thread::sleep(Duration::from_millis(100));

        assert_eq!(vm.current_state(), VmState::Off);
        assert_eq!(h.monitor.persisted().last(), Some(&VmState::Off));
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Shutdown), 1);
    }

    #[test]
    fn test_resize_validation() {
        let (vm, h) = harness(BackendKind::HyperV, VmState::Off);

        assert!(matches!(vm.update_cpus(0), Err(Error::InvalidResize { what: "cpus", .. })));
        assert!(matches!(
            vm.resize_memory(MemorySize::from_bytes(0)),
            Err(Error::InvalidResize { what: "memory", .. })
        ));
        assert!(matches!(
            vm.resize_disk(MemorySize::from_gib(5)),
            Err(Error::InvalidResize { what: "disk", .. })
        ));
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn test_resize_updates_description() {
        let (vm, h) = harness(BackendKind::Libvirt, VmState::Running);

        vm.update_cpus(4).unwrap();
        vm.resize_memory(MemorySize::from_gib(4)).unwrap();
        vm.resize_disk(MemorySize::from_gib(20)).unwrap();

        assert_eq!(
            h.backend.calls(),
            vec!["cpus:4:true", "memory:4GiB:true", "disk:20GiB:true"]
        );
        let desc = vm.description();
        assert_eq!(desc.num_cores, 4);
        assert_eq!(desc.mem_size, MemorySize::from_gib(4));

        let stored = VirtualMachineDescription::load(vm.instance_dir()).unwrap();
        assert_eq!(stored, desc);
    }

    #[test]
    fn test_network_hot_add_requires_capability() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        let iface = NetworkInterface::new("br0", "52:54:00:00:00:02");

        let err = vm.add_network_interface(iface.clone()).unwrap_err();
        assert!(matches!(err, Error::NotSupported(_)));
        assert!(h.backend.calls().is_empty());

        h.backend.set_state(VmState::Off);
        vm.add_network_interface(iface).unwrap();

        assert_eq!(h.backend.calls(), vec!["nic:0:br0"]);
        assert_eq!(vm.description().extra_interfaces.len(), 1);
        assert!(h.dir.path().join("primary").join("cloud-init").exists());
    }

    #[test]
    fn test_snapshot_round_trip_leaves_spec_unchanged() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Off);
        let before = serde_json::to_string(&vm.description()).unwrap();

        let snapshot = vm.take_snapshot("", "before upgrade").unwrap();
        assert_eq!(snapshot.name(), "snapshot1");
        assert_eq!(vm.list_snapshots().len(), 1);

        vm.delete_snapshot("snapshot1").unwrap();

        assert_eq!(serde_json::to_string(&vm.description()).unwrap(), before);
        assert!(vm.list_snapshots().is_empty());
        assert_eq!(h.backend.calls(), vec!["capture:snapshot1", "erase:snapshot1"]);
    }

    #[test]
    fn test_snapshots_gated_by_capability() {
        let (vm, h) = harness(BackendKind::Lxd, VmState::Off);

        assert!(matches!(vm.take_snapshot("base", ""), Err(Error::NotSupported(_))));
        assert!(matches!(vm.delete_snapshot("base"), Err(Error::NotSupported(_))));
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn test_restore_snapshot_applies_specs() {
        let (vm, h) = harness(BackendKind::VirtualBox, VmState::Off);
        vm.take_snapshot("base", "").unwrap();
        vm.update_cpus(8).unwrap();
        vm.take_snapshot("big", "").unwrap();

        vm.restore_snapshot("base").unwrap();

        assert_eq!(vm.description().num_cores, 2);
        assert_eq!(vm.head_snapshot().unwrap().name(), "base");
        assert!(h.backend.calls().contains(&"apply:base".to_string()));

        h.backend.set_state(VmState::Running);
        assert!(matches!(
            vm.restore_snapshot("big"),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_failed_erase_keeps_tree_intact() {
        let (vm, h) = harness(BackendKind::HyperV, VmState::Off);
        let base = vm.take_snapshot("base", "").unwrap();
        vm.take_snapshot("child", "").unwrap();
        h.backend.fail_erase();

        assert!(vm.delete_snapshot("base").is_err());

        assert_eq!(vm.list_snapshots().len(), 2);
        let child = vm.get_snapshot("child").unwrap();
        assert_eq!(child.parent_index(), Some(base.index()));
    }

    #[test]
    fn test_duplicate_snapshot_name_is_rejected() {
        let (vm, h) = harness(BackendKind::Libvirt, VmState::Off);
        vm.take_snapshot("base", "").unwrap();

        let err = vm.take_snapshot("base", "").unwrap_err();

        assert!(matches!(err, Error::DuplicateSnapshotName { .. }));
        assert_eq!(h.backend.count("capture:base"), 1);
    }

    #[test]
    fn test_get_all_ipv4_over_ssh() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        h.ssh.reply("ens3 UP 10.0.0.5/24\nens4 UP 192.168.1.20/24\n");

        let addresses = vm.get_all_ipv4().unwrap();

        assert_eq!(
            addresses,
            vec![Ipv4Addr::new(10, 0, 0, 5), Ipv4Addr::new(192, 168, 1, 20)]
        );
        assert_eq!(h.ssh.commands(), vec![LIST_IPV4_COMMAND]);
        assert_eq!(vm.ssh_hostname(Duration::ZERO).unwrap(), "10.0.0.5");
    }

    #[test]
    fn test_ssh_hostname_gives_up_without_address() {
        let (vm, h) = harness(BackendKind::Libvirt, VmState::Running);
        h.backend.set_ip(None);

        let err = vm.ssh_hostname(Duration::from_millis(50)).unwrap_err();

        assert!(err.to_string().contains("failed to determine IP address"));
        assert_eq!(vm.management_ipv4(), None);
    }

    #[test]
    fn test_drop_suspends_running_instance() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        drop(vm);

        assert_eq!(h.backend.calls(), vec!["suspend"]);
        // The final suspend leaves the persisted state alone.
        assert!(h.monitor.persisted().is_empty());
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Suspend), 1);
    }

    #[test]
    fn test_drop_without_suspend() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        vm.set_suspend_on_drop(false);
        drop(vm);
        assert!(h.backend.calls().is_empty());

        let (vm, h) = harness(BackendKind::Lxd, VmState::Running);
        drop(vm);
        assert!(h.backend.calls().is_empty());
    }

    #[test]
    fn test_late_exit_after_suspend_keeps_suspended() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        vm.suspend().unwrap();

        h.backend.emit(BackendEvent::Exited { code: Some(0) });
        // Events are handled in order; once this one lands the exit was seen.
        h.backend.emit(BackendEvent::Error("flushed".into()));
        assert!(testing::wait_until(|| vm.last_error().as_deref() == Some("flushed")));

        assert_eq!(vm.cached_state(), VmState::Suspended);
        assert_eq!(h.monitor.persisted().last(), Some(&VmState::Suspended));
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Shutdown), 0);
    }

    #[test]
    fn test_failed_persist_leaves_cache_and_backend_alone() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Off);
        h.monitor.fail_persist(true);

        assert!(vm.start().is_err());

        assert_eq!(vm.cached_state(), VmState::Off);
        assert!(h.backend.calls().is_empty());
        assert!(h.monitor.persisted().is_empty());

        h.monitor.fail_persist(false);
        vm.start().unwrap();
        assert_eq!(h.monitor.persisted(), vec![VmState::Starting]);
    }

    #[test]
    fn test_orchestrator_moves_follow_lifecycle() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Off);

        {
            let mut cache = vm.inner.cache.lock();
            let err = vm.inner.transition(&mut cache, VmState::Suspended).unwrap_err();
            assert!(matches!(err, Error::InvalidState { .. }));
            assert_eq!(cache.state, VmState::Off);

            vm.inner.transition(&mut cache, VmState::Starting).unwrap();
            assert!(vm.inner.transition(&mut cache, VmState::DelayedShutdown).is_err());
        }

        assert_eq!(h.monitor.persisted(), vec![VmState::Starting]);
    }

    #[test]
    fn test_failed_suspend_resyncs_to_running() {
        let (vm, h) = harness(BackendKind::Qemu, VmState::Running);
        h.backend.fail_suspend();

        let err = vm.suspend().unwrap_err();

        assert!(matches!(err, Error::OperationFailed { .. }));
        assert!(err.to_string().contains("does not support snapshots"));
        assert_eq!(vm.cached_state(), VmState::Running);
        assert_eq!(h.monitor.persisted(), vec![VmState::Suspending, VmState::Running]);
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Suspend), 0);
        vm.set_suspend_on_drop(false);
    }

    #[test]
    fn test_aborted_start_waits_for_the_real_exit() {
        let (vm, h) = harness(BackendKind::Lxd, VmState::Off);
        h.backend.start_into(VmState::Starting);
        vm.start().unwrap();
        h.backend.linger_on_shutdown();

        let vm = Arc::new(vm);
        let starter = {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || vm.ensure_vm_is_running_for(Duration::from_secs(5)))
        };
        let stopper = {
            let vm = Arc::clone(&vm);
            std::thread::spawn(move || vm.shutdown(ShutdownPolicy::Forced))
        };

        let err = starter.join().unwrap().unwrap_err();
        assert!(matches!(err, Error::StartFailure { .. }));

        // The starter giving up must not release the shutdown.
        std::thread::sleep(Duration::from_millis(200));
        assert!(!stopper.is_finished());

        h.backend.set_state(VmState::Off);
        h.backend.emit(BackendEvent::Exited { code: None });
        assert!(testing::wait_until(|| stopper.is_finished()));
        stopper.join().unwrap().unwrap();
        assert_eq!(h.monitor.count(|e| *e == MonitorEvent::Shutdown), 1);
    }

    #[test]
    fn test_disk_shrink_checked_against_latest_size() {
        let (vm, h) = harness(BackendKind::Libvirt, VmState::Running);

        vm.resize_disk(MemorySize::from_gib(20)).unwrap();
        let err = vm.resize_disk(MemorySize::from_gib(15)).unwrap_err();

        assert!(matches!(err, Error::InvalidResize { what: "disk", .. }));
        assert_eq!(h.backend.calls(), vec!["disk:20GiB:true"]);
        assert_eq!(vm.description().disk_space, MemorySize::from_gib(20));
    }

    #[test]
    fn test_unsaved_snapshot_is_rolled_back() {
        let (vm, h) = harness(BackendKind::VirtualBox, VmState::Off);
        // A directory where the tree file belongs makes the save fail.
        let blocker = vm.instance_dir().join("snapshots.json");
        std::fs::create_dir_all(&blocker).unwrap();

        assert!(vm.take_snapshot("base", "").is_err());

        assert!(vm.list_snapshots().is_empty());
        assert!(vm.head_snapshot().is_none());
        assert_eq!(h.backend.calls(), vec!["capture:base", "erase:base"]);

        std::fs::remove_dir(&blocker).unwrap();
        let base = vm.take_snapshot("base", "").unwrap();
        assert_eq!(base.index(), 1);
    }

    #[test]
    fn test_unsaved_rename_is_rolled_back() {
        let (vm, _h) = harness(BackendKind::VirtualBox, VmState::Off);
        vm.take_snapshot("base", "").unwrap();
        let blocker = vm.instance_dir().join("snapshots.json");
        std::fs::remove_file(&blocker).unwrap();
        std::fs::create_dir_all(&blocker).unwrap();

        assert!(vm.rename_snapshot("base", "golden").is_err());

        assert!(vm.get_snapshot("base").is_ok());
        assert!(vm.get_snapshot("golden").is_err());
    }
}
