//! Delayed shutdown.
//!
//! While a [`DelayedShutdownTimer`] is pending the instance reports
//! `DelayedShutdown` and the guest is told over SSH that it is going down.
//! Dropping the timer cancels it and restores the state the instance had
//! when the countdown started. Guest notices go out in order on a
//! background thread, so a slow or unreachable guest never holds up the
//! caller.

use super::{ShutdownPolicy, VirtualMachine, VmState};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

type FinishedCallback = Box<dyn FnOnce() + Send>;

/// Counts down, then force-stops an instance.
pub struct DelayedShutdownTimer {
    vm: Arc<VirtualMachine>,
    on_finished: Arc<Mutex<Option<FinishedCallback>>>,
    pending: Option<Pending>,
    notices: Option<Sender<String>>,
}

struct Pending {
    prior: VmState,
    deadline: Instant,
    cancel: Sender<()>,
    fired: Arc<AtomicBool>,
    worker: JoinHandle<()>,
}

fn guest_shutdown_command(delay: Duration) -> String {
    let minutes = delay.as_secs().div_ceil(60).max(1);
    format!("sudo shutdown -P +{}", minutes)
}

const GUEST_CANCEL_COMMAND: &str = "sudo shutdown -c";

impl DelayedShutdownTimer {
    /// Create an idle timer. `on_finished` runs once, after the shutdown.
    pub fn new(vm: Arc<VirtualMachine>, on_finished: impl FnOnce() + Send + 'static) -> Self {
        Self {
            vm,
            on_finished: Arc::new(Mutex::new(Some(Box::new(on_finished)))),
            pending: None,
            notices: None,
        }
    }

    fn finish(callback: &Mutex<Option<FinishedCallback>>) {
        if let Some(callback) = callback.lock().take() {
            callback();
        }
    }

    fn send_notice(vm: &VirtualMachine, command: &str) {
        match vm.ssh_exec(command) {
            Ok(output) if output.success() => {}
            Ok(output) => {
                tracing::warn!(vm = %vm.name(), error = %output.diagnostic(), "guest rejected shutdown notice")
            }
            Err(e) => {
                tracing::warn!(vm = %vm.name(), error = %e, "could not notify guest")
            }
        }
    }

    /// Queue `command` for the guest, starting the notifier on first use.
    fn notify_guest(&mut self, command: String) {
        if self.notices.is_none() {
            let (tx, rx) = mpsc::channel::<String>();
            let vm = Arc::clone(&self.vm);
            let spawned = std::thread::Builder::new()
                .name(format!("{}-notify", self.vm.name()))
                .spawn(move || {
                    for command in rx {
                        Self::send_notice(&vm, &command);
                    }
                });
            match spawned {
                Ok(_) => self.notices = Some(tx),
                Err(e) => {
                    tracing::warn!(vm = %self.vm.name(), error = %e, "could not start guest notifier");
                    return;
                }
            }
        }
        if let Some(notices) = &self.notices {
            let _ = notices.send(command);
        }
    }

    /// Arm the timer.
    ///
    /// A zero delay shuts down right away. Otherwise the instance must be
    /// running; it moves to `DelayedShutdown` until the timer fires or is
    /// cancelled.
    pub fn start(&mut self, delay: Duration) -> Result<()> {
        if self.pending.is_some() {
            return Err(Error::invalid_state("no pending shutdown", VmState::DelayedShutdown));
        }

        if delay.is_zero() {
            self.vm.shutdown(ShutdownPolicy::Forced)?;
            Self::finish(&self.on_finished);
            return Ok(());
        }

        let prior = self.vm.enter_delayed_shutdown()?;
        tracing::info!(vm = %self.vm.name(), delay = %humantime::format_duration(delay), "shutdown scheduled");

        let (cancel, cancelled) = mpsc::channel::<()>();
        let fired = Arc::new(AtomicBool::new(false));

        let vm = Arc::clone(&self.vm);
        let on_finished = Arc::clone(&self.on_finished);
        let worker_fired = Arc::clone(&fired);
        let spawned = std::thread::Builder::new()
            .name(format!("{}-shutdown", self.vm.name()))
            .spawn(move || match cancelled.recv_timeout(delay) {
                Err(RecvTimeoutError::Timeout) => {
                    worker_fired.store(true, Ordering::SeqCst);
                    tracing::info!(vm = %vm.name(), "delayed shutdown firing");
                    if let Err(e) = vm.shutdown(ShutdownPolicy::Forced) {
                        tracing::error!(vm = %vm.name(), error = %e, "delayed shutdown failed");
                    }
                    Self::finish(&on_finished);
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                    tracing::debug!(vm = %vm.name(), "delayed shutdown cancelled");
                }
            });

        let worker = match spawned {
            Ok(worker) => worker,
            Err(e) => {
                self.vm.leave_delayed_shutdown(prior)?;
                return Err(e.into());
            }
        };

        self.pending = Some(Pending {
            prior,
            deadline: Instant::now() + delay,
            cancel,
            fired,
            worker,
        });
        self.notify_guest(guest_shutdown_command(delay));
        Ok(())
    }

    /// Whether a countdown is running.
    pub fn is_pending(&self) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| !p.fired.load(Ordering::SeqCst))
    }

    /// Time until the timer fires, if pending.
    pub fn time_remaining(&self) -> Option<Duration> {
        self.pending
            .as_ref()
            .filter(|p| !p.fired.load(Ordering::SeqCst))
            .map(|p| p.deadline.saturating_duration_since(Instant::now()))
    }

    /// Stop the countdown and restore the previous state.
    ///
    /// Waits for a shutdown that is already firing to complete, in which
    /// case nothing is restored.
    pub fn cancel(&mut self) -> Result<()> {
        let Some(pending) = self.pending.take() else {
            return Ok(());
        };

        drop(pending.cancel);
        if pending.worker.join().is_err() {
            tracing::error!(vm = %self.vm.name(), "delayed shutdown worker panicked");
        }
        if pending.fired.load(Ordering::SeqCst) {
            return Ok(());
        }

        if self.vm.leave_delayed_shutdown(pending.prior)? {
            tracing::info!(vm = %self.vm.name(), "delayed shutdown cancelled");
            self.notify_guest(GUEST_CANCEL_COMMAND.to_string());
        }
        Ok(())
    }
}

impl Drop for DelayedShutdownTimer {
    fn drop(&mut self) {
        if let Err(e) = self.cancel() {
            tracing::warn!(vm = %self.vm.name(), error = %e, "failed to cancel delayed shutdown");
        }
    }
}
