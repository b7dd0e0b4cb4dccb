//! Stop command implementation.

use super::parsers::parse_duration;
use super::Context;
use clap::Args;
use hvorch::vm::{DelayedShutdownTimer, ShutdownPolicy};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

/// Stop an instance.
#[derive(Args, Debug)]
pub struct StopCmd {
    /// Instance name.
    pub name: String,

    /// Power off without asking the guest.
    #[arg(short, long, conflicts_with = "delay")]
    pub force: bool,

    /// Warn the guest and power off after this long (e.g. 5m).
    #[arg(long, value_parser = parse_duration)]
    pub delay: Option<Duration>,
}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let vm = ctx.open(&self.name)?;

        if vm.current_state().is_stopped() {
            println!("Instance '{}' not running", self.name);
            return Ok(());
        }

        if let Some(delay) = self.delay {
            let vm = Arc::new(vm);
            let (done, finished) = mpsc::channel();
            let mut timer = DelayedShutdownTimer::new(Arc::clone(&vm), move || {
                let _ = done.send(());
            });

            println!(
                "Instance '{}' stops in {}",
                self.name,
                humantime::format_duration(delay)
            );
            timer.start(delay)?;
            // The sender goes away with the callback, so this cannot hang.
            let _ = finished.recv();
        } else {
            let policy = if self.force {
                ShutdownPolicy::Forced
            } else {
                ShutdownPolicy::Graceful
            };
            println!("Stopping instance '{}'...", self.name);
            vm.shutdown(policy)?;
        }

        println!("Instance '{}' stopped", self.name);
        Ok(())
    }
}
