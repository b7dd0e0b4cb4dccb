//! Start command implementation.

use super::parsers::parse_duration;
use super::Context;
use clap::Args;
use std::time::Duration;

/// Start (or resume) an instance.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Instance name.
    pub name: String,

    /// Return once the backend accepted the request.
    #[arg(long)]
    pub no_wait: bool,

    /// How long to wait for the instance to come up.
    #[arg(long, value_parser = parse_duration)]
    pub timeout: Option<Duration>,
}

impl StartCmd {
    /// Execute the start command.
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let vm = ctx.open(&self.name)?;

        if vm.current_state().is_running() {
            println!("Instance '{}' already running", self.name);
            return Ok(());
        }

        println!("Starting instance '{}'...", self.name);
        vm.start()?;

        if self.no_wait {
            println!("Instance '{}' starting", self.name);
            return Ok(());
        }

        let timeout = self.timeout.unwrap_or(ctx.config.timeouts.start);
        vm.ensure_vm_is_running_for(timeout)?;
        match vm.management_ipv4() {
            Some(ip) => println!("Instance '{}' running ({})", self.name, ip),
            None => println!("Instance '{}' running", self.name),
        }
        Ok(())
    }
}
