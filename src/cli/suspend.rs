//! Suspend command implementation.

use super::Context;
use clap::Args;

/// Suspend an instance to disk.
#[derive(Args, Debug)]
pub struct SuspendCmd {
    /// Instance name.
    pub name: String,
}

impl SuspendCmd {
    /// Execute the suspend command.
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let vm = ctx.open(&self.name)?;
        vm.require_suspend_support()?;

        println!("Suspending instance '{}'...", self.name);
        vm.suspend()?;
        println!("Instance '{}' {}", self.name, vm.cached_state());
        Ok(())
    }
}
