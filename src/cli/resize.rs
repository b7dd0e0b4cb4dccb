//! Resize command implementation.

use super::parsers::parse_size;
use super::Context;
use clap::Args;
use hvorch::vm::MemorySize;
use hvorch::Error;

/// Change an instance's resources.
#[derive(Args, Debug)]
pub struct ResizeCmd {
    /// Instance name.
    pub name: String,

    /// New vCPU count.
    #[arg(long)]
    pub cpus: Option<u32>,

    /// New memory size (e.g. 4G).
    #[arg(long, value_parser = parse_size)]
    pub memory: Option<MemorySize>,

    /// New disk size; disks only grow.
    #[arg(long, value_parser = parse_size)]
    pub disk: Option<MemorySize>,
}

impl ResizeCmd {
    /// Execute the resize command.
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        if self.cpus.is_none() && self.memory.is_none() && self.disk.is_none() {
            return Err(Error::Config(
                "nothing to change: pass --cpus, --memory or --disk".into(),
            ));
        }

        let vm = ctx.open(&self.name)?;

        if let Some(cpus) = self.cpus {
            vm.update_cpus(cpus)?;
            println!("Instance '{}': {} cpus", self.name, cpus);
        }
        if let Some(memory) = self.memory {
            vm.resize_memory(memory)?;
            println!("Instance '{}': {} memory", self.name, memory);
        }
        if let Some(disk) = self.disk {
            vm.resize_disk(disk)?;
            println!("Instance '{}': {} disk", self.name, disk);
        }
        Ok(())
    }
}
