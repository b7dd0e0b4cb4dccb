//! Status command implementation.

use super::Context;
use clap::Args;
use hvorch::VirtualMachine;

/// Show instance status.
#[derive(Args, Debug)]
pub struct StatusCmd {
    /// Instance to show (default: all).
    pub name: Option<String>,

    /// Show detailed output.
    #[arg(short, long)]
    pub verbose: bool,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

impl StatusCmd {
    /// Execute the status command.
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let names = match &self.name {
            Some(name) => vec![name.clone()],
            None => ctx.instance_names()?,
        };

        let mut vms = Vec::with_capacity(names.len());
        for name in &names {
            vms.push(ctx.open(name)?);
        }

        if self.json {
            let json_vms: Vec<_> = vms.iter().map(status_json).collect();
            println!("{}", serde_json::to_string_pretty(&json_vms)?);
            return Ok(());
        }

        if vms.is_empty() {
            println!("No instances found");
            return Ok(());
        }

        println!(
            "{:<20} {:<18} {:<12} {:<6} {:<10} {:<16}",
            "NAME", "STATE", "BACKEND", "CPUS", "MEMORY", "IPV4"
        );
        println!("{}", "-".repeat(86));

        for vm in &vms {
            let state = vm.current_state();
            let desc = vm.description();
            let ip = vm
                .management_ipv4()
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "-".to_string());

            println!(
                "{:<20} {:<18} {:<12} {:<6} {:<10} {:<16}",
                truncate(vm.name(), 18),
                state.name(),
                vm.backend_kind().name(),
                desc.num_cores,
                desc.mem_size.to_string(),
                ip,
            );

            if self.verbose {
                println!("  Disk: {}", desc.disk_space);
                println!("  Image: {}", desc.image_path.display());
                for iface in &desc.extra_interfaces {
                    println!("  Network: {} ({})", iface.id, iface.mac_address);
                }
                if let Some(head) = vm.head_snapshot() {
                    println!("  Snapshot: {}", head.name());
                }
                if let Some(error) = vm.last_error() {
                    println!("  Last error: {}", error);
                }
                println!();
            }
        }

        Ok(())
    }
}

fn status_json(vm: &VirtualMachine) -> serde_json::Value {
    let desc = vm.description();
    serde_json::json!({
        "name": vm.name(),
        "state": vm.current_state(),
        "backend": vm.backend_kind(),
        "cpus": desc.num_cores,
        "memory": desc.mem_size.to_string(),
        "disk": desc.disk_space.to_string(),
        "ipv4": vm.management_ipv4().map(|ip| ip.to_string()),
        "snapshots": vm.list_snapshots().len(),
        "last_error": vm.last_error(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("primary", 18), "primary");
        assert_eq!(truncate("a-very-long-instance-name", 10), "a-very-...");
    }
}
