//! Create command implementation.

use super::parsers::{mac_for, parse_interface, parse_size};
use super::Context;
use clap::Args;
use hvorch::vm::{MemorySize, VirtualMachineDescription};
use hvorch::Error;
use std::path::PathBuf;

/// Create an instance without starting it.
#[derive(Args, Debug)]
pub struct CreateCmd {
    /// Instance name.
    pub name: String,

    /// Disk image to boot from.
    #[arg(long)]
    pub image: PathBuf,

    /// Cloud-init seed ISO.
    #[arg(long)]
    pub cloud_init_iso: Option<PathBuf>,

    /// Number of vCPUs.
    #[arg(long, default_value = "1")]
    pub cpus: u32,

    /// Memory size (e.g. 1G, 512M).
    #[arg(long, default_value = "1G", value_parser = parse_size)]
    pub memory: MemorySize,

    /// Disk size (e.g. 10G).
    #[arg(long, default_value = "5G", value_parser = parse_size)]
    pub disk: MemorySize,

    /// MAC address of the default interface.
    #[arg(long)]
    pub mac: Option<String>,

    /// Extra interface (ID[,mac=MAC][,mode=auto|manual]).
    #[arg(short = 'n', long = "network")]
    pub network: Vec<String>,

    /// User to log in as over SSH.
    #[arg(long, default_value = "ubuntu")]
    pub username: String,
}

impl CreateCmd {
    fn description(&self) -> hvorch::Result<VirtualMachineDescription> {
        let mut builder = VirtualMachineDescription::builder(&self.name)
            .cores(self.cpus)
            .memory(self.memory)
            .disk(self.disk)
            .image(&self.image)
            .ssh_username(&self.username)
            .default_mac(
                self.mac
                    .clone()
                    .map(|m| m.to_lowercase())
                    .unwrap_or_else(|| mac_for(&self.name)),
            );

        if let Some(iso) = &self.cloud_init_iso {
            builder = builder.cloud_init_iso(iso);
        }

        for spec in &self.network {
            let iface = parse_interface(spec, &self.name).map_err(Error::Config)?;
            builder = builder.interface(iface);
        }

        let desc = builder.build();
        desc.validate()?;
        Ok(desc)
    }

    /// Execute the create command.
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        if ctx.exists(&self.name) {
            return Err(Error::Config(format!(
                "instance '{}' already exists",
                self.name
            )));
        }

        let desc = self.description()?;
        let dir = ctx.instance_dir(&desc.name);

        let vm = ctx.open_description(desc.clone())?;
        desc.save(&dir)?;
        tracing::info!(vm = %desc.name, backend = %vm.backend_kind(), "created instance");

        println!("Created instance: {}", self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser)]
    struct Wrapper {
        #[command(flatten)]
        cmd: CreateCmd,
    }

    #[test]
    fn test_description_from_args() {
        let wrapper = Wrapper::try_parse_from([
            "create",
            "primary",
            "--image",
            "/images/noble.img",
            "--cpus",
            "2",
            "--memory",
            "2G",
            "--network",
            "br0,mode=manual",
        ])
        .unwrap();

        let desc = wrapper.cmd.description().unwrap();
        assert_eq!(desc.num_cores, 2);
        assert_eq!(desc.mem_size, MemorySize::from_gib(2));
        assert_eq!(desc.disk_space, MemorySize::from_gib(5));
        assert_eq!(desc.default_mac, mac_for("primary"));
        assert_eq!(desc.extra_interfaces.len(), 1);
        assert!(!desc.extra_interfaces[0].auto_mode);
    }

    #[test]
    fn test_invalid_name_is_rejected() {
        let wrapper =
            Wrapper::try_parse_from(["create", "../escape", "--image", "/images/noble.img"]).unwrap();
        assert!(wrapper.cmd.description().is_err());
    }
}
