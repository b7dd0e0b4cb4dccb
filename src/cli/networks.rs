//! Network commands.

use super::parsers::parse_interface;
use super::Context;
use clap::{Args, Subcommand};
use hvorch::Error;

/// Manage instance networking
#[derive(Subcommand, Debug)]
pub enum NetworksCmd {
    /// List host networks the instance's backend can use
    #[command(alias = "list")]
    Ls(NetworksLsCmd),
    /// Attach an extra interface to an instance
    Add(NetworksAddCmd),
}

impl NetworksCmd {
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        match self {
            NetworksCmd::Ls(cmd) => cmd.run(ctx),
            NetworksCmd::Add(cmd) => cmd.run(ctx),
        }
    }
}

/// List host networks
#[derive(Args, Debug)]
pub struct NetworksLsCmd {
    /// Instance whose backend to query.
    pub name: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl NetworksLsCmd {
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let vm = ctx.open(&self.name)?;
        let networks = vm.networks()?;

        if self.json {
            println!("{}", serde_json::to_string_pretty(&networks)?);
            return Ok(());
        }

        if networks.is_empty() {
            println!("No networks found");
            return Ok(());
        }

        println!("{:<20} {:<10} {:<40}", "ID", "TYPE", "DESCRIPTION");
        println!("{}", "-".repeat(72));
        for network in networks {
            let auth = if network.needs_authorization { " *" } else { "" };
            println!(
                "{:<20} {:<10} {}{}",
                network.id,
                network.kind.to_string(),
                network.description,
                auth
            );
        }
        Ok(())
    }
}

/// Attach an extra interface
#[derive(Args, Debug)]
pub struct NetworksAddCmd {
    /// Instance name.
    pub name: String,

    /// Interface spec: ID[,mac=MAC][,mode=auto|manual].
    pub spec: String,
}

impl NetworksAddCmd {
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let iface = parse_interface(&self.spec, &self.name).map_err(Error::Config)?;
        let vm = ctx.open(&self.name)?;

        let id = iface.id.clone();
        let mac = iface.mac_address.clone();
        vm.add_network_interface(iface)?;
        println!("Instance '{}': attached {} ({})", self.name, id, mac);
        Ok(())
    }
}
