//! Configuration CLI commands.

use clap::{Args, Subcommand};
use hvorch::config::DaemonConfig;
use hvorch::{Error, Result};
use std::path::{Path, PathBuf};

/// Configuration commands
#[derive(Subcommand, Debug)]
pub enum ConfigCmd {
    /// Show the effective configuration
    Show(ShowCmd),

    /// Write a default configuration file
    Init(InitCmd),
}

impl ConfigCmd {
    pub fn run(self, config: &DaemonConfig, path: &Path) -> Result<()> {
        match self {
            ConfigCmd::Show(cmd) => cmd.run(config, path),
            ConfigCmd::Init(cmd) => cmd.run(path),
        }
    }
}

/// Show the effective configuration
#[derive(Args, Debug)]
pub struct ShowCmd {}

impl ShowCmd {
    pub fn run(self, config: &DaemonConfig, path: &Path) -> Result<()> {
        println!("# Config file: {}", path.display());
        if !path.exists() {
            println!("# (not present, using defaults)");
        }
        let text = toml::to_string_pretty(config).map_err(|e| Error::ConfigSave(e.to_string()))?;
        print!("{}", text);
        Ok(())
    }
}

/// Write a default configuration file
#[derive(Args, Debug)]
pub struct InitCmd {
    /// Overwrite an existing file.
    #[arg(long)]
    pub force: bool,

    /// Write here instead of the active config path.
    #[arg(long)]
    pub output: Option<PathBuf>,
}

impl InitCmd {
    pub fn run(self, path: &Path) -> Result<()> {
        let target = self.output.as_deref().unwrap_or(path);
        if target.exists() && !self.force {
            return Err(Error::ConfigSave(format!(
                "{} already exists (use --force to overwrite)",
                target.display()
            )));
        }

        DaemonConfig::default().save_to(target)?;
        println!("Wrote {}", target.display());
        Ok(())
    }
}
