//! hvorch CLI entry point.

use clap::{Parser, Subcommand, ValueEnum};
use hvorch::config::DaemonConfig;
use hvorch::vm::BackendKind;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cli;

/// hvorch - VM lifecycle across hypervisors
#[derive(Parser, Debug)]
#[command(name = "hvorch")]
#[command(about = "Drive VMs on QEMU, libvirt, Hyper-V, VirtualBox and LXD")]
#[command(version)]
struct Cli {
    /// Configuration file (default: platform config dir).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the configured backend.
    #[arg(long, global = true, value_parser = parse_backend)]
    backend: Option<BackendKind>,

    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

fn parse_backend(s: &str) -> Result<BackendKind, String> {
    s.parse::<BackendKind>().map_err(|e| e.to_string())
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an instance without starting it.
    Create(cli::create::CreateCmd),

    /// Start or resume an instance.
    Start(cli::start::StartCmd),

    /// Stop an instance, optionally after a delay.
    Stop(cli::stop::StopCmd),

    /// Suspend an instance.
    Suspend(cli::suspend::SuspendCmd),

    /// Show instance status.
    #[command(alias = "ls")]
    Status(cli::status::StatusCmd),

    /// Change cpus, memory or disk.
    Resize(cli::resize::ResizeCmd),

    /// Manage snapshots.
    #[command(subcommand)]
    Snapshot(cli::snapshot::SnapshotCmd),

    /// Manage networking.
    #[command(subcommand)]
    Networks(cli::networks::NetworksCmd),

    /// Manage configuration.
    #[command(subcommand)]
    Config(cli::config::ConfigCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging(cli.log_format);

    tracing::debug!(version = hvorch::VERSION, "starting hvorch");

    let result = run(cli);

    // Handle errors
    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> hvorch::Result<()> {
    let path = match cli.config {
        Some(path) => path,
        None => DaemonConfig::default_path()?,
    };

    // Load configuration
    let mut config = match DaemonConfig::load_from(&path) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            DaemonConfig::default()
        }
    };
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }

    // Config commands work without opening the state database.
    let command = match cli.command {
        Commands::Config(cmd) => return cmd.run(&config, &path),
        command => command,
    };

    let ctx = cli::Context::new(config)?;
    match command {
        Commands::Create(cmd) => cmd.run(&ctx),
        Commands::Start(cmd) => cmd.run(&ctx),
        Commands::Stop(cmd) => cmd.run(&ctx),
        Commands::Suspend(cmd) => cmd.run(&ctx),
        Commands::Status(cmd) => cmd.run(&ctx),
        Commands::Resize(cmd) => cmd.run(&ctx),
        Commands::Snapshot(cmd) => cmd.run(&ctx),
        Commands::Networks(cmd) => cmd.run(&ctx),
        Commands::Config(_) => Ok(()),
    }
}

/// Initialize the tracing subscriber.
fn init_logging(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("hvorch=warn"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}
