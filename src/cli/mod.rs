//! CLI command implementations.

pub mod config;
pub mod create;
pub mod networks;
pub mod parsers;
pub mod resize;
pub mod snapshot;
pub mod start;
pub mod status;
pub mod stop;
pub mod suspend;

use hvorch::cloud_init::SeedDirConfigurator;
use hvorch::config::DaemonConfig;
use hvorch::process::CommandRunner;
use hvorch::ssh::{FileKeyProvider, OpenSshConnector};
use hvorch::vm::backend::{self, BackendServices};
use hvorch::vm::description::DESCRIPTION_FILE;
use hvorch::vm::{StateStore, VirtualMachine, VirtualMachineDescription, VmServices};
use hvorch::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;

/// Shared handles for one CLI invocation.
pub struct Context {
    /// Loaded configuration.
    pub config: DaemonConfig,
    backends: BackendServices,
    services: VmServices,
}

impl Context {
    /// Open the state database and build the configured backend services.
    pub fn new(config: DaemonConfig) -> Result<Self> {
        let store = Arc::new(StateStore::open(&config.state_db_path())?);
        let backends = BackendServices::from_config(&config)?;

        let key = config
            .ssh
            .private_key
            .clone()
            .unwrap_or_else(|| config.data_dir.join("ssh").join("id_ed25519"));
        let runner: Arc<dyn CommandRunner> = Arc::clone(&backends.runner);

        let services = VmServices {
            monitor: store,
            ssh: Arc::new(OpenSshConnector::new(config.ssh.client.clone(), runner)),
            keys: Arc::new(FileKeyProvider::new(key)),
            cloud_init: Arc::new(SeedDirConfigurator::new(config.data_dir.join("instances"))),
        };

        Ok(Self {
            config,
            backends,
            services,
        })
    }

    /// Directory of an instance.
    pub fn instance_dir(&self, name: &str) -> PathBuf {
        self.config.instance_dir(name)
    }

    /// Whether an instance has been created.
    pub fn exists(&self, name: &str) -> bool {
        self.instance_dir(name).join(DESCRIPTION_FILE).exists()
    }

    /// Open an instance for this invocation.
    ///
    /// The handle does not suspend the instance when the command exits.
    pub fn open(&self, name: &str) -> Result<VirtualMachine> {
        if !self.exists(name) {
            return Err(Error::Config(format!("instance '{}' does not exist", name)));
        }

        let dir = self.instance_dir(name);
        let desc = VirtualMachineDescription::load(&dir)?;
        self.open_description(desc)
    }

    /// Open an instance from a description (which may not be saved yet).
    pub fn open_description(&self, desc: VirtualMachineDescription) -> Result<VirtualMachine> {
        let dir = self.instance_dir(&desc.name);
        let driver = backend::create(&self.config, &self.backends, &desc)?;
        let vm = VirtualMachine::new(
            desc,
            driver,
            self.services.clone(),
            self.config.timeouts.clone(),
            dir,
        )?;
        vm.set_suspend_on_drop(false);
        Ok(vm)
    }

    /// Names of all created instances, sorted.
    pub fn instance_names(&self) -> Result<Vec<String>> {
        let root = self.config.data_dir.join("instances");
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut names = Vec::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.path().join(DESCRIPTION_FILE).exists() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}
