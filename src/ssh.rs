//! Guest SSH access.
//!
//! In-guest operations (shutdown notices, address discovery) run over SSH.
//! The default implementation drives the OpenSSH client binary in batch
//! mode; each [`SshSession`] is bound to one guest endpoint.

use crate::error::{Error, Result};
use crate::process::{CommandOutput, CommandRunner};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Exit code the OpenSSH client uses for its own failures.
const SSH_CLIENT_ERROR: i32 = 255;

/// Supplies the private key used for every guest session.
pub trait SshKeyProvider: Send + Sync {
    /// Path to the private key file.
    fn private_key_path(&self) -> &Path;

    /// Public key in OpenSSH format, injected into guests via cloud-init.
    fn public_key(&self) -> Result<String>;
}

/// Key pair stored on disk (`<path>` and `<path>.pub`).
#[derive(Debug, Clone)]
pub struct FileKeyProvider {
    path: PathBuf,
}

impl FileKeyProvider {
    /// Use the key at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl SshKeyProvider for FileKeyProvider {
    fn private_key_path(&self) -> &Path {
        &self.path
    }

    fn public_key(&self) -> Result<String> {
        let mut pub_path = self.path.clone().into_os_string();
        pub_path.push(".pub");
        let key = std::fs::read_to_string(PathBuf::from(pub_path))?;
        Ok(key.trim().to_string())
    }
}

/// An open channel to one guest.
pub trait SshSession: Send {
    /// Run a command in the guest.
    fn exec(&mut self, command: &str) -> Result<CommandOutput>;
}

/// Opens sessions.
pub trait SshConnector: Send + Sync {
    /// Connect to `username@host:port`.
    fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        keys: &dyn SshKeyProvider,
    ) -> Result<Box<dyn SshSession>>;
}

/// [`SshConnector`] using the OpenSSH client.
pub struct OpenSshConnector {
    client: String,
    connect_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl OpenSshConnector {
    /// Create a connector running `client` (usually `ssh`).
    pub fn new(client: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            client: client.into(),
            connect_timeout: Duration::from_secs(10),
            runner,
        }
    }

    /// Override the per-connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl SshConnector for OpenSshConnector {
    fn connect(
        &self,
        host: &str,
        port: u16,
        username: &str,
        keys: &dyn SshKeyProvider,
    ) -> Result<Box<dyn SshSession>> {
        let mut session = OpenSshSession {
            client: self.client.clone(),
            destination: format!("{}@{}", username, host),
            port,
            key: keys.private_key_path().to_path_buf(),
            connect_timeout: self.connect_timeout,
            runner: Arc::clone(&self.runner),
        };

        // Probe once so an unreachable guest fails here rather than on
        // first use.
        session.exec("true")?;
        tracing::debug!(destination = %session.destination, port, "ssh session opened");
        Ok(Box::new(session))
    }
}

struct OpenSshSession {
    client: String,
    destination: String,
    port: u16,
    key: PathBuf,
    connect_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
}

impl OpenSshSession {
    fn command_line(&self, command: &str) -> Vec<String> {
        vec![
            "-i".to_string(),
            self.key.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            "-o".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "-o".to_string(),
            "LogLevel=ERROR".to_string(),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
            self.destination.clone(),
            command.to_string(),
        ]
    }
}

impl SshSession for OpenSshSession {
    fn exec(&mut self, command: &str) -> Result<CommandOutput> {
        let output = self.runner.run(&self.client, &self.command_line(command))?;
        if output.code == Some(SSH_CLIENT_ERROR) || output.code.is_none() {
            return Err(Error::Ssh(format!(
                "{}: {}",
                self.destination,
                output.diagnostic()
            )));
        }
        Ok(output)
    }
}
