//! Error types for hvorch.

use std::time::Duration;
use thiserror::Error;

/// Result type alias using hvorch's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// A capability the selected backend does not provide.
///
/// Returned by the `require_*_support` checks so callers can gate an
/// operation before any native call is attempted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{operation} is not supported on the {backend} backend")]
pub struct CapabilityError {
    /// Backend name (e.g. "lxd").
    pub backend: &'static str,
    /// Operation that was requested (e.g. "suspend").
    pub operation: &'static str,
}

/// Errors that can occur in hvorch operations.
#[derive(Error, Debug)]
pub enum Error {
    // Capability errors
    /// Operation not available on this backend.
    #[error(transparent)]
    NotSupported(#[from] CapabilityError),

    // VM lifecycle errors
    /// Backend failed to start the instance.
    #[error("failed to start {name}: {reason}")]
    StartFailure {
        /// Instance name.
        name: String,
        /// Native diagnostic.
        reason: String,
    },

    /// Instance went away while the caller was waiting for it.
    #[error("{name} is not running: {reason}")]
    VmNotRunning {
        /// Instance name.
        name: String,
        /// Last known diagnostic message.
        reason: String,
    },

    /// Foreground operation failed against a reachable backend.
    #[error("{operation} failed for {name}: {message}")]
    OperationFailed {
        /// Operation name (e.g. "suspend").
        operation: String,
        /// Instance name.
        name: String,
        /// Native diagnostic text.
        message: String,
    },

    /// VM is in an invalid state for the requested operation.
    #[error("invalid vm state: expected {expected}, got {actual}")]
    InvalidState {
        /// Expected state.
        expected: String,
        /// Actual state.
        actual: String,
    },

    /// Rejected resize or reconfiguration.
    #[error("invalid {what}: {reason}")]
    InvalidResize {
        /// What was being changed ("memory", "disk", "cpus").
        what: &'static str,
        /// Why it was rejected.
        reason: String,
    },

    /// Timed out waiting for an operation.
    #[error("timed out after {after:?} waiting for {operation}")]
    Timeout {
        /// What we were waiting for.
        operation: String,
        /// How long we waited.
        after: Duration,
    },

    // Snapshot errors
    /// A snapshot with that name already exists.
    #[error("snapshot {name} already exists for {vm}")]
    DuplicateSnapshotName {
        /// Instance name.
        vm: String,
        /// Snapshot name.
        name: String,
    },

    /// No snapshot with that name.
    #[error("no snapshot named {name} for {vm}")]
    SnapshotNotFound {
        /// Instance name.
        vm: String,
        /// Snapshot name.
        name: String,
    },

    /// A snapshot references a parent that does not exist.
    #[error("snapshot {snapshot} references missing parent {parent}")]
    DanglingSnapshotReference {
        /// Child snapshot.
        snapshot: String,
        /// Missing parent (name or index).
        parent: String,
    },

    /// Snapshot name failed validation.
    #[error("invalid snapshot name: {0}")]
    InvalidSnapshotName(String),

    // Native tooling errors
    /// External command failed.
    #[error("command failed: {command}: {message}")]
    CommandFailed {
        /// The command that failed.
        command: String,
        /// Error message.
        message: String,
    },

    /// LXD REST API returned an error.
    #[error("lxd error ({code}): {message}")]
    Lxd {
        /// HTTP or LXD error code.
        code: u16,
        /// Error text from the response body.
        message: String,
    },

    /// SSH failure talking to the guest.
    #[error("ssh error: {0}")]
    Ssh(String),

    // Configuration errors
    /// Generic configuration error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    /// State database error.
    #[error("database error: {0}")]
    Database(String),

    /// JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an operation failure carrying the native diagnostic.
    pub fn operation_failed(
        operation: impl Into<String>,
        name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::OperationFailed {
            operation: operation.into(),
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a command failed error.
    pub fn command_failed(command: impl Into<String>, message: impl Into<String>) -> Self {
        Self::CommandFailed {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Create a start failure.
    pub fn start_failure(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StartFailure {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, after: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            after,
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(expected: impl Into<String>, actual: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            expected: expected.into(),
            actual: actual.to_string(),
        }
    }

    /// Whether this is an LXD 404.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::Lxd { code: 404, .. })
    }

    /// The native diagnostic text, without the wrapping context.
    pub fn diagnostic(&self) -> String {
        match self {
            Error::OperationFailed { message, .. } => message.clone(),
            Error::CommandFailed { message, .. } => message.clone(),
            Error::StartFailure { reason, .. } | Error::VmNotRunning { reason, .. } => {
                reason.clone()
            }
            Error::Lxd { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}
