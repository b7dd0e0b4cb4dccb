//! hvorch - one VM lifecycle state machine over many hypervisors.
//!
//! The library drives QEMU, libvirt, Hyper-V, VirtualBox and LXD through a
//! single [`BackendDriver`](vm::BackendDriver) trait and layers a per-instance
//! orchestrator on top:
//!
//! - [`vm::VirtualMachine`] serializes lifecycle transitions, reconciles the
//!   cached state with backend probes and asynchronous backend events, and
//!   reports every change to a [`vm::VmStatusMonitor`].
//! - [`vm::DelayedShutdownTimer`] holds an instance in `delayed_shutdown`
//!   until it fires or is cancelled.
//! - [`vm::SnapshotTree`] tracks parent-linked snapshots with rollback on
//!   failed deletes.
//!
//! # Example
//!
//! ```no_run
//! use hvorch::config::DaemonConfig;
//! use hvorch::vm::{ShutdownPolicy, VirtualMachine};
//!
//! # fn open(config: &DaemonConfig) -> hvorch::Result<VirtualMachine> { unimplemented!() }
//! # fn main() -> hvorch::Result<()> {
//! let config = DaemonConfig::load()?;
//! let vm = open(&config)?;
//! vm.start()?;
//! vm.ensure_vm_is_running()?;
//! vm.shutdown(ShutdownPolicy::Graceful)?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod cloud_init;
pub mod config;
pub mod error;
pub mod network;
pub mod process;
pub mod ssh;
pub mod utils;
pub mod vm;

pub use config::DaemonConfig;
pub use error::{CapabilityError, Error, Result};
pub use vm::{
    BackendKind, DelayedShutdownTimer, ShutdownPolicy, VirtualMachine, VirtualMachineDescription,
    VmServices, VmState,
};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
