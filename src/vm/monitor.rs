//! Durable VM status reporting.
//!
//! The orchestrator reports every transition through [`VmStatusMonitor`]
//! before the transition call returns. [`StateStore`] is the default
//! implementation, backed by an embedded redb database so that the last
//! known state and backend metadata survive a daemon restart.

use crate::error::{Error, Result};
use crate::vm::state::VmState;
use redb::{Database, ReadableTable, TableDefinition};
use serde_json::Value;
use std::path::{Path, PathBuf};

/// Sink for state changes and store for per-instance backend metadata.
///
/// Implementations must be synchronous: when `persist_state_for` returns,
/// the state is durable.
pub trait VmStatusMonitor: Send + Sync {
    /// Record the state of an instance.
    fn persist_state_for(&self, name: &str, state: VmState) -> Result<()>;

    /// Backend metadata stored for an instance (empty object if none).
    fn retrieve_metadata_for(&self, name: &str) -> Result<Value>;

    /// Replace the backend metadata stored for an instance.
    fn update_metadata_for(&self, name: &str, metadata: &Value) -> Result<()>;

    /// An instance was suspended.
    fn on_suspend(&self);

    /// An instance was started or resumed.
    fn on_resume(&self);

    /// An instance shut down.
    fn on_shutdown(&self);

    /// The guest of `name` rebooted.
    fn on_restart(&self, name: &str);
}

/// Instance name -> state name.
const STATE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("vm_state");

/// Instance name -> JSON metadata.
const METADATA_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vm_metadata");

fn db_err(e: impl std::fmt::Display) -> Error {
    Error::Database(e.to_string())
}

/// redb-backed [`VmStatusMonitor`].
pub struct StateStore {
    db: Database,
    path: PathBuf,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore").field("path", &self.path).finish()
    }
}

impl StateStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path).map_err(db_err)?;

        // Create both tables up front so read transactions never see a
        // missing table.
        let txn = db.begin_write().map_err(db_err)?;
        {
            txn.open_table(STATE_TABLE).map_err(db_err)?;
            txn.open_table(METADATA_TABLE).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        tracing::debug!(path = %path.display(), "opened state store");
        Ok(Self {
            db,
            path: path.to_path_buf(),
        })
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last persisted state of an instance.
    pub fn state_for(&self, name: &str) -> Result<Option<VmState>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(STATE_TABLE).map_err(db_err)?;

        match table.get(name).map_err(db_err)? {
            Some(value) => {
                let state = serde_json::from_value(Value::String(value.value().to_string()))?;
                Ok(Some(state))
            }
            None => Ok(None),
        }
    }

    /// All persisted states, ordered by instance name.
    pub fn all_states(&self) -> Result<Vec<(String, VmState)>> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(STATE_TABLE).map_err(db_err)?;

        let mut states = Vec::new();
        for item in table.iter().map_err(db_err)? {
            let (key, value) = item.map_err(db_err)?;
            let state = serde_json::from_value(Value::String(value.value().to_string()))?;
            states.push((key.value().to_string(), state));
        }
        Ok(states)
    }

    /// Forget everything stored for an instance.
    pub fn remove(&self, name: &str) -> Result<()> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut states = txn.open_table(STATE_TABLE).map_err(db_err)?;
            states.remove(name).map_err(db_err)?;
            let mut metadata = txn.open_table(METADATA_TABLE).map_err(db_err)?;
            metadata.remove(name).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }
}

impl VmStatusMonitor for StateStore {
    fn persist_state_for(&self, name: &str, state: VmState) -> Result<()> {
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(STATE_TABLE).map_err(db_err)?;
            table.insert(name, state.name()).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;

        tracing::debug!(vm = %name, state = %state, "persisted state");
        Ok(())
    }

    fn retrieve_metadata_for(&self, name: &str) -> Result<Value> {
        let txn = self.db.begin_read().map_err(db_err)?;
        let table = txn.open_table(METADATA_TABLE).map_err(db_err)?;

        match table.get(name).map_err(db_err)? {
            Some(bytes) => Ok(serde_json::from_slice(bytes.value())?),
            None => Ok(Value::Object(Default::default())),
        }
    }

    fn update_metadata_for(&self, name: &str, metadata: &Value) -> Result<()> {
        let bytes = serde_json::to_vec(metadata)?;
        let txn = self.db.begin_write().map_err(db_err)?;
        {
            let mut table = txn.open_table(METADATA_TABLE).map_err(db_err)?;
            table.insert(name, bytes.as_slice()).map_err(db_err)?;
        }
        txn.commit().map_err(db_err)?;
        Ok(())
    }

    fn on_suspend(&self) {
        tracing::info!("instance suspended");
    }

    fn on_resume(&self) {
        tracing::info!("instance resumed");
    }

    fn on_shutdown(&self) {
        tracing::info!("instance shut down");
    }

    fn on_restart(&self, name: &str) {
        tracing::info!(vm = %name, "instance restarting");
    }
}
