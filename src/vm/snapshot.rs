//! Snapshot records and the per-instance snapshot tree.
//!
//! Snapshots form a tree: every snapshot has at most one parent, and the
//! parent must exist. The tree is an arena keyed by snapshot index, so a
//! parent link is a plain index rather than a shared pointer. Indices are
//! monotonic and never reused, even after deletion.

use crate::error::{Error, Result};
use crate::utils::CachedRegex;
use crate::vm::description::{MemorySize, MountSpec, NetworkInterface, VirtualMachineDescription};
use crate::vm::state::VmState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

/// File the tree is persisted to, inside the instance directory.
pub const SNAPSHOTS_FILE: &str = "snapshots.json";

/// Prefix for generated snapshot names.
const GENERATED_NAME_PREFIX: &str = "snapshot";

/// Instance configuration captured at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpecs {
    /// Number of vCPUs.
    pub num_cores: u32,
    /// Memory size.
    pub mem_size: MemorySize,
    /// Disk size.
    pub disk_space: MemorySize,
    /// SSH user.
    pub ssh_username: String,
    /// Default interface MAC.
    pub default_mac: String,
    /// Extra interfaces.
    pub extra_interfaces: Vec<NetworkInterface>,
    /// Host mounts.
    pub mounts: BTreeMap<String, MountSpec>,
    /// Backend state when captured.
    pub state: VmState,
}

impl VmSpecs {
    /// Capture the live parts of a description.
    pub fn capture(desc: &VirtualMachineDescription, state: VmState) -> Self {
        Self {
            num_cores: desc.num_cores,
            mem_size: desc.mem_size,
            disk_space: desc.disk_space,
            ssh_username: desc.ssh_username.clone(),
            default_mac: desc.default_mac.clone(),
            extra_interfaces: desc.extra_interfaces.clone(),
            mounts: desc.mounts.clone(),
            state,
        }
    }

    /// Write the captured values back into a description.
    pub fn apply_to(&self, desc: &mut VirtualMachineDescription) {
        desc.num_cores = self.num_cores;
        desc.mem_size = self.mem_size;
        desc.disk_space = self.disk_space;
        desc.ssh_username = self.ssh_username.clone();
        desc.default_mac = self.default_mac.clone();
        desc.extra_interfaces = self.extra_interfaces.clone();
        desc.mounts = self.mounts.clone();
    }
}

/// One snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    name: String,
    comment: String,
    created_at: DateTime<Utc>,
    index: u32,
    parent: Option<u32>,
    specs: VmSpecs,
    cloud_init_instance_id: String,
}

impl Snapshot {
    /// Snapshot name, unique per instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form comment.
    pub fn comment(&self) -> &str {
        &self.comment
    }

    /// Creation time.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Monotonic index.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Index of the parent snapshot, `None` for a root.
    pub fn parent_index(&self) -> Option<u32> {
        self.parent
    }

    /// Captured specs.
    pub fn specs(&self) -> &VmSpecs {
        &self.specs
    }

    /// cloud-init instance id at capture time.
    pub fn cloud_init_instance_id(&self) -> &str {
        &self.cloud_init_instance_id
    }

    /// Backend-facing identifier (`@s<index>`), stable across renames.
    pub fn tag(&self) -> String {
        hvorch_qmp::snapshot_tag(self.index)
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = name;
    }

    pub(crate) fn set_comment(&mut self, comment: String) {
        self.comment = comment;
    }

    pub(crate) fn set_parent(&mut self, parent: Option<u32>) {
        self.parent = parent;
    }
}

static SNAPSHOT_NAME: CachedRegex = CachedRegex::new(r"^[A-Za-z0-9][A-Za-z0-9-]*$");

/// Check a snapshot name: alphanumerics and dashes, starting alphanumeric.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    if SNAPSHOT_NAME.get()?.is_match(name) {
        Ok(())
    } else {
        Err(Error::InvalidSnapshotName(format!("{:?}", name)))
    }
}

/// A removal in progress: the node is detached, its children re-parented.
#[derive(Debug)]
struct Detached {
    snapshot: Snapshot,
    children: Vec<u32>,
    was_head: bool,
}

/// Snapshot tree of one instance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SnapshotTree {
    vm: String,
    snapshots: BTreeMap<u32, Snapshot>,
    head: Option<u32>,
    /// Number of snapshots ever taken; the next index is `count + 1`.
    count: u32,
}

impl SnapshotTree {
    /// Empty tree for an instance.
    pub fn new(vm: impl Into<String>) -> Self {
        Self {
            vm: vm.into(),
            ..Default::default()
        }
    }

    /// Load the tree from `dir/snapshots.json`, or an empty tree if absent.
    pub fn load(vm: &str, dir: &Path) -> Result<Self> {
        let path = dir.join(SNAPSHOTS_FILE);
        if !path.exists() {
            return Ok(Self::new(vm));
        }

        let text = std::fs::read_to_string(&path)?;
        let mut tree: SnapshotTree = serde_json::from_str(&text)?;
        tree.vm = vm.to_string();
        tree.check_integrity()?;

        tracing::debug!(vm = %vm, count = tree.len(), "loaded snapshots");
        Ok(tree)
    }

    /// Persist the tree to `dir/snapshots.json` atomically.
    pub fn save(&self, dir: &Path) -> Result<()> {
        std::fs::create_dir_all(dir)?;
        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut file, self)?;
        file.flush()?;
        file.persist(dir.join(SNAPSHOTS_FILE))
            .map_err(|e| Error::Io(e.error))?;
        Ok(())
    }

    /// Verify every parent reference resolves and the head exists.
    pub fn check_integrity(&self) -> Result<()> {
        for snapshot in self.snapshots.values() {
            if let Some(parent) = snapshot.parent {
                if !self.snapshots.contains_key(&parent) {
                    return Err(Error::DanglingSnapshotReference {
                        snapshot: snapshot.name.clone(),
                        parent: parent.to_string(),
                    });
                }
            }
            if snapshot.index > self.count {
                return Err(Error::Config(format!(
                    "snapshot {} has index {} beyond count {}",
                    snapshot.name, snapshot.index, self.count
                )));
            }
        }
        if let Some(head) = self.head {
            if !self.snapshots.contains_key(&head) {
                return Err(Error::DanglingSnapshotReference {
                    snapshot: "<head>".to_string(),
                    parent: head.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Number of live snapshots.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether there are no snapshots.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    /// Number of snapshots ever taken.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// The snapshot new snapshots are parented to.
    pub fn head(&self) -> Option<&Snapshot> {
        self.head.and_then(|i| self.snapshots.get(&i))
    }

    /// Snapshots in index order.
    pub fn list(&self) -> impl Iterator<Item = &Snapshot> {
        self.snapshots.values()
    }

    /// Look up a snapshot by name.
    pub fn get(&self, name: &str) -> Result<&Snapshot> {
        self.snapshots
            .values()
            .find(|s| s.name == name)
            .ok_or_else(|| self.not_found(name))
    }

    /// Look up a snapshot by index.
    pub fn get_by_index(&self, index: u32) -> Option<&Snapshot> {
        self.snapshots.get(&index)
    }

    /// Parent of a snapshot.
    pub fn parent_of(&self, snapshot: &Snapshot) -> Option<&Snapshot> {
        snapshot.parent.and_then(|i| self.snapshots.get(&i))
    }

    /// Direct children of a snapshot.
    pub fn children_of(&self, index: u32) -> Vec<&Snapshot> {
        self.snapshots
            .values()
            .filter(|s| s.parent == Some(index))
            .collect()
    }

    /// Next generated name (`snapshotN`).
    pub fn generate_name(&self) -> String {
        let mut n = self.count + 1;
        loop {
            let candidate = format!("{}{}", GENERATED_NAME_PREFIX, n);
            if !self.contains(&candidate) {
                return candidate;
            }
            n += 1;
        }
    }

    fn contains(&self, name: &str) -> bool {
        self.snapshots.values().any(|s| s.name == name)
    }

    fn not_found(&self, name: &str) -> Error {
        Error::SnapshotNotFound {
            vm: self.vm.clone(),
            name: name.to_string(),
        }
    }

    fn index_of(&self, name: &str) -> Result<u32> {
        self.get(name).map(|s| s.index)
    }

    /// Build the next snapshot without registering it.
    ///
    /// The name is validated and must be unique; the parent is the current
    /// head. Call [`SnapshotTree::register`] once the backend capture succeeded.
    pub fn prepare(
        &self,
        name: &str,
        comment: &str,
        specs: VmSpecs,
        cloud_init_instance_id: &str,
    ) -> Result<Snapshot> {
        validate_snapshot_name(name)?;
        if self.contains(name) {
            return Err(Error::DuplicateSnapshotName {
                vm: self.vm.clone(),
                name: name.to_string(),
            });
        }

        Ok(Snapshot {
            name: name.to_string(),
            comment: comment.to_string(),
            created_at: Utc::now(),
            index: self.count + 1,
            parent: self.head,
            specs,
            cloud_init_instance_id: cloud_init_instance_id.to_string(),
        })
    }

    /// Register a prepared snapshot as the new head.
    pub fn register(&mut self, snapshot: Snapshot) -> Result<&Snapshot> {
        if snapshot.index != self.count + 1 {
            return Err(Error::Config(format!(
                "stale snapshot {} (index {}, expected {})",
                snapshot.name,
                snapshot.index,
                self.count + 1
            )));
        }
        if self.contains(&snapshot.name) {
            return Err(Error::DuplicateSnapshotName {
                vm: self.vm.clone(),
                name: snapshot.name,
            });
        }

        let index = snapshot.index;
        self.count = index;
        self.head = Some(index);
        self.snapshots.insert(index, snapshot);
        Ok(&self.snapshots[&index])
    }

    /// Delete a snapshot.
    ///
    /// Children are promoted to the deleted node's parent before `erase` is
    /// called; if `erase` fails the tree is restored exactly.
    pub fn delete_with<F>(&mut self, name: &str, erase: F) -> Result<Snapshot>
    where
        F: FnOnce(&Snapshot) -> Result<()>,
    {
        let detached = self.detach(name)?;

        match erase(&detached.snapshot) {
            Ok(()) => {
                tracing::debug!(
                    vm = %self.vm,
                    snapshot = %detached.snapshot.name,
                    reparented = detached.children.len(),
                    "deleted snapshot"
                );
                Ok(detached.snapshot)
            }
            Err(e) => {
                tracing::warn!(
                    vm = %self.vm,
                    snapshot = %detached.snapshot.name,
                    error = %e,
                    "snapshot erase failed, restoring tree"
                );
                self.reattach(detached);
                Err(e)
            }
        }
    }

    fn detach(&mut self, name: &str) -> Result<Detached> {
        let index = self.index_of(name)?;
        let snapshot = self
            .snapshots
            .remove(&index)
            .ok_or_else(|| self.not_found(name))?;

        let mut children = Vec::new();
        for child in self.snapshots.values_mut() {
            if child.parent == Some(index) {
                child.set_parent(snapshot.parent);
                children.push(child.index);
            }
        }

        let was_head = self.head == Some(index);
        if was_head {
            self.head = snapshot.parent;
        }

        Ok(Detached {
            snapshot,
            children,
            was_head,
        })
    }

    fn reattach(&mut self, detached: Detached) {
        let index = detached.snapshot.index;
        for child in detached.children {
            if let Some(s) = self.snapshots.get_mut(&child) {
                s.set_parent(Some(index));
            }
        }
        if detached.was_head {
            self.head = Some(index);
        }
        self.snapshots.insert(index, detached.snapshot);
    }

    /// Rename a snapshot.
    pub fn rename(&mut self, old: &str, new: &str) -> Result<()> {
        validate_snapshot_name(new)?;
        if old == new {
            return self.get(old).map(|_| ());
        }
        if self.contains(new) {
            return Err(Error::DuplicateSnapshotName {
                vm: self.vm.clone(),
                name: new.to_string(),
            });
        }
        let index = self.index_of(old)?;
        if let Some(s) = self.snapshots.get_mut(&index) {
            s.set_name(new.to_string());
        }
        Ok(())
    }

    /// Replace a snapshot's comment.
    pub fn set_comment(&mut self, name: &str, comment: &str) -> Result<()> {
        let index = self.index_of(name)?;
        if let Some(s) = self.snapshots.get_mut(&index) {
            s.set_comment(comment.to_string());
        }
        Ok(())
    }

    /// Make `name` the head, so the next snapshot is parented to it.
    pub fn set_head(&mut self, name: &str) -> Result<&Snapshot> {
        let index = self.index_of(name)?;
        self.head = Some(index);
        Ok(&self.snapshots[&index])
    }
}
