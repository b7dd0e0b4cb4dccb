//! Snapshot commands.

use super::Context;
use clap::{Args, Subcommand};

/// Manage instance snapshots
#[derive(Subcommand, Debug)]
pub enum SnapshotCmd {
    /// Take a snapshot
    Take(SnapshotTakeCmd),
    /// List snapshots
    #[command(alias = "list")]
    Ls(SnapshotLsCmd),
    /// Delete a snapshot
    #[command(alias = "rm")]
    Delete(SnapshotRefCmd),
    /// Roll a stopped instance back to a snapshot
    Restore(SnapshotRefCmd),
    /// Rename a snapshot
    Rename(SnapshotRenameCmd),
    /// Replace a snapshot's comment
    Comment(SnapshotCommentCmd),
}

impl SnapshotCmd {
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        match self {
            SnapshotCmd::Take(cmd) => cmd.run(ctx),
            SnapshotCmd::Ls(cmd) => cmd.run(ctx),
            SnapshotCmd::Delete(cmd) => {
                let vm = ctx.open(&cmd.name)?;
                let deleted = vm.delete_snapshot(&cmd.snapshot)?;
                println!("Deleted snapshot '{}' of '{}'", deleted.name(), cmd.name);
                Ok(())
            }
            SnapshotCmd::Restore(cmd) => {
                let vm = ctx.open(&cmd.name)?;
                vm.restore_snapshot(&cmd.snapshot)?;
                println!("Restored '{}' to snapshot '{}'", cmd.name, cmd.snapshot);
                Ok(())
            }
            SnapshotCmd::Rename(cmd) => {
                let vm = ctx.open(&cmd.name)?;
                vm.rename_snapshot(&cmd.snapshot, &cmd.new_name)?;
                println!("Renamed snapshot '{}' to '{}'", cmd.snapshot, cmd.new_name);
                Ok(())
            }
            SnapshotCmd::Comment(cmd) => {
                let vm = ctx.open(&cmd.name)?;
                vm.set_snapshot_comment(&cmd.snapshot, &cmd.comment)?;
                Ok(())
            }
        }
    }
}

/// Take a snapshot
#[derive(Args, Debug)]
pub struct SnapshotTakeCmd {
    /// Instance name.
    pub name: String,

    /// Snapshot name (default: generated).
    #[arg(long, default_value = "")]
    pub snapshot: String,

    /// Free-form comment.
    #[arg(short, long, default_value = "")]
    pub comment: String,
}

impl SnapshotTakeCmd {
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let vm = ctx.open(&self.name)?;
        let snapshot = vm.take_snapshot(&self.snapshot, &self.comment)?;
        println!("Took snapshot '{}' of '{}'", snapshot.name(), self.name);
        Ok(())
    }
}

/// List snapshots
#[derive(Args, Debug)]
pub struct SnapshotLsCmd {
    /// Instance name.
    pub name: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

impl SnapshotLsCmd {
    pub fn run(self, ctx: &Context) -> hvorch::Result<()> {
        let vm = ctx.open(&self.name)?;
        let snapshots = vm.list_snapshots();

        if self.json {
            println!("{}", serde_json::to_string_pretty(&snapshots)?);
            return Ok(());
        }

        if snapshots.is_empty() {
            println!("No snapshots found");
            return Ok(());
        }

        let head = vm.head_snapshot().map(|s| s.index());
        println!(
            "{:<2} {:<20} {:<20} {:<20} {}",
            "", "NAME", "PARENT", "CREATED", "COMMENT"
        );
        println!("{}", "-".repeat(80));
        for snapshot in &snapshots {
            let parent = snapshot
                .parent_index()
                .and_then(|i| snapshots.iter().find(|s| s.index() == i))
                .map(|s| s.name().to_string())
                .unwrap_or_else(|| "-".to_string());
            let marker = if head == Some(snapshot.index()) { "*" } else { "" };

            println!(
                "{:<2} {:<20} {:<20} {:<20} {}",
                marker,
                snapshot.name(),
                parent,
                snapshot.created_at().format("%Y-%m-%d %H:%M:%S").to_string(),
                snapshot.comment().lines().next().unwrap_or_default(),
            );
        }
        Ok(())
    }
}

/// Identify a snapshot of an instance
#[derive(Args, Debug)]
pub struct SnapshotRefCmd {
    /// Instance name.
    pub name: String,

    /// Snapshot name.
    pub snapshot: String,
}

/// Rename a snapshot
#[derive(Args, Debug)]
pub struct SnapshotRenameCmd {
    /// Instance name.
    pub name: String,

    /// Current snapshot name.
    pub snapshot: String,

    /// New snapshot name.
    pub new_name: String,
}

/// Replace a snapshot's comment
#[derive(Args, Debug)]
pub struct SnapshotCommentCmd {
    /// Instance name.
    pub name: String,

    /// Snapshot name.
    pub snapshot: String,

    /// New comment.
    pub comment: String,
}
