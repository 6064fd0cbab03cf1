//! Command line of the worker container
//!
//! Drivers build these argument lists when they render a job; every flag
//! here has a counterpart in the drivers' command builders.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use kdmp_common::credentials::CREDENTIALS_MOUNT_PATH;

/// kdmp-executor - moves volume data inside KDMP worker jobs
#[derive(Parser, Debug)]
#[command(name = "kdmp-executor", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Back up or restore with restic
    Restic {
        #[command(subcommand)]
        op: ResticCommand,
    },

    /// Back up, restore or maintain a kopia repository
    Kopia {
        #[command(subcommand)]
        op: KopiaCommand,
    },

    /// Copy one mounted volume onto another
    Rsync(RsyncArgs),
}

#[derive(Subcommand, Debug)]
pub enum ResticCommand {
    Backup(BackupArgs),
    Restore(RestoreArgs),
}

#[derive(Subcommand, Debug)]
pub enum KopiaCommand {
    Backup(BackupArgs),
    Restore(RestoreArgs),
    /// Remove one snapshot from the repository
    Delete(DeleteArgs),
    /// Run full repository maintenance
    Maintenance(RepositoryArgs),
}

/// Where the repository lives and how to open it
#[derive(Args, Debug, Clone)]
pub struct RepositoryArgs {
    /// Namespace of the job and its VolumeBackup
    #[arg(long)]
    pub namespace: String,

    /// Repository name under the `generic-backup/` prefix
    #[arg(long)]
    pub repository: String,

    /// Name of the credentials secret, logged for diagnostics
    #[arg(long)]
    pub credentials: String,

    /// Directory the credentials secret is mounted at
    #[arg(long, default_value = CREDENTIALS_MOUNT_PATH)]
    pub secret_file_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct BackupArgs {
    /// VolumeBackup that receives progress
    #[arg(long)]
    pub volume_backup_name: String,

    #[command(flatten)]
    pub repo: RepositoryArgs,

    /// Directory to back up; may hold one `*` segment
    #[arg(long)]
    pub source_path: String,
}

#[derive(Args, Debug, Clone)]
pub struct RestoreArgs {
    #[arg(long)]
    pub volume_backup_name: String,

    #[command(flatten)]
    pub repo: RepositoryArgs,

    /// Engine snapshot to restore
    #[arg(long)]
    pub snapshot_id: String,

    #[arg(long)]
    pub target_path: PathBuf,
}

#[derive(Args, Debug, Clone)]
pub struct DeleteArgs {
    #[command(flatten)]
    pub repo: RepositoryArgs,

    #[arg(long)]
    pub snapshot_id: String,
}

#[derive(Args, Debug, Clone)]
pub struct RsyncArgs {
    #[arg(long)]
    pub source_path: PathBuf,

    #[arg(long)]
    pub destination_path: PathBuf,

    /// Extra rsync flags as one space-separated string
    #[arg(long, default_value = "", allow_hyphen_values = true)]
    pub rsync_flags: String,
}

impl RsyncArgs {
    pub fn flags(&self) -> Vec<String> {
        self.rsync_flags
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}
