//! Worker-side half of KDMP
//!
//! Runs inside the jobs the transfer drivers launch: resolves the data to
//! move, drives restic, kopia or rsync, and writes progress back to the
//! job's VolumeBackup.

pub mod cli;
pub mod credentials;
pub mod error;
pub mod kopia;
pub mod process;
pub mod progress;
pub mod repository;
pub mod restic;
pub mod rsync;
pub mod source;
pub mod status;

use std::sync::Arc;

use kube::Client;
use tracing::info;

use cli::{Cli, Command, KopiaCommand, ResticCommand};
use status::{KubeStatusSink, StatusSink};

pub use error::ExecutorError;

/// Status sink for the VolumeBackup named on the command line
async fn volume_backup_sink(
    namespace: &str,
    name: &str,
) -> Result<Arc<dyn StatusSink>, ExecutorError> {
    let client = Client::try_default().await?;
    Ok(Arc::new(KubeStatusSink::new(client, namespace, name)))
}

/// Execute one parsed command line
pub async fn run(cli: Cli) -> Result<(), ExecutorError> {
    match cli.command {
        Command::Restic { op } => match op {
            ResticCommand::Backup(args) => {
                let sink = volume_backup_sink(&args.repo.namespace, &args.volume_backup_name).await?;
                let status = restic::backup(&args, sink).await?;
                info!(snapshot = %status.snapshot_id, bytes = status.total_bytes, "backup completed");
            }
            ResticCommand::Restore(args) => {
                let sink = volume_backup_sink(&args.repo.namespace, &args.volume_backup_name).await?;
                restic::restore(&args, sink).await?;
                info!(snapshot = %args.snapshot_id, "restore completed");
            }
        },
        Command::Kopia { op } => match op {
            KopiaCommand::Backup(args) => {
                let sink = volume_backup_sink(&args.repo.namespace, &args.volume_backup_name).await?;
                let status = kopia::backup(&args, sink).await?;
                info!(snapshot = %status.snapshot_id, bytes = status.total_bytes, "backup completed");
            }
            KopiaCommand::Restore(args) => {
                let sink = volume_backup_sink(&args.repo.namespace, &args.volume_backup_name).await?;
                kopia::restore(&args, sink).await?;
                info!(snapshot = %args.snapshot_id, "restore completed");
            }
            KopiaCommand::Delete(args) => kopia::delete(&args).await?,
            KopiaCommand::Maintenance(args) => kopia::maintenance(&args).await?,
        },
        Command::Rsync(args) => rsync::run(&args).await?,
    }
    Ok(())
}
