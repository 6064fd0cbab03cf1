//! Job plans and executor commands shared by the restic and kopia drivers

use kdmp_common::credentials::CREDENTIALS_MOUNT_PATH;
use kdmp_common::naming::{job_name, repository_name};

use crate::template::{live_source_path, DESTINATION_MOUNT_PATH, SOURCE_MOUNT_PATH};
use crate::worker::{volume_backup_spec, JobPlan};
use crate::{DriverError, DriverName, JobOptions};

pub(crate) const EXECUTOR_BINARY: &str = "kdmp-executor";

/// Backup engine run by the executor
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Engine {
    Restic,
    Kopia,
}

impl Engine {
    fn as_str(self) -> &'static str {
        match self {
            Self::Restic => "restic",
            Self::Kopia => "kopia",
        }
    }
}

struct Command(Vec<String>);

impl Command {
    fn new(engine: Engine, subcommand: &str) -> Self {
        Self(vec![
            EXECUTOR_BINARY.to_string(),
            engine.as_str().to_string(),
            subcommand.to_string(),
        ])
    }

    fn arg(mut self, flag: &str, value: impl Into<String>) -> Self {
        self.0.push(flag.to_string());
        self.0.push(value.into());
        self
    }

    fn credentials(self, secret: &str) -> Self {
        self.arg("--credentials", secret)
            .arg("--secret-file-path", CREDENTIALS_MOUNT_PATH)
    }
}

/// Plan a backup of the source PVC into the backup location. The job runs in
/// the source namespace.
pub(crate) fn backup(
    driver: DriverName,
    engine: Engine,
    opts: &JobOptions,
) -> Result<(JobPlan, Vec<String>), DriverError> {
    let source = opts.require_source(driver)?;
    let location = opts.require_backup_location(driver)?;
    let repository = opts
        .repository
        .clone()
        .unwrap_or_else(|| repository_name(&source.namespace, &source.name));
    let name = job_name(&opts.export_name, &opts.export_namespace, &source.name);

    let source_path = match &opts.live {
        Some(live) => live_source_path(live),
        None => SOURCE_MOUNT_PATH.to_string(),
    };
    let command = Command::new(engine, "backup")
        .arg("--volume-backup-name", &name)
        .arg("--namespace", &source.namespace)
        .arg("--repository", &repository)
        .credentials(&name)
        .arg("--source-path", source_path);

    let plan = JobPlan {
        source_pvc: opts.live.is_none().then(|| source.name.clone()),
        live: opts.live.clone(),
        volume_backup: Some(volume_backup_spec(&repository, location, None)),
        backup_location: Some(location.clone()),
        ..JobPlan::new(driver, name, &source.namespace)
    };
    Ok((plan, command.0))
}

/// Plan a restore of an engine snapshot into the destination PVC. The job
/// runs in the destination namespace.
pub(crate) fn restore(
    driver: DriverName,
    engine: Engine,
    opts: &JobOptions,
) -> Result<(JobPlan, Vec<String>), DriverError> {
    let destination = opts.require_destination(driver)?;
    let location = opts.require_backup_location(driver)?;
    let snapshot_id = opts.require_snapshot_id(driver)?;
    let repository = opts
        .repository
        .clone()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| DriverError::invalid_options(driver, "repository is required"))?;
    let name = job_name(&opts.export_name, &opts.export_namespace, &destination.name);

    let command = Command::new(engine, "restore")
        .arg("--volume-backup-name", &name)
        .arg("--namespace", &destination.namespace)
        .arg("--repository", &repository)
        .credentials(&name)
        .arg("--snapshot-id", snapshot_id)
        .arg("--target-path", DESTINATION_MOUNT_PATH);

    let plan = JobPlan {
        destination_pvc: Some(destination.name.clone()),
        volume_backup: Some(volume_backup_spec(&repository, location, Some(snapshot_id))),
        backup_location: Some(location.clone()),
        ..JobPlan::new(driver, name, &destination.namespace)
    };
    Ok((plan, command.0))
}

/// Plan a repository-level operation (`delete` or `maintenance`). The job
/// runs in the backup location namespace and reports no progress.
pub(crate) fn repository_task(
    driver: DriverName,
    subcommand: &str,
    opts: &JobOptions,
    snapshot_id: Option<&str>,
) -> Result<(JobPlan, Vec<String>), DriverError> {
    let location = opts.require_backup_location(driver)?;
    let repository = opts
        .repository
        .clone()
        .filter(|r| !r.is_empty())
        .ok_or_else(|| DriverError::invalid_options(driver, "repository is required"))?;
    let name = job_name(
        &opts.export_name,
        &opts.export_namespace,
        &format!("{}-{}", repository, subcommand),
    );

    let mut command = Command::new(Engine::Kopia, subcommand)
        .arg("--namespace", &location.namespace)
        .arg("--repository", &repository)
        .credentials(&name);
    if let Some(id) = snapshot_id {
        command = command.arg("--snapshot-id", id);
    }

    let plan = JobPlan {
        backup_location: Some(location.clone()),
        ..JobPlan::new(driver, name, &location.namespace)
    };
    Ok((plan, command.0))
}
