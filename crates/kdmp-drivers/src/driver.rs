//! The transfer driver contract

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use kdmp_common::config::WorkerKind;

use crate::DriverError;

/// Every driver KDMP ships
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DriverName {
    Rsync,
    ResticBackup,
    ResticRestore,
    KopiaBackup,
    KopiaRestore,
    KopiaDelete,
    KopiaMaintenance,
}

impl DriverName {
    pub const ALL: [DriverName; 7] = [
        Self::Rsync,
        Self::ResticBackup,
        Self::ResticRestore,
        Self::KopiaBackup,
        Self::KopiaRestore,
        Self::KopiaDelete,
        Self::KopiaMaintenance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Rsync => "rsync",
            Self::ResticBackup => "resticbackup",
            Self::ResticRestore => "resticrestore",
            Self::KopiaBackup => "kopiabackup",
            Self::KopiaRestore => "kopiarestore",
            Self::KopiaDelete => "kopiadelete",
            Self::KopiaMaintenance => "kopiamaintenance",
        }
    }

    /// Image family used for this driver's jobs
    pub fn worker_kind(&self) -> WorkerKind {
        match self {
            Self::Rsync => WorkerKind::Rsync,
            Self::ResticBackup | Self::ResticRestore => WorkerKind::ResticExecutor,
            Self::KopiaBackup | Self::KopiaRestore | Self::KopiaDelete | Self::KopiaMaintenance => {
                WorkerKind::KopiaExecutor
            }
        }
    }

    /// Concurrent jobs allowed when `kdmp-config` sets no limit
    pub fn default_max_jobs(&self) -> usize {
        match self {
            Self::KopiaMaintenance => 1,
            _ => 5,
        }
    }

    /// Backups read a live source and tolerate it being mounted
    pub fn is_backup(&self) -> bool {
        matches!(self, Self::ResticBackup | Self::KopiaBackup)
    }

    pub fn is_restore(&self) -> bool {
        matches!(self, Self::ResticRestore | Self::KopiaRestore)
    }
}

impl fmt::Display for DriverName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DriverName {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|d| d.as_str() == s)
            .ok_or_else(|| DriverError::NotRegistered(s.to_string()))
    }
}

/// `namespace/name` of an object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A mounted source read through the kubelet's pod directory
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LiveSource {
    /// UID of a pod that mounts the source PVC
    pub pod_uid: String,
    /// Node that pod runs on; the job is pinned there
    pub node_name: String,
    /// PersistentVolume bound to the source PVC
    pub volume_name: String,
}

/// Everything a driver needs to launch a job
#[derive(Clone, Debug, Default, PartialEq)]
pub struct JobOptions {
    pub export_name: String,
    pub export_namespace: String,
    /// Set to make the DataExport own the job when they share a namespace
    pub export_uid: Option<String>,
    /// PVC read by the worker (backup, rsync)
    pub source_pvc: Option<ObjectKey>,
    /// PVC written by the worker (restore, rsync)
    pub destination_pvc: Option<ObjectKey>,
    pub backup_location: Option<ObjectKey>,
    /// Repository override; derived from the PVC when unset
    pub repository: Option<String>,
    /// Engine snapshot to restore or delete
    pub snapshot_id: Option<String>,
    /// Read the source through the kubelet instead of mounting the PVC
    pub live: Option<LiveSource>,
}

impl JobOptions {
    pub fn new(export_name: impl Into<String>, export_namespace: impl Into<String>) -> Self {
        Self {
            export_name: export_name.into(),
            export_namespace: export_namespace.into(),
            ..Default::default()
        }
    }

    pub fn require_source(&self, driver: DriverName) -> Result<&ObjectKey, DriverError> {
        self.source_pvc
            .as_ref()
            .ok_or_else(|| DriverError::invalid_options(driver, "source PVC is required"))
    }

    pub fn require_destination(&self, driver: DriverName) -> Result<&ObjectKey, DriverError> {
        self.destination_pvc
            .as_ref()
            .ok_or_else(|| DriverError::invalid_options(driver, "destination PVC is required"))
    }

    pub fn require_backup_location(&self, driver: DriverName) -> Result<&ObjectKey, DriverError> {
        self.backup_location
            .as_ref()
            .ok_or_else(|| DriverError::invalid_options(driver, "backup location is required"))
    }

    pub fn require_snapshot_id(&self, driver: DriverName) -> Result<&str, DriverError> {
        self.snapshot_id
            .as_deref()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| DriverError::invalid_options(driver, "snapshot id is required"))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    InProgress,
    Completed,
    Failed,
}

/// Status of a worker job as seen by its driver
#[derive(Clone, Debug, PartialEq)]
pub struct JobInfo {
    pub state: JobState,
    /// 0 to 100
    pub progress: f64,
    pub reason: String,
    /// Last error the engine reported, empty when none
    pub last_error: String,
}

impl JobInfo {
    pub fn in_progress(progress: f64) -> Self {
        Self {
            state: JobState::InProgress,
            progress,
            reason: String::new(),
            last_error: String::new(),
        }
    }

    pub fn completed() -> Self {
        Self {
            state: JobState::Completed,
            progress: 100.0,
            reason: String::new(),
            last_error: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: JobState::Failed,
            progress: 0.0,
            reason: reason.into(),
            last_error: String::new(),
        }
    }

    pub fn with_last_error(mut self, error: impl Into<String>) -> Self {
        self.last_error = error.into();
        self
    }
}

/// Start, stop and observe an out-of-process transfer job
#[async_trait]
pub trait TransferDriver: Send + Sync {
    fn name(&self) -> DriverName;

    /// Launch the job, or return the id of the job already launched for
    /// the same options. Returns `namespace/name`.
    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError>;

    /// Delete the job and everything created with it. NotFound is success.
    async fn delete_job(&self, id: &str) -> Result<(), DriverError>;

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError>;
}

/// Job id for a job in `namespace`
pub fn job_id(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a job id into (namespace, name)
pub fn parse_job_id(id: &str) -> Result<(&str, &str), DriverError> {
    match id.split_once('/') {
        Some((ns, name)) if !ns.is_empty() && !name.is_empty() && !name.contains('/') => {
            Ok((ns, name))
        }
        _ => Err(DriverError::InvalidJobId(id.to_string())),
    }
}
