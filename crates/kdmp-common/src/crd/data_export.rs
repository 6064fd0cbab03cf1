//! DataExport Custom Resource Definition
//!
//! A DataExport asks KDMP to move the contents of a volume somewhere else:
//! another PVC (rsync), an object store behind a BackupLocation
//! (restic/kopia backup), or back out of one (restic/kopia restore). The
//! reconciler owns the status and walks it through [`DataExportStage`].

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Reference;

/// Backup engine requested for a transfer
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum DataExportType {
    #[default]
    Rsync,
    Restic,
    Kopia,
}

impl std::fmt::Display for DataExportType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rsync => write!(f, "rsync"),
            Self::Restic => write!(f, "restic"),
            Self::Kopia => write!(f, "kopia"),
        }
    }
}

/// Stage of a DataExport, in the order they are visited
///
/// The snapshot stages are only visited when a snapshot storage class is set.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
pub enum DataExportStage {
    #[default]
    Initial,
    SnapshotScheduled,
    SnapshotInProgress,
    SnapshotRestore,
    TransferScheduled,
    TransferInProgress,
    Final,
}

impl DataExportStage {
    /// Stage that follows this one, or `None` at [`DataExportStage::Final`]
    pub fn next(self, with_snapshot: bool) -> Option<Self> {
        match self {
            Self::Initial if with_snapshot => Some(Self::SnapshotScheduled),
            Self::Initial => Some(Self::TransferScheduled),
            Self::SnapshotScheduled => Some(Self::SnapshotInProgress),
            Self::SnapshotInProgress => Some(Self::SnapshotRestore),
            Self::SnapshotRestore => Some(Self::TransferScheduled),
            Self::TransferScheduled => Some(Self::TransferInProgress),
            Self::TransferInProgress => Some(Self::Final),
            Self::Final => None,
        }
    }

    pub fn is_snapshot_stage(self) -> bool {
        matches!(
            self,
            Self::SnapshotScheduled | Self::SnapshotInProgress | Self::SnapshotRestore
        )
    }
}

impl std::fmt::Display for DataExportStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::SnapshotScheduled => write!(f, "SnapshotScheduled"),
            Self::SnapshotInProgress => write!(f, "SnapshotInProgress"),
            Self::SnapshotRestore => write!(f, "SnapshotRestore"),
            Self::TransferScheduled => write!(f, "TransferScheduled"),
            Self::TransferInProgress => write!(f, "TransferInProgress"),
            Self::Final => write!(f, "Final"),
        }
    }
}

/// Outcome of the current stage
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
pub enum StageStatus {
    #[default]
    Initial,
    InProgress,
    Successful,
    Failed,
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initial => write!(f, "Initial"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Successful => write!(f, "Successful"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Status of a DataExport
///
/// Every field is always serialized so that a merge patch clears values
/// that were reset on a stage transition.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DataExportStatus {
    #[serde(default)]
    pub stage: DataExportStage,

    #[serde(default)]
    pub status: StageStatus,

    /// Why the current stage failed or is waiting
    #[serde(default)]
    pub reason: String,

    /// `namespace/name` of the worker job
    #[serde(default, rename = "transferID")]
    pub transfer_id: String,

    /// Driver that runs the worker job, recorded with `transfer_id`
    #[serde(default)]
    pub driver_name: String,

    /// Name of the volume snapshot taken of the source
    #[serde(default, rename = "snapshotID")]
    pub snapshot_id: String,

    #[serde(default)]
    pub snapshot_namespace: String,

    /// PVC restored from the snapshot and used as the transfer source
    #[serde(default, rename = "snapshotPVCName")]
    pub snapshot_pvc_name: String,

    #[serde(default, rename = "snapshotPVCNamespace")]
    pub snapshot_pvc_namespace: String,

    /// Transfer progress, 0 to 100
    #[serde(default)]
    pub progress_percentage: i32,
}

impl DataExportStatus {
    pub fn is_failed(&self) -> bool {
        self.status == StageStatus::Failed
    }

    /// Terminal success: the Final stage has completed
    pub fn is_done(&self) -> bool {
        self.stage == DataExportStage::Final && self.status == StageStatus::Successful
    }
}

/// Specification for a DataExport
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kdmp.portworx.com",
    version = "v1alpha1",
    kind = "DataExport",
    plural = "dataexports",
    shortname = "dex",
    namespaced,
    status = "DataExportStatus",
    printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#,
    printcolumn = r#"{"name":"Stage","type":"string","jsonPath":".status.stage"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.status"}"#,
    printcolumn = r#"{"name":"Progress","type":"integer","jsonPath":".status.progressPercentage"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct DataExportSpec {
    /// Engine used for the transfer
    #[serde(rename = "type")]
    pub type_: DataExportType,

    /// When set, the source is snapshotted first and the transfer reads
    /// from a PVC restored from that snapshot. `stork-snapshot` selects the
    /// external-storage snapshotter; any other value names a CSI
    /// VolumeSnapshotClass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_storage_class: Option<String>,

    pub source: Reference,

    pub destination: Reference,
}

impl DataExportSpec {
    /// Snapshot storage class, treating an empty string as unset
    pub fn snapshot_class(&self) -> Option<&str> {
        self.snapshot_storage_class
            .as_deref()
            .filter(|class| !class.is_empty())
    }
}

impl DataExport {
    /// Current status, or the default (Initial/Initial) for a new object
    pub fn current_status(&self) -> DataExportStatus {
        self.status.clone().unwrap_or_default()
    }
}
