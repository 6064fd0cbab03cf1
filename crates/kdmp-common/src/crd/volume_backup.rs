//! VolumeBackup Custom Resource Definition
//!
//! One VolumeBackup exists per worker job that reports progress. The driver
//! creates it next to the job with the same name; only the executor inside
//! the job writes its status, and only the driver reads it back.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::Reference;

/// Progress record published by a running worker
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackupStatus {
    /// 0 to 100
    #[serde(default)]
    pub progress_percentage: f64,

    #[serde(default)]
    pub total_bytes: u64,

    #[serde(default)]
    pub total_bytes_processed: u64,

    /// Engine-level snapshot id produced by a backup
    #[serde(default, rename = "snapshotID")]
    pub snapshot_id: String,

    /// Last error the engine reported, kept even if the engine retried
    #[serde(default)]
    pub last_known_error: String,
}

/// Specification for a VolumeBackup
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "kdmp.portworx.com",
    version = "v1alpha1",
    kind = "VolumeBackup",
    plural = "volumebackups",
    shortname = "vb",
    namespaced,
    status = "VolumeBackupStatus",
    printcolumn = r#"{"name":"Repository","type":"string","jsonPath":".spec.repository"}"#,
    printcolumn = r#"{"name":"Progress","type":"number","jsonPath":".status.progressPercentage"}"#,
    printcolumn = r#"{"name":"Snapshot","type":"string","jsonPath":".status.snapshotID"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct VolumeBackupSpec {
    /// Repository name under the `generic-backup/` prefix of the bucket
    pub repository: String,

    /// BackupLocation holding the bucket and credentials
    pub backup_location: Reference,

    /// Engine snapshot to restore or delete
    #[serde(default, rename = "snapshotID", skip_serializing_if = "String::is_empty")]
    pub snapshot_id: String,
}

impl VolumeBackup {
    /// Engine snapshot id recorded by a completed backup
    pub fn completed_snapshot_id(&self) -> Option<&str> {
        self.status
            .as_ref()
            .map(|s| s.snapshot_id.as_str())
            .filter(|id| !id.is_empty())
    }
}
