//! The snapshot driver contract

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, PersistentVolumeClaimSpec};

use crate::SnapshotError;

/// Snapshot a PVC
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SnapshotRequest {
    /// Derived snapshot name, stable across retries
    pub name: String,
    pub pvc_namespace: String,
    pub pvc_name: String,
    /// Snapshot storage class from the DataExport
    pub class: String,
    pub labels: BTreeMap<String, String>,
}

/// Where a snapshot lives
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SnapshotRef {
    pub name: String,
    pub namespace: String,
}

impl SnapshotRef {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
        }
    }
}

impl fmt::Display for SnapshotRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Restore a snapshot into a new PVC
#[derive(Clone, Debug, PartialEq)]
pub struct RestoreRequest {
    pub snapshot: SnapshotRef,
    /// Name of the restored PVC
    pub name: String,
    /// Namespace of the restored PVC; may differ from the snapshot's
    pub namespace: String,
    /// The snapshotted PVC; access modes and size are copied from it
    pub source: PersistentVolumeClaim,
    pub labels: BTreeMap<String, String>,
}

impl RestoreRequest {
    /// Spec of the restored claim before the backend adds its data source
    pub(crate) fn base_spec(&self) -> PersistentVolumeClaimSpec {
        let source = self.source.spec.clone().unwrap_or_default();
        PersistentVolumeClaimSpec {
            access_modes: source.access_modes,
            resources: source.resources,
            storage_class_name: source.storage_class_name,
            volume_mode: source.volume_mode,
            ..Default::default()
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SnapshotState {
    Unknown,
    InProgress,
    Ready,
    Failed,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub state: SnapshotState,
    pub reason: String,
}

impl SnapshotInfo {
    pub fn new(state: SnapshotState) -> Self {
        Self {
            state,
            reason: String::new(),
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            state: SnapshotState::Failed,
            reason: reason.into(),
        }
    }
}

/// Snapshot backend. Every operation is idempotent: creates return the
/// existing object, deletes treat NotFound as success.
#[async_trait]
pub trait SnapshotDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create_snapshot(&self, req: &SnapshotRequest) -> Result<SnapshotRef, SnapshotError>;

    async fn snapshot_status(&self, snapshot: &SnapshotRef) -> Result<SnapshotInfo, SnapshotError>;

    async fn delete_snapshot(&self, snapshot: &SnapshotRef) -> Result<(), SnapshotError>;

    async fn restore_volume_claim(
        &self,
        req: &RestoreRequest,
    ) -> Result<PersistentVolumeClaim, SnapshotError>;

    /// Delete a PVC made by [`SnapshotDriver::restore_volume_claim`] and
    /// anything created to back it
    async fn delete_restored_claim(&self, namespace: &str, name: &str)
        -> Result<(), SnapshotError>;
}
