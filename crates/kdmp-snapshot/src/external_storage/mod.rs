//! External-storage snapshot backend
//!
//! Used when the snapshot storage class is `stork-snapshot`. Restores go
//! through Stork's snapshot provisioner: the restored PVC names the snapshot
//! in an annotation and uses the `stork-snapshot-sc` storage class.

pub mod types;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::ObjectMeta;
use tracing::{debug, info};

use kdmp_common::kube_utils::HasApiResource;

use crate::kube_client::{decode, encode, SnapshotKubeClient};
use crate::{
    RestoreRequest, SnapshotDriver, SnapshotError, SnapshotInfo, SnapshotRef, SnapshotRequest,
    SnapshotState,
};
use types::ExternalVolumeSnapshot;

/// Annotation naming the snapshot a PVC is provisioned from
pub const SNAPSHOT_ANNOTATION: &str = "snapshot.alpha.kubernetes.io/snapshot";
/// Annotation naming the namespace of that snapshot
pub const SOURCE_NAMESPACE_ANNOTATION: &str =
    "stork.libopenstorage.org/snapshot-source-namespace";
/// Storage class served by Stork's snapshot provisioner
pub const RESTORE_STORAGE_CLASS: &str = "stork-snapshot-sc";

pub struct ExternalStorageSnapshotDriver {
    kube: Arc<dyn SnapshotKubeClient>,
}

impl ExternalStorageSnapshotDriver {
    pub fn new(kube: Arc<dyn SnapshotKubeClient>) -> Self {
        Self { kube }
    }

    async fn get_snapshot(
        &self,
        snapshot: &SnapshotRef,
    ) -> Result<Option<ExternalVolumeSnapshot>, SnapshotError> {
        match self
            .kube
            .get_object(
                &ExternalVolumeSnapshot::api_resource(),
                &snapshot.namespace,
                &snapshot.name,
            )
            .await?
        {
            Some(value) => Ok(Some(decode(
                ExternalVolumeSnapshot::KIND,
                &snapshot.name,
                value,
            )?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SnapshotDriver for ExternalStorageSnapshotDriver {
    fn name(&self) -> &'static str {
        "external-storage"
    }

    async fn create_snapshot(&self, req: &SnapshotRequest) -> Result<SnapshotRef, SnapshotError> {
        let snapshot = SnapshotRef::new(&req.name, &req.pvc_namespace);
        if self.get_snapshot(&snapshot).await?.is_some() {
            debug!(snapshot = %snapshot, "snapshot already exists");
            return Ok(snapshot);
        }
        let object = ExternalVolumeSnapshot::new(
            ObjectMeta {
                name: Some(req.name.clone()),
                namespace: Some(req.pvc_namespace.clone()),
                labels: Some(req.labels.clone()),
                ..Default::default()
            },
            &req.pvc_name,
        );
        self.kube
            .create_object(
                &ExternalVolumeSnapshot::api_resource(),
                &req.pvc_namespace,
                encode(ExternalVolumeSnapshot::KIND, &req.name, &object)?,
            )
            .await?;
        info!(snapshot = %snapshot, "created external-storage snapshot");
        Ok(snapshot)
    }

    async fn snapshot_status(&self, snapshot: &SnapshotRef) -> Result<SnapshotInfo, SnapshotError> {
        let Some(snap) = self.get_snapshot(snapshot).await? else {
            return Ok(SnapshotInfo::failed(format!(
                "volume snapshot {} not found",
                snapshot
            )));
        };
        if snap.condition("Ready").is_some() {
            return Ok(SnapshotInfo::new(SnapshotState::Ready));
        }
        if let Some(error) = snap.condition("Error") {
            return Ok(SnapshotInfo::failed(format!(
                "volume snapshot {} failed: {}",
                snapshot, error.message
            )));
        }
        Ok(match snap.status {
            Some(_) => SnapshotInfo::new(SnapshotState::InProgress),
            None => SnapshotInfo::new(SnapshotState::Unknown),
        })
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotRef) -> Result<(), SnapshotError> {
        self.kube
            .delete_object(
                &ExternalVolumeSnapshot::api_resource(),
                &snapshot.namespace,
                &snapshot.name,
            )
            .await
    }

    async fn restore_volume_claim(
        &self,
        req: &RestoreRequest,
    ) -> Result<PersistentVolumeClaim, SnapshotError> {
        if let Some(existing) = self.kube.get_pvc(&req.namespace, &req.name).await? {
            return Ok(existing);
        }
        let mut spec = req.base_spec();
        spec.storage_class_name = Some(RESTORE_STORAGE_CLASS.to_string());
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(req.name.clone()),
                namespace: Some(req.namespace.clone()),
                labels: Some(req.labels.clone()),
                annotations: Some(BTreeMap::from([
                    (SNAPSHOT_ANNOTATION.to_string(), req.snapshot.name.clone()),
                    (
                        SOURCE_NAMESPACE_ANNOTATION.to_string(),
                        req.snapshot.namespace.clone(),
                    ),
                ])),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        };
        let created = self.kube.create_pvc(&pvc).await?;
        info!(pvc = %req.name, namespace = %req.namespace, "restored claim from snapshot");
        Ok(created)
    }

    async fn delete_restored_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), SnapshotError> {
        self.kube.delete_pvc(namespace, name).await
    }
}
