//! CSI snapshot backend
//!
//! Snapshots are namespaced, so restoring into another namespace needs a
//! copy: a pre-provisioned VolumeSnapshotContent pointing at the same
//! storage handle, bound to a new VolumeSnapshot in the destination
//! namespace. The copy is retained on delete so removing it never destroys
//! the original snapshot's data.

pub mod types;

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ObjectReference, PersistentVolumeClaim, TypedLocalObjectReference,
};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use kdmp_common::kube_utils::HasApiResource;
use kdmp_common::naming::truncate_name;

use crate::kube_client::{decode, encode, SnapshotKubeClient};
use crate::{
    RestoreRequest, SnapshotDriver, SnapshotError, SnapshotInfo, SnapshotRef, SnapshotRequest,
    SnapshotState,
};
use types::{
    VolumeSnapshot, VolumeSnapshotClass, VolumeSnapshotContent, VolumeSnapshotContentSource,
    VolumeSnapshotContentSpec, VolumeSnapshotSource, VolumeSnapshotSpec, SNAPSHOT_API_GROUP,
};

/// Marks a VolumeSnapshot created to restore across namespaces
pub const SNAPSHOT_COPY_LABEL: &str = "kdmp.portworx.com/snapshot-copy";

pub struct CsiSnapshotDriver {
    kube: Arc<dyn SnapshotKubeClient>,
}

/// Cluster-scoped name of the content backing a cross-namespace copy
fn copy_content_name(name: &str, namespace: &str) -> String {
    truncate_name(&format!("{}-{}", name, namespace))
}

impl CsiSnapshotDriver {
    pub fn new(kube: Arc<dyn SnapshotKubeClient>) -> Self {
        Self { kube }
    }

    async fn get_snapshot(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeSnapshot>, SnapshotError> {
        match self
            .kube
            .get_object(&VolumeSnapshot::api_resource(), namespace, name)
            .await?
        {
            Some(value) => Ok(Some(decode(VolumeSnapshot::KIND, name, value)?)),
            None => Ok(None),
        }
    }

    /// Make `snapshot` usable from `namespace` under the same name
    async fn copy_to_namespace(
        &self,
        snapshot: &SnapshotRef,
        namespace: &str,
        req: &RestoreRequest,
    ) -> Result<(), SnapshotError> {
        if self.get_snapshot(namespace, &snapshot.name).await?.is_some() {
            return Ok(());
        }

        let original = self
            .get_snapshot(&snapshot.namespace, &snapshot.name)
            .await?
            .ok_or_else(|| SnapshotError::not_ready(snapshot.to_string(), "snapshot not found"))?;
        let content_name = original
            .bound_content()
            .ok_or_else(|| SnapshotError::not_ready(snapshot.to_string(), "no content bound"))?;
        let content: VolumeSnapshotContent = match self
            .kube
            .get_object(&VolumeSnapshotContent::api_resource(), "", content_name)
            .await?
        {
            Some(value) => decode(VolumeSnapshotContent::KIND, content_name, value)?,
            None => {
                return Err(SnapshotError::not_ready(
                    snapshot.to_string(),
                    format!("content {} not found", content_name),
                ))
            }
        };
        let handle = content.snapshot_handle().ok_or_else(|| {
            SnapshotError::not_ready(snapshot.to_string(), "content has no snapshot handle")
        })?;

        let copy_content = copy_content_name(&snapshot.name, namespace);
        let mut labels = req.labels.clone();
        labels.insert(SNAPSHOT_COPY_LABEL.to_string(), "true".to_string());

        let content_copy = VolumeSnapshotContent::new(
            ObjectMeta {
                name: Some(copy_content.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            VolumeSnapshotContentSpec {
                deletion_policy: "Retain".to_string(),
                driver: content.spec.driver.clone(),
                source: VolumeSnapshotContentSource {
                    snapshot_handle: Some(handle.to_string()),
                    volume_handle: None,
                },
                volume_snapshot_class_name: content.spec.volume_snapshot_class_name.clone(),
                volume_snapshot_ref: ObjectReference {
                    api_version: Some(VolumeSnapshot::API_VERSION.to_string()),
                    kind: Some(VolumeSnapshot::KIND.to_string()),
                    name: Some(snapshot.name.clone()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
            },
        );
        self.kube
            .create_object(
                &VolumeSnapshotContent::api_resource(),
                "",
                encode(VolumeSnapshotContent::KIND, &copy_content, &content_copy)?,
            )
            .await?;

        let snapshot_copy = VolumeSnapshot::new(
            ObjectMeta {
                name: Some(snapshot.name.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            VolumeSnapshotSpec {
                volume_snapshot_class_name: original.spec.volume_snapshot_class_name.clone(),
                source: VolumeSnapshotSource {
                    volume_snapshot_content_name: Some(copy_content),
                    persistent_volume_claim_name: None,
                },
            },
        );
        self.kube
            .create_object(
                &VolumeSnapshot::api_resource(),
                namespace,
                encode(VolumeSnapshot::KIND, &snapshot.name, &snapshot_copy)?,
            )
            .await?;
        info!(snapshot = %snapshot, namespace, "copied snapshot across namespaces");
        Ok(())
    }
}

#[async_trait]
impl SnapshotDriver for CsiSnapshotDriver {
    fn name(&self) -> &'static str {
        "csi"
    }

    async fn create_snapshot(&self, req: &SnapshotRequest) -> Result<SnapshotRef, SnapshotError> {
        let snapshot = SnapshotRef::new(&req.name, &req.pvc_namespace);
        if self
            .get_snapshot(&req.pvc_namespace, &req.name)
            .await?
            .is_some()
        {
            debug!(snapshot = %snapshot, "snapshot already exists");
            return Ok(snapshot);
        }

        let class = self
            .kube
            .get_object(&VolumeSnapshotClass::api_resource(), "", &req.class)
            .await?;
        if class.is_none() {
            return Err(SnapshotError::ClassNotFound(req.class.clone()));
        }

        let object = VolumeSnapshot::new(
            ObjectMeta {
                name: Some(req.name.clone()),
                namespace: Some(req.pvc_namespace.clone()),
                labels: Some(req.labels.clone()),
                ..Default::default()
            },
            VolumeSnapshotSpec {
                volume_snapshot_class_name: Some(req.class.clone()),
                source: VolumeSnapshotSource {
                    persistent_volume_claim_name: Some(req.pvc_name.clone()),
                    volume_snapshot_content_name: None,
                },
            },
        );
        self.kube
            .create_object(
                &VolumeSnapshot::api_resource(),
                &req.pvc_namespace,
                encode(VolumeSnapshot::KIND, &req.name, &object)?,
            )
            .await?;
        info!(snapshot = %snapshot, class = %req.class, "created volume snapshot");
        Ok(snapshot)
    }

    async fn snapshot_status(&self, snapshot: &SnapshotRef) -> Result<SnapshotInfo, SnapshotError> {
        let Some(snap) = self.get_snapshot(&snapshot.namespace, &snapshot.name).await? else {
            return Ok(SnapshotInfo::failed(format!(
                "volume snapshot {} not found",
                snapshot
            )));
        };
        if snap.ready() {
            return Ok(SnapshotInfo::new(SnapshotState::Ready));
        }
        if let Some(message) = snap.error_message() {
            return Ok(SnapshotInfo::failed(format!(
                "volume snapshot {} failed: {}",
                snapshot, message
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
                &VolumeSnapshot::api_resource(),
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
        if req.namespace != req.snapshot.namespace {
            self.copy_to_namespace(&req.snapshot, &req.namespace, req)
                .await?;
        }

        let mut spec = req.base_spec();
        spec.data_source = Some(TypedLocalObjectReference {
            api_group: Some(SNAPSHOT_API_GROUP.to_string()),
            kind: VolumeSnapshot::KIND.to_string(),
            name: req.snapshot.name.clone(),
        });
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(req.name.clone()),
                namespace: Some(req.namespace.clone()),
                labels: Some(req.labels.clone()),
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
        self.kube.delete_pvc(namespace, name).await?;

        let Some(snap) = self.get_snapshot(namespace, name).await? else {
            return Ok(());
        };
        let is_copy = snap
            .metadata
            .labels
            .as_ref()
            .is_some_and(|l| l.contains_key(SNAPSHOT_COPY_LABEL));
        if is_copy {
            self.kube
                .delete_object(&VolumeSnapshot::api_resource(), namespace, name)
                .await?;
            self.kube
                .delete_object(
                    &VolumeSnapshotContent::api_resource(),
                    "",
                    &copy_content_name(name, namespace),
                )
                .await?;
        }
        Ok(())
    }
}
