//! Legacy external-storage snapshot types
//! (`volumesnapshot.external-storage.k8s.io/v1`)

use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

use kdmp_common::kube_utils::HasApiResource;

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalVolumeSnapshot {
    #[serde(default = "ExternalVolumeSnapshot::default_api_version")]
    pub api_version: String,
    #[serde(default = "ExternalVolumeSnapshot::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: ExternalVolumeSnapshotSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ExternalVolumeSnapshotStatus>,
}

impl HasApiResource for ExternalVolumeSnapshot {
    const API_VERSION: &'static str = "volumesnapshot.external-storage.k8s.io/v1";
    const KIND: &'static str = "VolumeSnapshot";
}

impl ExternalVolumeSnapshot {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }

    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    pub fn new(metadata: ObjectMeta, pvc_name: impl Into<String>) -> Self {
        Self {
            api_version: Self::default_api_version(),
            kind: Self::default_kind(),
            metadata,
            spec: ExternalVolumeSnapshotSpec {
                persistent_volume_claim_name: pvc_name.into(),
                snapshot_data_name: None,
            },
            status: None,
        }
    }

    /// A condition of `type_` with status "True"
    pub fn condition(&self, type_: &str) -> Option<&SnapshotCondition> {
        self.status
            .as_ref()?
            .conditions
            .iter()
            .find(|c| c.type_ == type_ && c.status == "True")
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExternalVolumeSnapshotSpec {
    pub persistent_volume_claim_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_data_name: Option<String>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExternalVolumeSnapshotStatus {
    #[serde(default)]
    pub conditions: Vec<SnapshotCondition>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct SnapshotCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default)]
    pub message: String,
}
