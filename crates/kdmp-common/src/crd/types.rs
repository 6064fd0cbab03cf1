//! Shared CRD building blocks

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backup_location::BackupLocation;
use crate::kube_utils::HasApiResource;

/// Reference to another Kubernetes object by apiVersion, kind, namespace and name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Reference {
    #[serde(default)]
    pub api_version: String,
    #[serde(default)]
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub name: String,
}

/// What a [`Reference`] points at
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReferenceKind {
    PersistentVolumeClaim,
    BackupLocation,
    VolumeBackup,
    Unsupported(String),
}

impl Reference {
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: impl Into<String>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn pvc(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new("v1", "PersistentVolumeClaim", namespace, name)
    }

    pub fn backup_location(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(
            BackupLocation::API_VERSION,
            BackupLocation::KIND,
            namespace,
            name,
        )
    }

    pub fn volume_backup(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(crate::KDMP_API_VERSION, "VolumeBackup", namespace, name)
    }

    /// Classify the reference. An empty apiVersion and kind is a PVC.
    pub fn kind(&self) -> ReferenceKind {
        match (self.api_version.as_str(), self.kind.as_str()) {
            ("", "") => ReferenceKind::PersistentVolumeClaim,
            ("v1" | "", "PersistentVolumeClaim") => ReferenceKind::PersistentVolumeClaim,
            (av, "BackupLocation") if av == BackupLocation::API_VERSION => {
                ReferenceKind::BackupLocation
            }
            (crate::KDMP_API_VERSION, "VolumeBackup") => ReferenceKind::VolumeBackup,
            (av, kind) => ReferenceKind::Unsupported(format!("{av}/{kind}")),
        }
    }

    pub fn is_pvc(&self) -> bool {
        self.kind() == ReferenceKind::PersistentVolumeClaim
    }

    /// `namespace/name`, the form used in reasons and log fields
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Both name and namespace are set
    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.namespace.is_empty()
    }
}
