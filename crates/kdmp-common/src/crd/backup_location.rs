//! Read-only view of the Stork BackupLocation resource
//!
//! BackupLocation is owned by Stork. KDMP never writes it, so it is a plain
//! serde type fetched through `DynamicObject` rather than a derived CRD.
//! Its payload lives in a top-level `location` field, not `spec`.

use kube::api::{DynamicObject, ObjectMeta};
use serde::{Deserialize, Serialize};

use crate::kube_utils::HasApiResource;
use crate::Error;

/// Object store flavour behind a BackupLocation
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackupLocationType {
    #[default]
    S3,
    Azure,
    Google,
}

impl BackupLocationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::Azure => "azure",
            Self::Google => "google",
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3Config {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default, rename = "accessKeyID")]
    pub access_key_id: String,
    #[serde(default)]
    pub secret_access_key: String,
    #[serde(default)]
    pub region: String,
    #[serde(default, rename = "disableSSL")]
    pub disable_ssl: bool,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AzureConfig {
    #[serde(default)]
    pub storage_account_name: String,
    #[serde(default)]
    pub storage_account_key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GoogleConfig {
    #[serde(default, rename = "projectID")]
    pub project_id: String,
    #[serde(default)]
    pub account_key: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupLocationItem {
    #[serde(rename = "type")]
    pub type_: BackupLocationType,
    /// Bucket (or container) name
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub repository_password: String,
    #[serde(default, rename = "encryptionV2Key")]
    pub encryption_v2_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3_config: Option<S3Config>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub azure_config: Option<AzureConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub google_config: Option<GoogleConfig>,
}

/// Stork BackupLocation
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupLocation {
    #[serde(default = "BackupLocation::default_api_version")]
    pub api_version: String,
    #[serde(default = "BackupLocation::default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub location: BackupLocationItem,
}

impl HasApiResource for BackupLocation {
    const API_VERSION: &'static str = "stork.libopenstorage.org/v1alpha1";
    const KIND: &'static str = "BackupLocation";
}

impl BackupLocation {
    fn default_api_version() -> String {
        <Self as HasApiResource>::API_VERSION.to_string()
    }

    fn default_kind() -> String {
        <Self as HasApiResource>::KIND.to_string()
    }

    /// Decode a BackupLocation fetched as a `DynamicObject`
    pub fn from_dynamic(obj: DynamicObject) -> Result<Self, Error> {
        let mut value = obj.data;
        if let Some(map) = value.as_object_mut() {
            map.insert(
                "metadata".to_string(),
                serde_json::to_value(&obj.metadata)
                    .map_err(|e| Error::serialization("BackupLocation", e.to_string()))?,
            );
        }
        serde_json::from_value(value)
            .map_err(|e| Error::serialization("BackupLocation", e.to_string()))
    }

    /// Password protecting the engine repository
    pub fn repository_password(&self) -> Option<&str> {
        [
            self.location.repository_password.as_str(),
            self.location.encryption_v2_key.as_str(),
        ]
        .into_iter()
        .find(|p| !p.is_empty())
    }
}
