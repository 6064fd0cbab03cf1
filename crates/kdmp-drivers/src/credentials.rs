//! Job-scoped credentials secret built from a BackupLocation

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::ObjectMeta;

use kdmp_common::credentials::*;
use kdmp_common::crd::{BackupLocation, BackupLocationType};

use crate::DriverError;

/// Flatten `location` into the key layout the executor reads.
///
/// The secret lives in the job namespace and shares the job name, so it is
/// deleted together with the job.
pub fn build_secret(
    location: &BackupLocation,
    name: &str,
    namespace: &str,
    labels: BTreeMap<String, String>,
) -> Result<Secret, DriverError> {
    let item = &location.location;
    let location_key = format!(
        "{}/{}",
        location.metadata.namespace.as_deref().unwrap_or_default(),
        location.metadata.name.as_deref().unwrap_or_default()
    );
    if item.path.is_empty() {
        return Err(DriverError::backup_location(location_key, "bucket path is empty"));
    }

    let mut data = BTreeMap::new();
    data.insert(KEY_TYPE.to_string(), item.type_.as_str().to_string());
    data.insert(KEY_PATH.to_string(), item.path.clone());
    data.insert(
        KEY_PASSWORD.to_string(),
        location
            .repository_password()
            .unwrap_or(DEFAULT_REPOSITORY_PASSWORD)
            .to_string(),
    );

    match item.type_ {
        BackupLocationType::S3 => {
            let s3 = item.s3_config.as_ref().ok_or_else(|| {
                DriverError::backup_location(location_key.clone(), "s3Config is missing")
            })?;
            data.insert(KEY_ENDPOINT.to_string(), s3.endpoint.clone());
            data.insert(KEY_ACCESS_KEY.to_string(), s3.access_key_id.clone());
            data.insert(KEY_SECRET_KEY.to_string(), s3.secret_access_key.clone());
            data.insert(KEY_REGION.to_string(), s3.region.clone());
            data.insert(KEY_DISABLE_SSL.to_string(), s3.disable_ssl.to_string());
        }
        BackupLocationType::Azure => {
            let azure = item.azure_config.as_ref().ok_or_else(|| {
                DriverError::backup_location(location_key.clone(), "azureConfig is missing")
            })?;
            data.insert(
                KEY_STORAGE_ACCOUNT_NAME.to_string(),
                azure.storage_account_name.clone(),
            );
            data.insert(
                KEY_STORAGE_ACCOUNT_KEY.to_string(),
                azure.storage_account_key.clone(),
            );
        }
        BackupLocationType::Google => {
            let google = item.google_config.as_ref().ok_or_else(|| {
                DriverError::backup_location(location_key.clone(), "googleConfig is missing")
            })?;
            data.insert(KEY_PROJECT_ID.to_string(), google.project_id.clone());
            data.insert(KEY_ACCOUNT_KEY.to_string(), google.account_key.clone());
        }
    }

    Ok(Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        string_data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    })
}
