//! VolumeBackup status writes
//!
//! The executor is the only writer of a VolumeBackup's status.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kdmp_common::crd::{VolumeBackup, VolumeBackupStatus};
use kdmp_common::retry::{retry_with_backoff_if, RetryConfig};

use crate::ExecutorError;

/// Field manager for status patches
const FIELD_MANAGER: &str = "kdmp-executor";

/// Attempts per status write before the error is returned
const STATUS_WRITE_ATTEMPTS: u32 = 5;

/// Destination of progress updates
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn update(&self, status: &VolumeBackupStatus) -> Result<(), ExecutorError>;
}

/// Writes the status subresource of one VolumeBackup
pub struct KubeStatusSink {
    api: Api<VolumeBackup>,
    name: String,
}

impl KubeStatusSink {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl StatusSink for KubeStatusSink {
    async fn update(&self, status: &VolumeBackupStatus) -> Result<(), ExecutorError> {
        let patch = json!({ "status": status });
        let params = PatchParams::apply(FIELD_MANAGER);
        retry_with_backoff_if(
            &RetryConfig::with_max_attempts(STATUS_WRITE_ATTEMPTS),
            "update VolumeBackup status",
            || async {
                self.api
                    .patch_status(&self.name, &params, &Patch::Merge(&patch))
                    .await
                    .map(|_| ())
                    .map_err(ExecutorError::from)
            },
            ExecutorError::is_retryable,
        )
        .await?;
        debug!(
            volume_backup = %self.name,
            progress = status.progress_percentage,
            "status updated"
        );
        Ok(())
    }
}
