//! Kubernetes access used by the drivers
//!
//! Every API call a driver makes goes through [`JobKubeClient`] so the
//! launch path can be tested against a mock.

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use kdmp_common::crd::{BackupLocation, VolumeBackup};
use kdmp_common::kube_utils::{is_already_exists, is_not_found, HasApiResource};
use kdmp_common::DRIVER_NAME_LABEL;

use crate::DriverError;

const FIELD_MANAGER: &str = "kdmp-driver";

#[cfg_attr(test, automock)]
#[async_trait]
pub trait JobKubeClient: Send + Sync {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, DriverError>;

    /// Create a job; an existing job with the same name is success
    async fn create_job(&self, job: &Job) -> Result<(), DriverError>;

    /// Delete a job and its pods; NotFound is success
    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), DriverError>;

    /// Jobs of `driver`, in any namespace, that have not finished
    async fn count_active_jobs(&self, driver: &str) -> Result<usize, DriverError>;

    async fn apply_secret(&self, secret: &Secret) -> Result<(), DriverError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), DriverError>;

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<(), DriverError>;

    async fn apply_role(&self, role: &Role) -> Result<(), DriverError>;

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), DriverError>;

    /// Delete the service account, role and role binding named `name`
    async fn delete_rbac(&self, namespace: &str, name: &str) -> Result<(), DriverError>;

    async fn get_backup_location(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupLocation>, DriverError>;

    async fn get_volume_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeBackup>, DriverError>;

    /// Create a VolumeBackup; an existing one with the same name is success
    async fn create_volume_backup(&self, vb: &VolumeBackup) -> Result<(), DriverError>;
}

pub struct JobKubeClientImpl {
    client: Client,
}

impl JobKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn params() -> PatchParams {
        PatchParams::apply(FIELD_MANAGER).force()
    }
}

/// Swallow NotFound on deletes
fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), DriverError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| {
            conds
                .iter()
                .any(|c| (c.type_ == "Complete" || c.type_ == "Failed") && c.status == "True")
        })
}

#[async_trait]
impl JobKubeClient for JobKubeClientImpl {
    async fn get_job(&self, namespace: &str, name: &str) -> Result<Option<Job>, DriverError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_job(&self, job: &Job) -> Result<(), DriverError> {
        let namespace = job.namespace().unwrap_or_default();
        let api: Api<Job> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), job).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                debug!(job = %job.name_any(), "job already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), DriverError> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::background()).await)
    }

    async fn count_active_jobs(&self, driver: &str) -> Result<usize, DriverError> {
        let api: Api<Job> = Api::all(self.client.clone());
        let params = ListParams::default().labels(&format!("{}={}", DRIVER_NAME_LABEL, driver));
        let jobs = api.list(&params).await?;
        Ok(jobs.items.iter().filter(|job| !finished(job)).count())
    }

    async fn apply_secret(&self, secret: &Secret) -> Result<(), DriverError> {
        let api: Api<Secret> =
            Api::namespaced(self.client.clone(), &secret.namespace().unwrap_or_default());
        api.patch(&secret.name_any(), &Self::params(), &Patch::Apply(secret))
            .await?;
        Ok(())
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), DriverError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    async fn apply_service_account(&self, sa: &ServiceAccount) -> Result<(), DriverError> {
        let api: Api<ServiceAccount> =
            Api::namespaced(self.client.clone(), &sa.namespace().unwrap_or_default());
        api.patch(&sa.name_any(), &Self::params(), &Patch::Apply(sa))
            .await?;
        Ok(())
    }

    async fn apply_role(&self, role: &Role) -> Result<(), DriverError> {
        let api: Api<Role> =
            Api::namespaced(self.client.clone(), &role.namespace().unwrap_or_default());
        api.patch(&role.name_any(), &Self::params(), &Patch::Apply(role))
            .await?;
        Ok(())
    }

    async fn apply_role_binding(&self, binding: &RoleBinding) -> Result<(), DriverError> {
        let api: Api<RoleBinding> =
            Api::namespaced(self.client.clone(), &binding.namespace().unwrap_or_default());
        api.patch(&binding.name_any(), &Self::params(), &Patch::Apply(binding))
            .await?;
        Ok(())
    }

    async fn delete_rbac(&self, namespace: &str, name: &str) -> Result<(), DriverError> {
        let dp = DeleteParams::default();
        let bindings: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(bindings.delete(name, &dp).await)?;
        let roles: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(roles.delete(name, &dp).await)?;
        let accounts: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(accounts.delete(name, &dp).await)
    }

    async fn get_backup_location(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BackupLocation>, DriverError> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &BackupLocation::api_resource());
        match api.get_opt(name).await? {
            Some(obj) => Ok(Some(BackupLocation::from_dynamic(obj)?)),
            None => Ok(None),
        }
    }

    async fn get_volume_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeBackup>, DriverError> {
        let api: Api<VolumeBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_volume_backup(&self, vb: &VolumeBackup) -> Result<(), DriverError> {
        let api: Api<VolumeBackup> =
            Api::namespaced(self.client.clone(), &vb.namespace().unwrap_or_default());
        match api.create(&PostParams::default(), vb).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
