//! Kubernetes access for the snapshot backends
//!
//! Snapshot CRDs are not compiled in, so they travel as JSON values through
//! `DynamicObject` and are decoded into typed structs by each backend.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::api::{Api, DeleteParams, DynamicObject, PostParams};
use kube::discovery::ApiResource;
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;

#[cfg(test)]
use mockall::automock;

use kdmp_common::kube_utils::{is_already_exists, is_not_found};

use crate::SnapshotError;

/// An empty `namespace` addresses a cluster-scoped resource.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SnapshotKubeClient: Send + Sync {
    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, SnapshotError>;

    /// Create an object; one that already exists is success
    async fn create_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: serde_json::Value,
    ) -> Result<(), SnapshotError>;

    /// Delete an object; NotFound is success
    async fn delete_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), SnapshotError>;

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, SnapshotError>;

    /// Create a PVC, or return the one already there
    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, SnapshotError>;

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), SnapshotError>;
}

pub struct SnapshotKubeClientImpl {
    client: Client,
}

impl SnapshotKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, resource: &ApiResource, namespace: &str) -> Api<DynamicObject> {
        if namespace.is_empty() {
            Api::all_with(self.client.clone(), resource)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, resource)
        }
    }
}

#[async_trait]
impl SnapshotKubeClient for SnapshotKubeClientImpl {
    async fn get_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<Option<serde_json::Value>, SnapshotError> {
        match self.api(resource, namespace).get_opt(name).await? {
            Some(obj) => Ok(Some(encode(&resource.kind, name, &obj)?)),
            None => Ok(None),
        }
    }

    async fn create_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        object: serde_json::Value,
    ) -> Result<(), SnapshotError> {
        let obj: DynamicObject = decode(&resource.kind, "", object)?;
        match self
            .api(resource, namespace)
            .create(&PostParams::default(), &obj)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_object(
        &self,
        resource: &ApiResource,
        namespace: &str,
        name: &str,
    ) -> Result<(), SnapshotError> {
        match self
            .api(resource, namespace)
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, SnapshotError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn create_pvc(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<PersistentVolumeClaim, SnapshotError> {
        let namespace = pvc.namespace().unwrap_or_default();
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), pvc).await {
            Ok(created) => Ok(created),
            Err(e) if is_already_exists(&e) => Ok(api.get(&pvc.name_any()).await?),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), SnapshotError> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Decode a JSON object into `T`
pub fn decode<T: DeserializeOwned>(
    kind: &str,
    name: &str,
    value: serde_json::Value,
) -> Result<T, SnapshotError> {
    serde_json::from_value(value).map_err(|e| SnapshotError::malformed(kind, name, e.to_string()))
}

/// Encode `T` as a JSON object
pub fn encode<T: Serialize>(
    kind: &str,
    name: &str,
    object: &T,
) -> Result<serde_json::Value, SnapshotError> {
    serde_json::to_value(object).map_err(|e| SnapshotError::malformed(kind, name, e.to_string()))
}
