//! DataExport controller implementation
//!
//! This module implements the reconciliation loop for DataExport resources.
//! Each reconcile advances an export by at most one stage: a Successful
//! stage is moved to the next one, anything else runs the current stage's
//! handler from [`crate::stages`] and persists the outcome.
//!
//! Deletion is guarded by the [`CLEANUP_FINALIZER`]; the worker job, the
//! VolumeBackup record and any snapshot objects are removed before the
//! finalizer is cleared.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use k8s_openapi::api::storage::v1::StorageClass;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::events::EventType;
use kube::{Client, Resource, ResourceExt};
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use kdmp_common::config::{ConfigSource, KubeConfigSource};
use kdmp_common::crd::{DataExport, DataExportStage, DataExportStatus, StageStatus, VolumeBackup};
use kdmp_common::events::{actions, reasons, EventPublisher, KubeEventPublisher};
use kdmp_common::kube_utils::{is_not_found, patch_resource_status};
use kdmp_common::metrics::{record_stage_transition, ReconcileTimer};
use kdmp_drivers::kube_client::JobKubeClientImpl;
use kdmp_drivers::{DriverContext, DriverRegistry};
use kdmp_snapshot::kube_client::SnapshotKubeClientImpl;
use kdmp_snapshot::SnapshotRegistry;

#[cfg(test)]
use kdmp_common::config::{KdmpConfig, StaticConfigSource};
#[cfg(test)]
use kdmp_common::events::NoopEventPublisher;

use crate::stages::{self, StageOutcome, TRANSITION_REQUEUE};
use crate::Error;

/// Finalizer guarding the cleanup of everything a DataExport created
pub const CLEANUP_FINALIZER: &str = "kdmp.portworx.com/cleanup";

/// Field manager and event reporter for the controller
pub const CONTROLLER_NAME: &str = "kdmp-dataexport-controller";

// =============================================================================
// Traits for dependency injection and testability
// =============================================================================

/// Kubernetes operations the reconciler performs directly
///
/// Worker jobs and snapshots go through their drivers; this covers the
/// DataExport itself and the objects validation reads.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ExportKubeClient: Send + Sync {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error>;

    /// All pods in a namespace
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error>;

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error>;

    async fn get_volume_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeBackup>, Error>;

    /// Delete a VolumeBackup; NotFound is success
    async fn delete_volume_backup(&self, namespace: &str, name: &str) -> Result<(), Error>;

    /// Write the status of `export`, guarded by its resourceVersion
    async fn patch_status(&self, export: &DataExport, status: &DataExportStatus)
        -> Result<(), Error>;

    async fn add_finalizer(&self, export: &DataExport, finalizer: &str) -> Result<(), Error>;

    /// Remove a finalizer; a DataExport that is already gone is success
    async fn remove_finalizer(&self, export: &DataExport, finalizer: &str) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
pub struct ExportKubeClientImpl {
    client: Client,
}

impl ExportKubeClientImpl {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn exports(&self, export: &DataExport) -> Api<DataExport> {
        Api::namespaced(
            self.client.clone(),
            &export.namespace().unwrap_or_default(),
        )
    }

    async fn patch_finalizers(
        &self,
        export: &DataExport,
        finalizers: Vec<String>,
    ) -> Result<(), Error> {
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers
            }
        });
        self.exports(export)
            .patch(
                &export.name_any(),
                &PatchParams::apply(CONTROLLER_NAME),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ExportKubeClient for ExportKubeClientImpl {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        let api: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        let api: Api<StorageClass> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }

    async fn get_volume_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeBackup>, Error> {
        let api: Api<VolumeBackup> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?)
    }

    async fn delete_volume_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let api: Api<VolumeBackup> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn patch_status(
        &self,
        export: &DataExport,
        status: &DataExportStatus,
    ) -> Result<(), Error> {
        patch_resource_status::<DataExport>(
            &self.client,
            &export.name_any(),
            &export.namespace().unwrap_or_default(),
            export.resource_version().as_deref(),
            status,
            CONTROLLER_NAME,
        )
        .await?;
        Ok(())
    }

    async fn add_finalizer(&self, export: &DataExport, finalizer: &str) -> Result<(), Error> {
        let current = self.exports(export).get(&export.name_any()).await?;
        let mut finalizers = current.metadata.finalizers.unwrap_or_default();
        if finalizers.iter().any(|f| f == finalizer) {
            return Ok(());
        }
        finalizers.push(finalizer.to_string());
        self.patch_finalizers(export, finalizers).await
    }

    async fn remove_finalizer(&self, export: &DataExport, finalizer: &str) -> Result<(), Error> {
        let Some(current) = self.exports(export).get_opt(&export.name_any()).await? else {
            return Ok(());
        };
        let finalizers: Vec<String> = current
            .metadata
            .finalizers
            .unwrap_or_default()
            .into_iter()
            .filter(|f| f != finalizer)
            .collect();
        self.patch_finalizers(export, finalizers).await
    }
}

// =============================================================================
// Controller context
// =============================================================================

/// Shared state for every DataExport reconcile
pub struct ExportContext {
    pub kube: Arc<dyn ExportKubeClient>,
    /// Transfer drivers by name
    pub drivers: DriverRegistry,
    /// Snapshot backends by snapshot storage class
    pub snapshots: SnapshotRegistry,
    pub config: Arc<dyn ConfigSource>,
    pub events: Arc<dyn EventPublisher>,
}

impl ExportContext {
    pub fn new(
        kube: Arc<dyn ExportKubeClient>,
        drivers: DriverRegistry,
        snapshots: SnapshotRegistry,
        config: Arc<dyn ConfigSource>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            kube,
            drivers,
            snapshots,
            config,
            events,
        }
    }

    /// Wire the real clients, every shipped driver and both snapshot
    /// backends. `config_namespace` holds the `kdmp-config` ConfigMap.
    pub fn from_client(client: Client, config_namespace: &str, config_name: &str) -> Self {
        let config: Arc<dyn ConfigSource> = Arc::new(
            KubeConfigSource::new(client.clone(), config_namespace).with_name(config_name),
        );
        let drivers = DriverRegistry::with_defaults(DriverContext::new(
            Arc::new(JobKubeClientImpl::new(client.clone())),
            config.clone(),
        ));
        let snapshots = SnapshotRegistry::new(Arc::new(SnapshotKubeClientImpl::new(client.clone())));
        let events = Arc::new(KubeEventPublisher::new(client.clone(), CONTROLLER_NAME));
        Self::new(
            Arc::new(ExportKubeClientImpl::new(client)),
            drivers,
            snapshots,
            config,
            events,
        )
    }

    /// Create a context for testing with default configuration and no events
    #[cfg(test)]
    pub fn for_testing(
        kube: Arc<dyn ExportKubeClient>,
        drivers: DriverRegistry,
        snapshots: SnapshotRegistry,
    ) -> Self {
        Self::new(
            kube,
            drivers,
            snapshots,
            Arc::new(StaticConfigSource::new(KdmpConfig::default())),
            Arc::new(NoopEventPublisher),
        )
    }
}

// =============================================================================
// DataExport reconciliation
// =============================================================================

/// Reconcile a DataExport resource
///
/// Called whenever a DataExport changes and on every requeue. Idempotent:
/// reconciling an unchanged world writes nothing.
#[instrument(skip(export, ctx), fields(export = %export.name_any(), namespace = %export.namespace().unwrap_or_default()))]
pub async fn reconcile(export: Arc<DataExport>, ctx: Arc<ExportContext>) -> Result<Action, Error> {
    let timer = ReconcileTimer::start();
    let result = reconcile_export(&export, &ctx).await;
    match &result {
        Ok(_) => timer.success(),
        Err(e) => timer.error(e.is_retryable()),
    }
    result
}

async fn reconcile_export(export: &DataExport, ctx: &ExportContext) -> Result<Action, Error> {
    if export.metadata.namespace.is_none() {
        return Err(Error::MissingNamespace);
    }

    if export.metadata.deletion_timestamp.is_some() {
        return handle_deletion(export, ctx).await;
    }

    if !has_finalizer(export) {
        debug!("adding cleanup finalizer");
        ctx.kube.add_finalizer(export, CLEANUP_FINALIZER).await?;
        return Ok(Action::requeue(Duration::from_secs(1)));
    }

    let current = export.current_status();
    if current.is_failed() || current.is_done() {
        return Ok(Action::await_change());
    }

    if current.status == StageStatus::Successful {
        return advance_stage(export, ctx, current).await;
    }

    debug!(stage = %current.stage, status = %current.status, "running stage");
    let outcome = stages::run(export, &current, ctx).await;
    persist_outcome(export, ctx, current, outcome).await
}

/// Move a Successful stage to the next one with a fresh Initial status
async fn advance_stage(
    export: &DataExport,
    ctx: &ExportContext,
    current: DataExportStatus,
) -> Result<Action, Error> {
    let with_snapshot = export.spec.snapshot_class().is_some();
    let Some(next) = current.stage.next(with_snapshot) else {
        return Ok(Action::await_change());
    };

    let progress_percentage = if next == DataExportStage::Final {
        current.progress_percentage
    } else {
        0
    };
    let status = DataExportStatus {
        stage: next,
        status: StageStatus::Initial,
        reason: String::new(),
        progress_percentage,
        ..current.clone()
    };
    ctx.kube.patch_status(export, &status).await?;

    info!(from = %current.stage, to = %next, "stage advanced");
    record_stage_transition(&next.to_string());
    publish(
        export,
        ctx,
        EventType::Normal,
        reasons::STAGE_ADVANCED,
        actions::RECONCILE,
        format!("entered stage {}", next),
    )
    .await;
    Ok(Action::requeue(TRANSITION_REQUEUE))
}

/// Write a stage outcome, when it changes anything, and pick the requeue
async fn persist_outcome(
    export: &DataExport,
    ctx: &ExportContext,
    current: DataExportStatus,
    outcome: StageOutcome,
) -> Result<Action, Error> {
    let mut status = current.clone();
    outcome.apply(&mut status);

    if status != current {
        ctx.kube.patch_status(export, &status).await?;
        announce(export, ctx, &status, &outcome).await;
    }

    Ok(match status.status {
        StageStatus::Failed => Action::await_change(),
        StageStatus::Successful if status.stage == DataExportStage::Final => {
            Action::await_change()
        }
        StageStatus::Successful => Action::requeue(TRANSITION_REQUEUE),
        StageStatus::InProgress | StageStatus::Initial => Action::requeue(outcome.requeue_after),
    })
}

/// Log and publish an event for a persisted outcome
async fn announce(
    export: &DataExport,
    ctx: &ExportContext,
    status: &DataExportStatus,
    outcome: &StageOutcome,
) {
    match (status.status, status.stage) {
        (StageStatus::Failed, stage) => {
            let kind = outcome.kind.map(|k| k.as_str()).unwrap_or_default();
            warn!(stage = %stage, kind, reason = %status.reason, "stage failed");
            let event_reason = match stage {
                DataExportStage::Initial => reasons::VALIDATION_FAILED,
                s if s.is_snapshot_stage() => reasons::SNAPSHOT_FAILED,
                _ => reasons::TRANSFER_FAILED,
            };
            let action = match stage {
                DataExportStage::Initial => actions::VALIDATE,
                s if s.is_snapshot_stage() => actions::SNAPSHOT,
                _ => actions::TRANSFER,
            };
            publish(
                export,
                ctx,
                EventType::Warning,
                event_reason,
                action,
                format!("{}: {}", kind, status.reason),
            )
            .await;
        }
        (StageStatus::Successful, DataExportStage::TransferScheduled) => {
            publish(
                export,
                ctx,
                EventType::Normal,
                reasons::TRANSFER_STARTED,
                actions::TRANSFER,
                format!("started worker job {}", status.transfer_id),
            )
            .await;
        }
        (StageStatus::Successful, DataExportStage::TransferInProgress) => {
            publish(
                export,
                ctx,
                EventType::Normal,
                reasons::TRANSFER_COMPLETED,
                actions::TRANSFER,
                format!("worker job {} completed", status.transfer_id),
            )
            .await;
        }
        (StageStatus::InProgress, stage) if !status.reason.is_empty() => {
            info!(stage = %stage, reason = %status.reason, "stage waiting");
        }
        _ => {}
    }
}

async fn publish(
    export: &DataExport,
    ctx: &ExportContext,
    type_: EventType,
    reason: &str,
    action: &str,
    note: String,
) {
    ctx.events
        .publish(&export.object_ref(&()), type_, reason, action, Some(note))
        .await;
}

// =============================================================================
// Deletion
// =============================================================================

fn has_finalizer(export: &DataExport) -> bool {
    export
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|f| f == CLEANUP_FINALIZER))
}

async fn handle_deletion(export: &DataExport, ctx: &ExportContext) -> Result<Action, Error> {
    if !has_finalizer(export) {
        return Ok(Action::await_change());
    }

    let status = export.current_status();
    if status.stage == DataExportStage::Initial {
        info!("deleted before any work started, skipping cleanup");
    } else if let Err(e) = cleanup(export, ctx).await {
        publish(
            export,
            ctx,
            EventType::Warning,
            reasons::CLEANUP_FAILED,
            actions::CLEANUP,
            e.to_string(),
        )
        .await;
        return Err(e);
    }

    ctx.kube.remove_finalizer(export, CLEANUP_FINALIZER).await?;
    info!("cleanup finalizer removed");
    Ok(Action::await_change())
}

/// Remove the worker job, the VolumeBackup record, the snapshot-restored
/// claim and the snapshot of a DataExport being deleted
pub async fn cleanup(export: &DataExport, ctx: &ExportContext) -> Result<(), Error> {
    let status = export.current_status();
    stages::release(export, &status, ctx, true).await?;
    info!(stage = %status.stage, "cleanup complete");
    Ok(())
}

/// Error policy for the DataExport controller
///
/// Retryable errors (conflicts, API hiccups) requeue after 30 seconds;
/// anything else waits for the object to change.
pub fn error_policy(export: Arc<DataExport>, error: &Error, _ctx: Arc<ExportContext>) -> Action {
    error!(
        ?error,
        export = %export.name_any(),
        retryable = error.is_retryable(),
        "reconciliation failed"
    );

    if error.is_retryable() {
        Action::requeue(Duration::from_secs(30))
    } else {
        Action::await_change()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kdmp_common::crd::{DataExportSpec, DataExportType, Reference};
    use kube::api::ObjectMeta;

    fn export(finalizers: Vec<&str>, status: Option<DataExportStatus>) -> DataExport {
        DataExport {
            metadata: ObjectMeta {
                name: Some("exp".to_string()),
                namespace: Some("apps".to_string()),
                resource_version: Some("1".to_string()),
                finalizers: Some(finalizers.into_iter().map(str::to_string).collect()),
                ..Default::default()
            },
            spec: DataExportSpec {
                type_: DataExportType::Rsync,
                snapshot_storage_class: None,
                source: Reference::pvc("apps", "src"),
                destination: Reference::pvc("apps", "dst"),
            },
            status,
        }
    }

    fn context(mock: MockExportKubeClient) -> Arc<ExportContext> {
        Arc::new(ExportContext::for_testing(
            Arc::new(mock),
            DriverRegistry::new(),
            crate::testing::empty_snapshots(),
        ))
    }

    // =========================================================================
    // Finalizer and terminal states
    // =========================================================================

    #[tokio::test]
    async fn finalizer_is_added_before_any_work() {
        let mut mock = MockExportKubeClient::new();
        mock.expect_add_finalizer()
            .withf(|_, f| f == CLEANUP_FINALIZER)
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(export(vec![], None)), context(mock))
            .await
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn failed_exports_are_left_alone() {
        let failed = DataExportStatus {
            status: StageStatus::Failed,
            reason: "boom".to_string(),
            ..Default::default()
        };
        // no expectations: any client call panics
        let action = reconcile(
            Arc::new(export(vec![CLEANUP_FINALIZER], Some(failed))),
            context(MockExportKubeClient::new()),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn successful_stage_advances_with_fresh_status() {
        let done = DataExportStatus {
            stage: DataExportStage::TransferScheduled,
            status: StageStatus::Successful,
            reason: "old".to_string(),
            transfer_id: "apps/exp-apps-src".to_string(),
            progress_percentage: 0,
            ..Default::default()
        };
        let mut mock = MockExportKubeClient::new();
        mock.expect_patch_status()
            .withf(|_, s| {
                s.stage == DataExportStage::TransferInProgress
                    && s.status == StageStatus::Initial
                    && s.reason.is_empty()
                    && s.transfer_id == "apps/exp-apps-src"
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(
            Arc::new(export(vec![CLEANUP_FINALIZER], Some(done))),
            context(mock),
        )
        .await
        .unwrap();
        assert_eq!(action, Action::requeue(TRANSITION_REQUEUE));
    }

    #[tokio::test]
    async fn deleting_in_initial_skips_cleanup() {
        let mut deleted = export(vec![CLEANUP_FINALIZER], None);
        deleted.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let mut mock = MockExportKubeClient::new();
        mock.expect_remove_finalizer()
            .times(1)
            .returning(|_, _| Ok(()));

        let action = reconcile(Arc::new(deleted), context(mock)).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn status_conflicts_surface_as_retryable_errors() {
        let mut mock = MockExportKubeClient::new();
        mock.expect_get_pvc().returning(|_, _| Ok(None));
        mock.expect_patch_status().returning(|_, _| {
            Err(Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "the object has been modified".to_string(),
                reason: "Conflict".to_string(),
                code: 409,
            })))
        });

        let err = reconcile(
            Arc::new(export(vec![CLEANUP_FINALIZER], None)),
            context(mock),
        )
        .await
        .unwrap_err();
        assert!(err.is_retryable());
    }

    // =========================================================================
    // Error policy
    // =========================================================================

    #[test]
    fn error_policy_retries_transient_errors() {
        let ctx = context(MockExportKubeClient::new());
        let action = error_policy(
            Arc::new(export(vec![], None)),
            &Error::waiting("pending"),
            ctx.clone(),
        );
        assert_eq!(action, Action::requeue(Duration::from_secs(30)));

        let action = error_policy(Arc::new(export(vec![], None)), &Error::MissingNamespace, ctx);
        assert_eq!(action, Action::await_change());
    }

    // =========================================================================
    // Scenarios against an in-memory cluster
    // =========================================================================

    use crate::testing::{
        claim, completed_volume_backup, data_export, fake_drivers, mounting_pod, settle,
        FakeCluster, FakeDriver, FakeSnapshotter, History,
    };
    use kdmp_drivers::{DriverName, JobInfo, LiveSource, ObjectKey};
    use std::collections::BTreeMap;

    struct World {
        cluster: Arc<FakeCluster>,
        drivers: BTreeMap<DriverName, Arc<FakeDriver>>,
        csi: Arc<FakeSnapshotter>,
        external: Arc<FakeSnapshotter>,
        ctx: Arc<ExportContext>,
    }

    impl World {
        fn new() -> Self {
            Self::with_config(KdmpConfig::default())
        }

        fn with_config(config: KdmpConfig) -> Self {
            let cluster = FakeCluster::new();
            let (registry, drivers) = fake_drivers();
            let csi = FakeSnapshotter::new("csi", cluster.clone());
            let external = FakeSnapshotter::new("external-storage", cluster.clone());
            let ctx = Arc::new(ExportContext::new(
                cluster.clone(),
                registry,
                SnapshotRegistry::with_drivers(csi.clone(), external.clone()),
                Arc::new(StaticConfigSource::new(config)),
                Arc::new(NoopEventPublisher),
            ));
            Self {
                cluster,
                drivers,
                csi,
                external,
                ctx,
            }
        }

        fn driver(&self, name: DriverName) -> &FakeDriver {
            &self.drivers[&name]
        }

        async fn settle(&self, rounds: usize) -> History {
            settle(&self.cluster, &self.ctx, "apps", "exp", rounds).await
        }

        fn status(&self) -> DataExportStatus {
            self.cluster.status("apps", "exp")
        }
    }

    fn rsync_export() -> DataExport {
        data_export(
            "exp",
            "apps",
            DataExportType::Rsync,
            None,
            Reference::pvc("apps", "src"),
            Reference::pvc("apps", "dst"),
        )
    }

    /// Stage order, progress bounds and transfer-id presence hold for every
    /// persisted status
    fn assert_invariants(history: &History, with_snapshot: bool) {
        for pair in history.windows(2) {
            let (before, after) = (&pair[0], &pair[1]);
            assert!(after.stage >= before.stage, "stage went backwards: {:?}", pair);
            if after.stage == before.stage {
                assert!(
                    after.progress_percentage >= before.progress_percentage,
                    "progress went backwards: {:?}",
                    pair
                );
            }
        }
        for status in history {
            assert!((0..=100).contains(&status.progress_percentage));
            if !with_snapshot {
                assert!(!status.stage.is_snapshot_stage());
                assert!(status.snapshot_id.is_empty());
            }
            let scheduled = status.stage > DataExportStage::TransferScheduled
                || (status.stage == DataExportStage::TransferScheduled
                    && status.status == StageStatus::Successful);
            assert_eq!(
                scheduled,
                !status.transfer_id.is_empty(),
                "transfer id out of step: {:?}",
                status
            );
        }
    }

    fn stages(history: &History) -> Vec<DataExportStage> {
        let mut stages: Vec<DataExportStage> = history.iter().map(|s| s.stage).collect();
        stages.dedup();
        stages
    }

    #[tokio::test]
    async fn story_rsync_between_claims_in_one_namespace() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());

        let history = world.settle(40).await;
        assert_invariants(&history, false);

        let status = world.status();
        assert_eq!(status.stage, DataExportStage::Final);
        assert_eq!(status.status, StageStatus::Successful);
        assert_eq!(status.transfer_id, "apps/exp-apps-src");
        assert_eq!(status.progress_percentage, 100);
        assert_eq!(world.driver(DriverName::Rsync).created(), 1);

        // Final reclaims the worker but keeps the VolumeBackup record
        assert_eq!(
            world.driver(DriverName::Rsync).deleted(),
            vec!["apps/exp-apps-src".to_string()]
        );
        assert!(world.cluster.deleted_volume_backups().is_empty());
    }

    #[tokio::test]
    async fn story_smaller_destination_fails_validation() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1073741824", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1073741823", "Bound"));
        world.cluster.add_export(rsync_export());

        world.settle(10).await;

        let status = world.status();
        assert_eq!(status.stage, DataExportStage::Initial);
        assert_eq!(status.status, StageStatus::Failed);
        assert!(status.reason.contains("less than"), "{}", status.reason);
        assert_eq!(world.driver(DriverName::Rsync).created(), 0);
    }

    #[tokio::test]
    async fn story_mounted_source_refuses_rsync() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_pod(mounting_pod("apps", "web-0", "src", "node-1"));
        world.cluster.add_export(rsync_export());

        world.settle(10).await;

        let status = world.status();
        assert_eq!(status.stage, DataExportStage::Initial);
        assert_eq!(status.status, StageStatus::Failed);
        assert_eq!(status.reason, "source PVC apps/src is mounted to [web-0] pods");
    }

    #[tokio::test]
    async fn story_cross_namespace_rsync_needs_a_snapshot() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("other", "dst", "1Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Rsync,
            None,
            Reference::pvc("apps", "src"),
            Reference::pvc("other", "dst"),
        ));

        world.settle(10).await;

        let status = world.status();
        assert_eq!(status.status, StageStatus::Failed);
        assert!(status.reason.contains("cannot copy from namespace apps to other"));
    }

    #[tokio::test]
    async fn story_restic_backup_into_a_backup_location() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Restic,
            None,
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));

        let history = world.settle(40).await;
        assert_invariants(&history, false);
        assert_eq!(
            stages(&history),
            vec![
                DataExportStage::Initial,
                DataExportStage::TransferScheduled,
                DataExportStage::TransferInProgress,
                DataExportStage::Final,
            ]
        );
        assert!(world.status().is_done());

        let opts = world.driver(DriverName::ResticBackup).last_options().unwrap();
        assert_eq!(opts.source_pvc, Some(ObjectKey::new("apps", "data")));
        assert_eq!(opts.backup_location, Some(ObjectKey::new("backups", "s3")));
        assert_eq!(opts.repository.as_deref(), Some("apps-data"));
        assert_eq!(opts.export_uid.as_deref(), Some("uid-exp"));
        assert!(opts.live.is_none());
    }

    #[tokio::test]
    async fn story_kopia_backup_through_a_csi_snapshot_across_namespaces() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_pod(mounting_pod("apps", "db-0", "data", "node-1"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Kopia,
            Some("csi-default"),
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));

        let history = world.settle(60).await;
        assert_invariants(&history, true);
        assert_eq!(stages(&history).len(), 7);

        let status = world.status();
        assert!(status.is_done());
        assert_eq!(status.snapshot_id, "snap-exp-data");
        assert_eq!(status.snapshot_namespace, "apps");
        assert!(status.snapshot_pvc_name.starts_with("snap-"));
        assert_eq!(status.snapshot_pvc_namespace, "backups");

        // the worker reads the restored claim, not the live source
        let opts = world.driver(DriverName::KopiaBackup).last_options().unwrap();
        assert_eq!(opts.source_pvc, Some(ObjectKey::new("backups", "snap-exp-data")));
        assert_eq!(opts.repository.as_deref(), Some("apps-data"));
        assert!(opts.live.is_none());

        // reclaimed on completion
        assert_eq!(world.csi.deleted_claims(), vec!["backups/snap-exp-data".to_string()]);
        assert_eq!(world.csi.deleted_snapshots(), vec!["apps/snap-exp-data".to_string()]);
        assert!(world.external.snapshots().is_empty());
    }

    #[tokio::test]
    async fn story_kopia_between_claims_is_rejected_up_front() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_pvc(claim("backups", "dst", "5Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Kopia,
            Some("csi-default"),
            Reference::pvc("apps", "data"),
            Reference::pvc("backups", "dst"),
        ));

        world.settle(10).await;

        let status = world.status();
        assert_eq!(status.stage, DataExportStage::Initial);
        assert_eq!(status.status, StageStatus::Failed);
        assert_eq!(
            status.reason,
            "kopia does not support PersistentVolumeClaim to PersistentVolumeClaim"
        );
        assert!(world.csi.snapshots().is_empty());
        for driver in world.drivers.values() {
            assert_eq!(driver.created(), 0);
        }
    }

    #[tokio::test]
    async fn story_pending_snapshot_is_stable_across_requeues() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.csi.hold_snapshots(true);
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Kopia,
            Some("csi-default"),
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));

        world.settle(10).await;
        let before = world.status();
        assert_eq!(before.stage, DataExportStage::SnapshotInProgress);
        assert_eq!(before.status, StageStatus::InProgress);
        assert_eq!(before.reason, "snapshot apps/snap-exp-data is not ready yet");

        let writes = world.cluster.status_writes();
        world.settle(10).await;
        assert_eq!(world.cluster.status_writes(), writes);
        assert_eq!(world.status(), before);
        assert_eq!(world.csi.snapshots(), vec!["apps/snap-exp-data".to_string()]);

        world.csi.hold_snapshots(false);
        world.settle(60).await;
        assert!(world.status().is_done());
    }

    #[tokio::test]
    async fn story_stork_snapshot_class_uses_external_storage() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Rsync,
            Some("stork-snapshot"),
            Reference::pvc("apps", "src"),
            Reference::pvc("apps", "dst"),
        ));

        world.settle(60).await;

        assert!(world.status().is_done());
        assert_eq!(
            world.external.deleted_snapshots(),
            vec!["apps/snap-exp-src".to_string()]
        );
        assert!(world.csi.deleted_snapshots().is_empty());
    }

    #[tokio::test]
    async fn story_delete_during_initial_skips_cleanup() {
        let world = World::new();
        world.cluster.add_export(rsync_export());

        // first round only adds the finalizer
        world.settle(1).await;
        assert!(world
            .cluster
            .export("apps", "exp")
            .unwrap()
            .finalizers()
            .contains(&CLEANUP_FINALIZER.to_string()));

        world.cluster.delete_export("apps", "exp");
        world.settle(5).await;

        assert!(world.cluster.export("apps", "exp").is_none());
        for driver in world.drivers.values() {
            assert_eq!(driver.created(), 0);
            assert!(driver.deleted().is_empty());
        }
        assert!(world.cluster.deleted_volume_backups().is_empty());
    }

    #[tokio::test]
    async fn story_delete_during_transfer_releases_everything() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Kopia,
            None,
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));

        // finalizer, Initial, advance, start job, advance
        world.settle(5).await;
        let status = world.status();
        assert_eq!(status.stage, DataExportStage::TransferInProgress);
        assert_eq!(status.transfer_id, "apps/exp-apps-data");

        world.cluster.delete_export("apps", "exp");
        world.settle(5).await;

        assert!(world.cluster.export("apps", "exp").is_none());
        assert_eq!(
            world.driver(DriverName::KopiaBackup).deleted(),
            vec!["apps/exp-apps-data".to_string()]
        );
        assert_eq!(
            world.cluster.deleted_volume_backups(),
            vec!["apps/exp-apps-data".to_string()]
        );
    }

    #[tokio::test]
    async fn story_lost_status_write_does_not_start_a_second_job() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());

        // finalizer, Initial, advance into TransferScheduled
        world.settle(3).await;
        assert_eq!(world.status().stage, DataExportStage::TransferScheduled);

        world.cluster.fail_next_status_write();
        world.settle(1).await;
        assert!(world.status().transfer_id.is_empty());
        assert_eq!(world.driver(DriverName::Rsync).created(), 1);

        world.settle(40).await;
        let status = world.status();
        assert!(status.is_done());
        assert_eq!(status.transfer_id, "apps/exp-apps-src");
        assert_eq!(world.driver(DriverName::Rsync).created(), 1);
    }

    #[tokio::test]
    async fn story_rate_limited_transfer_waits_for_a_slot() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());
        world.driver(DriverName::Rsync).set_rate_limited(true);

        world.settle(6).await;
        let status = world.status();
        assert_eq!(status.stage, DataExportStage::TransferScheduled);
        assert_eq!(status.status, StageStatus::InProgress);
        assert_eq!(status.reason, "waiting for a free rsync job slot (1/1 active)");

        world.driver(DriverName::Rsync).set_rate_limited(false);
        world.settle(40).await;
        assert!(world.status().is_done());
    }

    #[tokio::test]
    async fn story_delete_before_any_job_exists_only_drops_the_finalizer() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());
        world.driver(DriverName::Rsync).set_rate_limited(true);

        world.settle(6).await;
        let status = world.status();
        assert_eq!(status.stage, DataExportStage::TransferScheduled);
        assert!(status.transfer_id.is_empty());

        world.cluster.delete_export("apps", "exp");
        world.settle(5).await;

        assert!(world.cluster.export("apps", "exp").is_none());
        for driver in world.drivers.values() {
            assert_eq!(driver.created(), 0);
            assert!(driver.deleted().is_empty());
        }
        assert!(world.cluster.deleted_volume_backups().is_empty());
        for snapshotter in [&world.csi, &world.external] {
            assert!(snapshotter.snapshots().is_empty());
            assert!(snapshotter.deleted_snapshots().is_empty());
            assert!(snapshotter.deleted_claims().is_empty());
        }
    }

    #[tokio::test]
    async fn story_spec_edited_mid_transfer_still_cleans_up() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Kopia,
            None,
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));
        world.settle(5).await;
        let status = world.status();
        assert_eq!(status.stage, DataExportStage::TransferInProgress);
        assert_eq!(status.driver_name, "kopiabackup");

        // kopia has no PVC to PVC driver
        let mut edited = world.cluster.export("apps", "exp").unwrap();
        edited.spec.destination = Reference::pvc("backups", "dst");
        world.cluster.add_export(edited);
        world.cluster.delete_export("apps", "exp");
        world.settle(5).await;

        assert!(world.cluster.export("apps", "exp").is_none());
        assert_eq!(
            world.driver(DriverName::KopiaBackup).deleted(),
            vec!["apps/exp-apps-data".to_string()]
        );
        assert_eq!(
            world.cluster.deleted_volume_backups(),
            vec!["apps/exp-apps-data".to_string()]
        );
    }

    #[tokio::test]
    async fn story_failed_job_is_sticky() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Restic,
            None,
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));
        world.settle(5).await;

        world.driver(DriverName::ResticBackup).fail(
            "apps/exp-apps-data",
            JobInfo::failed("check apps/exp-apps-data job for details: repository locked")
                .with_last_error("repository locked"),
        );
        world.settle(10).await;

        let status = world.status();
        assert_eq!(status.stage, DataExportStage::TransferInProgress);
        assert_eq!(status.status, StageStatus::Failed);
        assert!(status.reason.starts_with("check apps/exp-apps-data job for details"));

        let writes = world.cluster.status_writes();
        world.settle(10).await;
        assert_eq!(world.cluster.status_writes(), writes);
    }

    #[tokio::test]
    async fn story_pending_source_waits_then_proceeds() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Pending"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());

        world.settle(4).await;
        let status = world.status();
        assert_eq!(status.stage, DataExportStage::Initial);
        assert_eq!(status.status, StageStatus::InProgress);
        assert_eq!(status.reason, "source PVC apps/src is pending");

        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.settle(40).await;
        assert!(world.status().is_done());
    }

    #[tokio::test]
    async fn story_kopia_restore_reads_the_volume_backup() {
        let world = World::new();
        world
            .cluster
            .add_volume_backup(completed_volume_backup("apps", "nightly", "k-123"));
        let mut destination = claim("restore", "data", "5Gi", "Pending");
        if let Some(spec) = destination.spec.as_mut() {
            spec.storage_class_name = Some("late-binding".to_string());
        }
        world.cluster.add_pvc(destination);
        world
            .cluster
            .add_storage_class("late-binding", "WaitForFirstConsumer");
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Kopia,
            None,
            Reference::volume_backup("apps", "nightly"),
            Reference::pvc("restore", "data"),
        ));

        world.settle(40).await;
        assert!(world.status().is_done());

        let opts = world.driver(DriverName::KopiaRestore).last_options().unwrap();
        assert_eq!(opts.destination_pvc, Some(ObjectKey::new("restore", "data")));
        assert_eq!(opts.snapshot_id.as_deref(), Some("k-123"));
        assert_eq!(opts.repository.as_deref(), Some("apps-data"));
        assert_eq!(opts.backup_location, Some(ObjectKey::new("backups", "s3")));
        assert!(opts.source_pvc.is_none());
    }

    #[tokio::test]
    async fn story_restore_without_a_completed_backup_fails() {
        let world = World::new();
        let mut vb = completed_volume_backup("apps", "nightly", "");
        vb.status = None;
        world.cluster.add_volume_backup(vb);
        world.cluster.add_pvc(claim("restore", "data", "5Gi", "Bound"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Restic,
            None,
            Reference::volume_backup("apps", "nightly"),
            Reference::pvc("restore", "data"),
        ));

        world.settle(10).await;
        let status = world.status();
        assert_eq!(status.status, StageStatus::Failed);
        assert_eq!(status.reason, "VolumeBackup apps/nightly has no completed snapshot");
    }

    #[tokio::test]
    async fn story_live_backup_follows_the_source_pod() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "data", "5Gi", "Bound"));
        world.cluster.add_pod(mounting_pod("apps", "db-0", "data", "node-1"));
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Restic,
            None,
            Reference::pvc("apps", "data"),
            Reference::backup_location("backups", "s3"),
        ));

        world.settle(40).await;
        assert!(world.status().is_done());

        let opts = world.driver(DriverName::ResticBackup).last_options().unwrap();
        assert_eq!(
            opts.live,
            Some(LiveSource {
                pod_uid: "uid-db-0".to_string(),
                node_name: "node-1".to_string(),
                volume_name: "pv-data".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn story_failed_snapshot_is_removed_on_delete() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.csi.fail_snapshots("driver rejected the snapshot");
        world.cluster.add_export(data_export(
            "exp",
            "apps",
            DataExportType::Rsync,
            Some("csi-default"),
            Reference::pvc("apps", "src"),
            Reference::pvc("apps", "dst"),
        ));

        world.settle(20).await;
        let status = world.status();
        assert_eq!(status.stage, DataExportStage::SnapshotInProgress);
        assert_eq!(status.status, StageStatus::Failed);
        assert!(status.reason.contains("driver rejected the snapshot"));

        world.cluster.delete_export("apps", "exp");
        world.settle(5).await;
        assert!(world.cluster.export("apps", "exp").is_none());
        assert_eq!(world.csi.deleted_snapshots(), vec!["apps/snap-exp-src".to_string()]);
        assert!(world.csi.deleted_claims().is_empty());
    }

    #[tokio::test]
    async fn story_final_is_a_no_op_once_reached() {
        let world = World::new();
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());
        world.settle(40).await;

        let writes = world.cluster.status_writes();
        let before = world.status();
        world.settle(10).await;
        assert_eq!(world.cluster.status_writes(), writes);
        assert_eq!(world.status(), before);
    }

    #[tokio::test]
    async fn story_reclaim_can_be_switched_off() {
        let world = World::with_config(KdmpConfig::from_data(&BTreeMap::from([(
            "KDMP_RECLAIM_ON_COMPLETION".to_string(),
            "false".to_string(),
        )])));
        world.cluster.add_pvc(claim("apps", "src", "1Gi", "Bound"));
        world.cluster.add_pvc(claim("apps", "dst", "1Gi", "Bound"));
        world.cluster.add_export(rsync_export());

        world.settle(40).await;
        assert!(world.status().is_done());
        assert!(world.driver(DriverName::Rsync).deleted().is_empty());
    }
}
