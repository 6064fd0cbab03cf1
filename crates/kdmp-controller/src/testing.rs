//! In-memory cluster, drivers and snapshotter for multi-step reconcile
//! scenarios

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimStatus,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodStatus, Volume,
    VolumeResourceRequirements,
};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::ObjectMeta;
use kube::runtime::controller::Action;
use kube::ResourceExt;

use kdmp_common::crd::{
    DataExport, DataExportSpec, DataExportStatus, DataExportType, Reference, VolumeBackup,
    VolumeBackupSpec, VolumeBackupStatus,
};
use kdmp_common::naming::job_name;
use kdmp_drivers::{
    job_id, DriverError, DriverName, DriverRegistry, JobInfo, JobOptions, TransferDriver,
};
use kdmp_snapshot::{
    RestoreRequest, SnapshotDriver, SnapshotError, SnapshotInfo, SnapshotRef, SnapshotRegistry,
    SnapshotRequest, SnapshotState,
};

use crate::controller::{reconcile, ExportContext, ExportKubeClient};
use crate::Error;

fn key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

fn conflict() -> Error {
    Error::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: "the object has been modified".to_string(),
        reason: "Conflict".to_string(),
        code: 409,
    }))
}

// =============================================================================
// Cluster
// =============================================================================

#[derive(Default)]
struct ClusterState {
    exports: BTreeMap<String, DataExport>,
    pvcs: BTreeMap<String, PersistentVolumeClaim>,
    pods: Vec<Pod>,
    storage_classes: BTreeMap<String, StorageClass>,
    volume_backups: BTreeMap<String, VolumeBackup>,
    deleted_volume_backups: Vec<String>,
    resource_version: u64,
    status_writes: usize,
    fail_next_status_write: bool,
}

impl ClusterState {
    fn bump(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// API server stand-in. Status writes honour resourceVersion and a
/// DataExport disappears once it is deleted with no finalizers left.
#[derive(Default)]
pub struct FakeCluster {
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_export(&self, mut export: DataExport) {
        let mut state = self.state.lock().unwrap();
        export.metadata.resource_version = Some(state.bump());
        let k = key(&export.namespace().unwrap_or_default(), &export.name_any());
        state.exports.insert(k, export);
    }

    pub fn export(&self, namespace: &str, name: &str) -> Option<DataExport> {
        self.state
            .lock()
            .unwrap()
            .exports
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn status(&self, namespace: &str, name: &str) -> DataExportStatus {
        self.export(namespace, name)
            .map(|e| e.current_status())
            .unwrap_or_default()
    }

    /// Mark a DataExport deleted, removing it outright without finalizers
    pub fn delete_export(&self, namespace: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        let k = key(namespace, name);
        let Some(export) = state.exports.get_mut(&k) else {
            return;
        };
        if export.finalizers().is_empty() {
            state.exports.remove(&k);
            return;
        }
        export.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        let rv = state.bump();
        if let Some(export) = state.exports.get_mut(&k) {
            export.metadata.resource_version = Some(rv);
        }
    }

    pub fn add_pvc(&self, pvc: PersistentVolumeClaim) {
        let k = key(&pvc.namespace().unwrap_or_default(), &pvc.name_any());
        self.state.lock().unwrap().pvcs.insert(k, pvc);
    }

    pub fn pvc(&self, namespace: &str, name: &str) -> Option<PersistentVolumeClaim> {
        self.state
            .lock()
            .unwrap()
            .pvcs
            .get(&key(namespace, name))
            .cloned()
    }

    pub fn remove_pvc(&self, namespace: &str, name: &str) {
        self.state.lock().unwrap().pvcs.remove(&key(namespace, name));
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state.lock().unwrap().pods.push(pod);
    }

    pub fn add_storage_class(&self, name: &str, binding_mode: &str) {
        let sc = StorageClass {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            provisioner: "csi.example.com".to_string(),
            volume_binding_mode: Some(binding_mode.to_string()),
            ..Default::default()
        };
        self.state
            .lock()
            .unwrap()
            .storage_classes
            .insert(name.to_string(), sc);
    }

    pub fn add_volume_backup(&self, vb: VolumeBackup) {
        let k = key(&vb.namespace().unwrap_or_default(), &vb.name_any());
        self.state.lock().unwrap().volume_backups.insert(k, vb);
    }

    pub fn deleted_volume_backups(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_volume_backups.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state.lock().unwrap().status_writes
    }

    /// Reject the next status write with a 409
    pub fn fail_next_status_write(&self) {
        self.state.lock().unwrap().fail_next_status_write = true;
    }
}

#[async_trait]
impl ExportKubeClient for FakeCluster {
    async fn get_pvc(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<PersistentVolumeClaim>, Error> {
        Ok(self.pvc(namespace, name))
    }

    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .pods
            .iter()
            .filter(|p| p.namespace().as_deref() == Some(namespace))
            .cloned()
            .collect())
    }

    async fn get_storage_class(&self, name: &str) -> Result<Option<StorageClass>, Error> {
        Ok(self.state.lock().unwrap().storage_classes.get(name).cloned())
    }

    async fn get_volume_backup(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<VolumeBackup>, Error> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .volume_backups
            .get(&key(namespace, name))
            .cloned())
    }

    async fn delete_volume_backup(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        state.volume_backups.remove(&key(namespace, name));
        state.deleted_volume_backups.push(key(namespace, name));
        Ok(())
    }

    async fn patch_status(
        &self,
        export: &DataExport,
        status: &DataExportStatus,
    ) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if std::mem::take(&mut state.fail_next_status_write) {
            return Err(conflict());
        }
        let k = key(&export.namespace().unwrap_or_default(), &export.name_any());
        let stored_rv = state
            .exports
            .get(&k)
            .and_then(|e| e.metadata.resource_version.clone());
        if stored_rv.is_none() || stored_rv != export.metadata.resource_version {
            return Err(conflict());
        }
        let rv = state.bump();
        state.status_writes += 1;
        if let Some(stored) = state.exports.get_mut(&k) {
            stored.status = Some(status.clone());
            stored.metadata.resource_version = Some(rv);
        }
        Ok(())
    }

    async fn add_finalizer(&self, export: &DataExport, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(&export.namespace().unwrap_or_default(), &export.name_any());
        let rv = state.bump();
        if let Some(stored) = state.exports.get_mut(&k) {
            let finalizers = stored.metadata.finalizers.get_or_insert_with(Vec::new);
            if !finalizers.iter().any(|f| f == finalizer) {
                finalizers.push(finalizer.to_string());
            }
            stored.metadata.resource_version = Some(rv);
        }
        Ok(())
    }

    async fn remove_finalizer(&self, export: &DataExport, finalizer: &str) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        let k = key(&export.namespace().unwrap_or_default(), &export.name_any());
        let rv = state.bump();
        let gone = match state.exports.get_mut(&k) {
            Some(stored) => {
                if let Some(finalizers) = stored.metadata.finalizers.as_mut() {
                    finalizers.retain(|f| f != finalizer);
                }
                stored.metadata.resource_version = Some(rv);
                stored.metadata.deletion_timestamp.is_some() && stored.finalizers().is_empty()
            }
            None => false,
        };
        if gone {
            state.exports.remove(&k);
        }
        Ok(())
    }
}

// =============================================================================
// Transfer driver
// =============================================================================

#[derive(Default)]
struct DriverState {
    /// Job id to the number of status polls so far
    jobs: BTreeMap<String, u32>,
    failures: BTreeMap<String, JobInfo>,
    created: usize,
    deleted: Vec<String>,
    last_options: Option<JobOptions>,
    rate_limited: bool,
}

/// Driver whose jobs report 50% on the first poll and complete on the second
pub struct FakeDriver {
    name: DriverName,
    state: Mutex<DriverState>,
}

impl FakeDriver {
    pub fn new(name: DriverName) -> Arc<Self> {
        Arc::new(Self {
            name,
            state: Mutex::new(DriverState::default()),
        })
    }

    pub fn created(&self) -> usize {
        self.state.lock().unwrap().created
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }

    pub fn last_options(&self) -> Option<JobOptions> {
        self.state.lock().unwrap().last_options.clone()
    }

    pub fn set_rate_limited(&self, limited: bool) {
        self.state.lock().unwrap().rate_limited = limited;
    }

    /// Report `id` as failed from now on
    pub fn fail(&self, id: &str, info: JobInfo) {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(id.to_string(), info);
    }
}

#[async_trait]
impl TransferDriver for FakeDriver {
    fn name(&self) -> DriverName {
        self.name
    }

    async fn start_job(&self, opts: &JobOptions) -> Result<String, DriverError> {
        let mut state = self.state.lock().unwrap();
        if state.rate_limited {
            return Err(DriverError::RateLimited {
                driver: self.name.to_string(),
                active: 1,
                limit: 1,
            });
        }
        let claim = opts
            .source_pvc
            .clone()
            .or_else(|| opts.destination_pvc.clone())
            .ok_or_else(|| DriverError::invalid_options(self.name, "no claim"))?;
        let id = job_id(
            &claim.namespace,
            &job_name(&opts.export_name, &opts.export_namespace, &claim.name),
        );
        if !state.jobs.contains_key(&id) {
            state.jobs.insert(id.clone(), 0);
            state.created += 1;
        }
        state.last_options = Some(opts.clone());
        Ok(id)
    }

    async fn delete_job(&self, id: &str) -> Result<(), DriverError> {
        let mut state = self.state.lock().unwrap();
        state.jobs.remove(id);
        state.deleted.push(id.to_string());
        Ok(())
    }

    async fn job_status(&self, id: &str) -> Result<JobInfo, DriverError> {
        let mut state = self.state.lock().unwrap();
        if let Some(info) = state.failures.get(id) {
            return Ok(info.clone());
        }
        let Some(polls) = state.jobs.get_mut(id) else {
            return Ok(JobInfo::failed(format!("job {} not found", id)));
        };
        *polls += 1;
        Ok(if *polls == 1 {
            JobInfo::in_progress(50.0)
        } else {
            JobInfo::completed()
        })
    }
}

/// A registry holding a [`FakeDriver`] for every driver name
pub fn fake_drivers() -> (DriverRegistry, BTreeMap<DriverName, Arc<FakeDriver>>) {
    let mut registry = DriverRegistry::new();
    let mut fakes = BTreeMap::new();
    for name in DriverName::ALL {
        let driver = FakeDriver::new(name);
        registry.register(driver.clone());
        fakes.insert(name, driver);
    }
    (registry, fakes)
}

// =============================================================================
// Snapshotter
// =============================================================================

#[derive(Default)]
struct SnapshotterState {
    snapshots: BTreeSet<String>,
    deleted_snapshots: Vec<String>,
    deleted_claims: Vec<String>,
    failure: Option<String>,
    held: bool,
}

/// Snapshots are ready as soon as they exist; restored claims are created
/// bound in the fake cluster
pub struct FakeSnapshotter {
    name: &'static str,
    cluster: Arc<FakeCluster>,
    state: Mutex<SnapshotterState>,
}

impl FakeSnapshotter {
    pub fn new(name: &'static str, cluster: Arc<FakeCluster>) -> Arc<Self> {
        Arc::new(Self {
            name,
            cluster,
            state: Mutex::new(SnapshotterState::default()),
        })
    }

    pub fn fail_snapshots(&self, reason: &str) {
        self.state.lock().unwrap().failure = Some(reason.to_string());
    }

    /// Keep existing snapshots in progress until released
    pub fn hold_snapshots(&self, held: bool) {
        self.state.lock().unwrap().held = held;
    }

    pub fn snapshots(&self) -> Vec<String> {
        self.state.lock().unwrap().snapshots.iter().cloned().collect()
    }

    pub fn deleted_snapshots(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_snapshots.clone()
    }

    pub fn deleted_claims(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted_claims.clone()
    }
}

#[async_trait]
impl SnapshotDriver for FakeSnapshotter {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn create_snapshot(&self, req: &SnapshotRequest) -> Result<SnapshotRef, SnapshotError> {
        let snapshot = SnapshotRef::new(&req.name, &req.pvc_namespace);
        self.state
            .lock()
            .unwrap()
            .snapshots
            .insert(snapshot.to_string());
        Ok(snapshot)
    }

    async fn snapshot_status(&self, snapshot: &SnapshotRef) -> Result<SnapshotInfo, SnapshotError> {
        let state = self.state.lock().unwrap();
        if let Some(reason) = &state.failure {
            return Ok(SnapshotInfo::failed(reason.clone()));
        }
        if state.snapshots.contains(&snapshot.to_string()) {
            Ok(SnapshotInfo::new(if state.held {
                SnapshotState::InProgress
            } else {
                SnapshotState::Ready
            }))
        } else {
            Ok(SnapshotInfo::failed("not found"))
        }
    }

    async fn delete_snapshot(&self, snapshot: &SnapshotRef) -> Result<(), SnapshotError> {
        let mut state = self.state.lock().unwrap();
        state.snapshots.remove(&snapshot.to_string());
        state.deleted_snapshots.push(snapshot.to_string());
        Ok(())
    }

    async fn restore_volume_claim(
        &self,
        req: &RestoreRequest,
    ) -> Result<PersistentVolumeClaim, SnapshotError> {
        if let Some(existing) = self.cluster.pvc(&req.namespace, &req.name) {
            return Ok(existing);
        }
        let size = req
            .source
            .spec
            .as_ref()
            .and_then(|s| s.resources.as_ref())
            .and_then(|r| r.requests.as_ref())
            .and_then(|r| r.get("storage"))
            .map(|q| q.0.clone())
            .unwrap_or_else(|| "1Gi".to_string());
        let pvc = claim(&req.namespace, &req.name, &size, "Bound");
        self.cluster.add_pvc(pvc.clone());
        Ok(pvc)
    }

    async fn delete_restored_claim(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(), SnapshotError> {
        self.cluster.remove_pvc(namespace, name);
        self.state
            .lock()
            .unwrap()
            .deleted_claims
            .push(key(namespace, name));
        Ok(())
    }
}

/// Snapshot registry whose backends are never expected to be called
pub fn empty_snapshots() -> SnapshotRegistry {
    let snapshotter = FakeSnapshotter::new("csi", FakeCluster::new());
    SnapshotRegistry::with_drivers(snapshotter.clone(), snapshotter)
}

// =============================================================================
// Fixtures
// =============================================================================

pub fn claim(namespace: &str, name: &str, size: &str, phase: &str) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PersistentVolumeClaimSpec {
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([(
                    "storage".to_string(),
                    Quantity(size.to_string()),
                )])),
                ..Default::default()
            }),
            volume_name: (phase == "Bound").then(|| format!("pv-{}", name)),
            ..Default::default()
        }),
        status: Some(PersistentVolumeClaimStatus {
            phase: Some(phase.to_string()),
            ..Default::default()
        }),
    }
}

/// A running pod on `node` mounting `claim_name`
pub fn mounting_pod(namespace: &str, name: &str, claim_name: &str, node: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            uid: Some(format!("uid-{}", name)),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node.to_string()),
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: claim_name.to_string(),
                    read_only: None,
                }),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

pub fn data_export(
    name: &str,
    namespace: &str,
    type_: DataExportType,
    snapshot_storage_class: Option<&str>,
    source: Reference,
    destination: Reference,
) -> DataExport {
    let mut export = DataExport::new(
        name,
        DataExportSpec {
            type_,
            snapshot_storage_class: snapshot_storage_class.map(str::to_string),
            source,
            destination,
        },
    );
    export.metadata.namespace = Some(namespace.to_string());
    export.metadata.uid = Some(format!("uid-{}", name));
    export
}

/// A VolumeBackup left behind by a completed backup
pub fn completed_volume_backup(namespace: &str, name: &str, snapshot_id: &str) -> VolumeBackup {
    let mut vb = VolumeBackup::new(
        name,
        VolumeBackupSpec {
            repository: "apps-data".to_string(),
            backup_location: Reference::backup_location("backups", "s3"),
            snapshot_id: String::new(),
        },
    );
    vb.metadata.namespace = Some(namespace.to_string());
    vb.status = Some(VolumeBackupStatus {
        progress_percentage: 100.0,
        snapshot_id: snapshot_id.to_string(),
        ..Default::default()
    });
    vb
}

// =============================================================================
// Driving the reconciler
// =============================================================================

/// Every (stage, status, progress) persisted while settling
pub type History = Vec<DataExportStatus>;

/// Reconcile the stored DataExport the way the controller runtime would,
/// until it waits for a change, disappears, or `max_rounds` pass.
pub async fn settle(
    cluster: &FakeCluster,
    ctx: &Arc<ExportContext>,
    namespace: &str,
    name: &str,
    max_rounds: usize,
) -> History {
    let mut history = Vec::new();
    for _ in 0..max_rounds {
        let Some(export) = cluster.export(namespace, name) else {
            break;
        };
        let action = reconcile(Arc::new(export), ctx.clone()).await;
        if let Some(stored) = cluster.export(namespace, name) {
            let status = stored.current_status();
            if history.last() != Some(&status) {
                history.push(status);
            }
        }
        if matches!(action, Ok(ref a) if *a == Action::await_change()) {
            break;
        }
    }
    history
}
