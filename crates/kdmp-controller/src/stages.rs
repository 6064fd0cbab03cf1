//! Stage handlers
//!
//! One handler per [`DataExportStage`]. A handler observes the world, takes
//! at most one idempotent step, and reports a [`StageOutcome`] that the
//! reconciler persists. Handlers never write the DataExport themselves.

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::PersistentVolumeClaim;
use kube::ResourceExt;
use tracing::{debug, info};

use kdmp_common::crd::{
    DataExport, DataExportSpec, DataExportStage, DataExportStatus, Reference, StageStatus,
    VolumeBackup,
};
use kdmp_common::metrics::record_transfer_outcome;
use kdmp_common::naming::{export_references, repository_name, snapshot_name};
use kdmp_drivers::{parse_job_id, DriverName, JobOptions, JobState, LiveSource, ObjectKey};
use kdmp_snapshot::{RestoreRequest, SnapshotRef, SnapshotRequest, SnapshotState};

use crate::classifier::{classify, Classification};
use crate::controller::ExportContext;
use crate::validation::{
    check_bound, check_capacity, check_references, check_same_namespace, check_unmounted,
    claim_phase, mounting_pods,
};
use crate::{Error, ReasonKind};

/// Requeue after a stage completes
pub const TRANSITION_REQUEUE: Duration = Duration::from_secs(5);

/// Requeue while a snapshot or a restored claim is not ready
pub const SNAPSHOT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Requeue while a worker job runs, or waits for a free slot
pub const TRANSFER_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Result of running one stage handler
#[derive(Clone, Debug, PartialEq)]
pub struct StageOutcome {
    pub status: StageStatus,
    pub reason: String,
    /// Set when `status` is Failed, or InProgress because of a transient error
    pub kind: Option<ReasonKind>,
    pub requeue_after: Duration,
    transfer_id: Option<String>,
    driver: Option<DriverName>,
    snapshot: Option<SnapshotRef>,
    snapshot_pvc: Option<SnapshotRef>,
    progress: Option<i32>,
}

impl StageOutcome {
    fn new(status: StageStatus, reason: String, requeue_after: Duration) -> Self {
        Self {
            status,
            reason,
            kind: None,
            requeue_after,
            transfer_id: None,
            driver: None,
            snapshot: None,
            snapshot_pvc: None,
            progress: None,
        }
    }

    pub fn successful() -> Self {
        Self::new(StageStatus::Successful, String::new(), TRANSITION_REQUEUE)
    }

    pub fn in_progress(reason: impl Into<String>) -> Self {
        Self::new(StageStatus::InProgress, reason.into(), TRANSFER_POLL_INTERVAL)
    }

    pub fn failed(kind: ReasonKind, reason: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            ..Self::new(StageStatus::Failed, reason.into(), TRANSITION_REQUEUE)
        }
    }

    /// Transient errors keep the stage InProgress; anything else fails it
    pub fn from_error(err: &Error) -> Self {
        let kind = err.reason_kind();
        if err.is_retryable() {
            Self {
                kind: Some(kind),
                ..Self::in_progress(err.to_string())
            }
        } else {
            Self::failed(kind, err.to_string())
        }
    }

    pub fn requeue_after(mut self, after: Duration) -> Self {
        self.requeue_after = after;
        self
    }

    pub fn with_transfer_id(mut self, id: impl Into<String>) -> Self {
        self.transfer_id = Some(id.into());
        self
    }

    pub fn with_driver(mut self, driver: DriverName) -> Self {
        self.driver = Some(driver);
        self
    }

    pub fn with_snapshot(mut self, snapshot: SnapshotRef) -> Self {
        self.snapshot = Some(snapshot);
        self
    }

    pub fn with_snapshot_pvc(mut self, pvc: SnapshotRef) -> Self {
        self.snapshot_pvc = Some(pvc);
        self
    }

    /// Progress is clamped to 0..=100 and never moves backwards within a
    /// stage
    pub fn with_progress(mut self, progress: f64) -> Self {
        self.progress = Some(progress.clamp(0.0, 100.0) as i32);
        self
    }

    /// Fold this outcome into `status`
    pub fn apply(&self, status: &mut DataExportStatus) {
        status.status = self.status;
        status.reason = self.reason.clone();
        if let Some(id) = &self.transfer_id {
            status.transfer_id = id.clone();
        }
        if let Some(driver) = self.driver {
            status.driver_name = driver.to_string();
        }
        if let Some(snapshot) = &self.snapshot {
            status.snapshot_id = snapshot.name.clone();
            status.snapshot_namespace = snapshot.namespace.clone();
        }
        if let Some(pvc) = &self.snapshot_pvc {
            status.snapshot_pvc_name = pvc.name.clone();
            status.snapshot_pvc_namespace = pvc.namespace.clone();
        }
        if let Some(progress) = self.progress {
            status.progress_percentage = status.progress_percentage.max(progress);
        }
    }
}

/// Run the handler for the current stage
pub async fn run(
    export: &DataExport,
    current: &DataExportStatus,
    ctx: &ExportContext,
) -> StageOutcome {
    let result = match current.stage {
        DataExportStage::Initial => initial(export, ctx).await,
        DataExportStage::SnapshotScheduled => snapshot_scheduled(export, ctx).await,
        DataExportStage::SnapshotInProgress => snapshot_in_progress(export, current, ctx).await,
        DataExportStage::SnapshotRestore => snapshot_restore(export, current, ctx).await,
        DataExportStage::TransferScheduled => transfer_scheduled(export, current, ctx).await,
        DataExportStage::TransferInProgress => transfer_in_progress(export, current, ctx).await,
        DataExportStage::Final => final_stage(export, current, ctx).await,
    };
    result.unwrap_or_else(|e| {
        debug!(stage = %current.stage, error = %e, "stage handler returned an error");
        let outcome = StageOutcome::from_error(&e);
        if outcome.status == StageStatus::InProgress {
            let poll = match current.stage {
                DataExportStage::Initial => SNAPSHOT_POLL_INTERVAL,
                stage if stage.is_snapshot_stage() => SNAPSHOT_POLL_INTERVAL,
                _ => TRANSFER_POLL_INTERVAL,
            };
            outcome.requeue_after(poll)
        } else {
            outcome
        }
    })
}

// =============================================================================
// Initial
// =============================================================================

async fn initial(export: &DataExport, ctx: &ExportContext) -> Result<StageOutcome, Error> {
    let spec = &export.spec;
    let classification = classify(spec)?;
    check_references(spec)?;

    match classification.driver {
        DriverName::Rsync => {
            let source = bound_claim(ctx, "source", &spec.source, false).await?;
            let destination = bound_claim(ctx, "destination", &spec.destination, true).await?;
            check_capacity(&source, &destination)?;
            if !classification.with_snapshot {
                check_same_namespace(spec)?;
                let pods = ctx.kube.list_pods(&spec.source.namespace).await?;
                check_unmounted(&source, &mounting_pods(&pods, &spec.source.name))?;
            }
        }
        DriverName::ResticBackup | DriverName::KopiaBackup => {
            bound_claim(ctx, "source", &spec.source, false).await?;
        }
        DriverName::ResticRestore | DriverName::KopiaRestore => {
            restore_source(ctx, spec).await?;
            bound_claim(ctx, "destination", &spec.destination, true).await?;
        }
        driver @ (DriverName::KopiaDelete | DriverName::KopiaMaintenance) => {
            return Err(Error::validation(format!(
                "{} cannot serve a DataExport",
                driver
            )));
        }
    }

    info!(driver = %classification.driver, snapshot = classification.with_snapshot, "request validated");
    Ok(StageOutcome::successful())
}

/// Fetch a claim and require it to be bound.
///
/// `accept_unbound` lets a Pending claim through when its StorageClass
/// binds on first use.
async fn bound_claim(
    ctx: &ExportContext,
    role: &str,
    reference: &Reference,
    accept_unbound: bool,
) -> Result<PersistentVolumeClaim, Error> {
    let pvc = ctx
        .kube
        .get_pvc(&reference.namespace, &reference.name)
        .await?
        .ok_or_else(|| Error::validation(format!("{} PVC {} not found", role, reference.key())))?;
    let binding_mode = if accept_unbound {
        binding_mode(ctx, &pvc).await?
    } else {
        None
    };
    check_bound(role, &pvc, binding_mode.as_deref())?;
    Ok(pvc)
}

/// Volume binding mode of a Pending claim's StorageClass
async fn binding_mode(
    ctx: &ExportContext,
    pvc: &PersistentVolumeClaim,
) -> Result<Option<String>, Error> {
    if claim_phase(pvc) != "Pending" {
        return Ok(None);
    }
    let Some(class) = pvc
        .spec
        .as_ref()
        .and_then(|s| s.storage_class_name.as_deref())
    else {
        return Ok(None);
    };
    Ok(ctx
        .kube
        .get_storage_class(class)
        .await?
        .and_then(|sc| sc.volume_binding_mode))
}

/// The VolumeBackup a restore reads from, and its engine snapshot id
async fn restore_source(
    ctx: &ExportContext,
    spec: &DataExportSpec,
) -> Result<(VolumeBackup, String), Error> {
    let vb = ctx
        .kube
        .get_volume_backup(&spec.source.namespace, &spec.source.name)
        .await?
        .ok_or_else(|| {
            Error::validation(format!(
                "source VolumeBackup {} not found",
                spec.source.key()
            ))
        })?;
    let snapshot_id = vb
        .completed_snapshot_id()
        .map(str::to_string)
        .ok_or_else(|| {
            Error::validation(format!(
                "VolumeBackup {} has no completed snapshot",
                spec.source.key()
            ))
        })?;
    Ok((vb, snapshot_id))
}

// =============================================================================
// Snapshot stages
// =============================================================================

fn snapshot_class(spec: &DataExportSpec) -> Result<&str, Error> {
    spec.snapshot_class()
        .ok_or_else(|| Error::validation("snapshot storage class is not set"))
}

fn recorded_snapshot(current: &DataExportStatus) -> Result<SnapshotRef, Error> {
    if current.snapshot_id.is_empty() {
        return Err(Error::validation("no snapshot recorded for this DataExport"));
    }
    Ok(SnapshotRef::new(
        &current.snapshot_id,
        &current.snapshot_namespace,
    ))
}

/// Labels tying a snapshot or restored claim back to its DataExport
fn export_labels(export: &DataExport) -> BTreeMap<String, String> {
    let (labels, _) = export_references(&export.name_any(), &export.namespace().unwrap_or_default());
    labels
}

async fn snapshot_scheduled(
    export: &DataExport,
    ctx: &ExportContext,
) -> Result<StageOutcome, Error> {
    let spec = &export.spec;
    let class = snapshot_class(spec)?;
    let request = SnapshotRequest {
        name: snapshot_name(&export.name_any(), &spec.source.name),
        pvc_namespace: spec.source.namespace.clone(),
        pvc_name: spec.source.name.clone(),
        class: class.to_string(),
        labels: export_labels(export),
    };
    let snapshot = ctx
        .snapshots
        .for_class(class)
        .create_snapshot(&request)
        .await?;
    info!(snapshot = %snapshot, class, "snapshot scheduled");
    Ok(StageOutcome::successful().with_snapshot(snapshot))
}

async fn snapshot_in_progress(
    export: &DataExport,
    current: &DataExportStatus,
    ctx: &ExportContext,
) -> Result<StageOutcome, Error> {
    let snapshot = recorded_snapshot(current)?;
    let info = ctx
        .snapshots
        .for_class(snapshot_class(&export.spec)?)
        .snapshot_status(&snapshot)
        .await?;

    Ok(match info.state {
        SnapshotState::Ready => StageOutcome::successful(),
        SnapshotState::Failed => StageOutcome::failed(
            ReasonKind::Snapshot,
            format!("snapshot {} failed: {}", snapshot, info.reason),
        ),
        SnapshotState::InProgress | SnapshotState::Unknown => {
            StageOutcome::in_progress(format!("snapshot {} is not ready yet", snapshot))
                .requeue_after(SNAPSHOT_POLL_INTERVAL)
        }
    })
}

async fn snapshot_restore(
    export: &DataExport,
    current: &DataExportStatus,
    ctx: &ExportContext,
) -> Result<StageOutcome, Error> {
    let spec = &export.spec;
    let snapshot = recorded_snapshot(current)?;
    let source = ctx
        .kube
        .get_pvc(&spec.source.namespace, &spec.source.name)
        .await?
        .ok_or_else(|| {
            Error::validation(format!("source PVC {} not found", spec.source.key()))
        })?;

    let request = RestoreRequest {
        name: snapshot.name.clone(),
        namespace: spec.destination.namespace.clone(),
        snapshot,
        source,
        labels: export_labels(export),
    };
    let pvc = ctx
        .snapshots
        .for_class(snapshot_class(spec)?)
        .restore_volume_claim(&request)
        .await?;
    let restored = SnapshotRef::new(
        pvc.name_any(),
        pvc.namespace().unwrap_or_else(|| request.namespace.clone()),
    );

    // record the claim even while it binds so cleanup can find it
    let binding_mode = binding_mode(ctx, &pvc).await?;
    match check_bound("restored", &pvc, binding_mode.as_deref()) {
        Ok(()) => {
            info!(pvc = %restored, "snapshot restored");
            Ok(StageOutcome::successful().with_snapshot_pvc(restored))
        }
        Err(e) if e.is_retryable() => Ok(StageOutcome::in_progress(e.to_string())
            .with_snapshot_pvc(restored)
            .requeue_after(SNAPSHOT_POLL_INTERVAL)),
        Err(e) => Err(e),
    }
}

// =============================================================================
// Transfer stages
// =============================================================================

async fn transfer_scheduled(
    export: &DataExport,
    current: &DataExportStatus,
    ctx: &ExportContext,
) -> Result<StageOutcome, Error> {
    let classification = classify(&export.spec)?;
    let driver = ctx.drivers.get(classification.driver)?;
    let opts = job_options(export, current, classification, ctx).await?;
    let id = driver.start_job(&opts).await?;
    info!(transfer_id = %id, driver = %classification.driver, "transfer scheduled");
    Ok(StageOutcome::successful()
        .with_transfer_id(id)
        .with_driver(classification.driver))
}

fn object_key(reference: &Reference) -> ObjectKey {
    ObjectKey::new(&reference.namespace, &reference.name)
}

/// Claim the worker reads from: the snapshot-restored claim when there is
/// one, the requested source otherwise
fn transfer_source(spec: &DataExportSpec, current: &DataExportStatus) -> ObjectKey {
    if current.snapshot_pvc_name.is_empty() {
        object_key(&spec.source)
    } else {
        ObjectKey::new(&current.snapshot_pvc_namespace, &current.snapshot_pvc_name)
    }
}

async fn job_options(
    export: &DataExport,
    current: &DataExportStatus,
    classification: Classification,
    ctx: &ExportContext,
) -> Result<JobOptions, Error> {
    let spec = &export.spec;
    let mut opts = JobOptions::new(export.name_any(), export.namespace().unwrap_or_default());
    opts.export_uid = export.metadata.uid.clone();

    match classification.driver {
        DriverName::Rsync => {
            opts.source_pvc = Some(transfer_source(spec, current));
            opts.destination_pvc = Some(object_key(&spec.destination));
        }
        DriverName::ResticBackup | DriverName::KopiaBackup => {
            opts.source_pvc = Some(transfer_source(spec, current));
            opts.backup_location = Some(object_key(&spec.destination));
            opts.repository = Some(repository_name(&spec.source.namespace, &spec.source.name));
            if current.snapshot_pvc_name.is_empty() {
                opts.live = live_source(ctx, &spec.source).await?;
            }
        }
        DriverName::ResticRestore | DriverName::KopiaRestore => {
            let (vb, snapshot_id) = restore_source(ctx, spec).await?;
            let location = &vb.spec.backup_location;
            let location_namespace = if location.namespace.is_empty() {
                spec.source.namespace.clone()
            } else {
                location.namespace.clone()
            };
            opts.destination_pvc = Some(object_key(&spec.destination));
            opts.backup_location = Some(ObjectKey::new(location_namespace, &location.name));
            opts.repository = Some(vb.spec.repository.clone());
            opts.snapshot_id = Some(snapshot_id);
        }
        driver @ (DriverName::KopiaDelete | DriverName::KopiaMaintenance) => {
            return Err(Error::validation(format!(
                "{} cannot serve a DataExport",
                driver
            )));
        }
    }
    Ok(opts)
}

/// A running pod that mounts the source, read through the kubelet's pods
/// directory on its node
async fn live_source(
    ctx: &ExportContext,
    source: &Reference,
) -> Result<Option<LiveSource>, Error> {
    let pods = ctx.kube.list_pods(&source.namespace).await?;
    let Some(pod) = mounting_pods(&pods, &source.name).into_iter().find(|pod| {
        pod.metadata.uid.is_some()
            && pod
                .spec
                .as_ref()
                .and_then(|s| s.node_name.as_ref())
                .is_some()
    }) else {
        return Ok(None);
    };

    let pvc = ctx
        .kube
        .get_pvc(&source.namespace, &source.name)
        .await?
        .ok_or_else(|| Error::validation(format!("source PVC {} not found", source.key())))?;
    let volume_name = pvc
        .spec
        .as_ref()
        .and_then(|s| s.volume_name.clone())
        .ok_or_else(|| {
            Error::waiting(format!(
                "source PVC {} is not bound to a volume yet",
                source.key()
            ))
        })?;

    debug!(pod = %pod.name_any(), "source is mounted, backing up live");
    Ok(Some(LiveSource {
        pod_uid: pod.metadata.uid.clone().unwrap_or_default(),
        node_name: pod
            .spec
            .as_ref()
            .and_then(|s| s.node_name.clone())
            .unwrap_or_default(),
        volume_name,
    }))
}

async fn transfer_in_progress(
    export: &DataExport,
    current: &DataExportStatus,
    ctx: &ExportContext,
) -> Result<StageOutcome, Error> {
    if current.transfer_id.is_empty() {
        return Err(Error::validation("no transfer recorded for this DataExport"));
    }
    let name = recorded_driver(export, current)?;
    let driver = ctx.drivers.get(name)?;
    let info = driver.job_status(&current.transfer_id).await?;

    Ok(match info.state {
        JobState::Completed => {
            record_transfer_outcome(name.as_str(), true);
            info!(transfer_id = %current.transfer_id, "transfer completed");
            StageOutcome::successful().with_progress(100.0)
        }
        JobState::Failed => {
            record_transfer_outcome(name.as_str(), false);
            let kind = if info.last_error.is_empty() {
                ReasonKind::JobFailed
            } else {
                ReasonKind::Engine
            };
            StageOutcome::failed(kind, info.reason)
        }
        JobState::InProgress => StageOutcome::in_progress(info.last_error)
            .with_progress(info.progress)
            .requeue_after(TRANSFER_POLL_INTERVAL),
    })
}

// =============================================================================
// Final
// =============================================================================

async fn final_stage(
    export: &DataExport,
    current: &DataExportStatus,
    ctx: &ExportContext,
) -> Result<StageOutcome, Error> {
    let config = ctx.config.load().await?;
    if config.reclaim_on_completion {
        release(export, current, ctx, false).await?;
        info!("reclaimed worker and snapshot resources");
    }
    Ok(StageOutcome::successful())
}

/// Driver that owns the recorded job. Statuses written before the driver
/// was recorded fall back to classifying the spec.
fn recorded_driver(export: &DataExport, status: &DataExportStatus) -> Result<DriverName, Error> {
    if status.driver_name.is_empty() {
        return Ok(classify(&export.spec)?.driver);
    }
    Ok(status.driver_name.parse()?)
}

/// Delete everything created on behalf of `export`.
///
/// The worker job goes through its driver and the snapshot objects through
/// their backend. The VolumeBackup record is only removed when
/// `delete_volume_backup` is set because restores read its snapshot id.
pub(crate) async fn release(
    export: &DataExport,
    status: &DataExportStatus,
    ctx: &ExportContext,
    delete_volume_backup: bool,
) -> Result<(), Error> {
    if !status.transfer_id.is_empty() {
        ctx.drivers
            .get(recorded_driver(export, status)?)?
            .delete_job(&status.transfer_id)
            .await?;
        if delete_volume_backup {
            let (namespace, name) = parse_job_id(&status.transfer_id)?;
            ctx.kube.delete_volume_backup(namespace, name).await?;
        }
        debug!(transfer_id = %status.transfer_id, "worker job released");
    }

    if let Some(class) = export.spec.snapshot_class() {
        let snapshots = ctx.snapshots.for_class(class);
        if !status.snapshot_pvc_name.is_empty() {
            snapshots
                .delete_restored_claim(&status.snapshot_pvc_namespace, &status.snapshot_pvc_name)
                .await?;
        } else if status.stage >= DataExportStage::SnapshotRestore && !status.snapshot_id.is_empty()
        {
            // the claim shares the snapshot's name and may exist unrecorded
            snapshots
                .delete_restored_claim(&export.spec.destination.namespace, &status.snapshot_id)
                .await?;
        }
        if !status.snapshot_id.is_empty() {
            snapshots
                .delete_snapshot(&SnapshotRef::new(
                    &status.snapshot_id,
                    &status.snapshot_namespace,
                ))
                .await?;
            debug!(snapshot = %status.snapshot_id, "snapshot released");
        }
    }
    Ok(())
}
