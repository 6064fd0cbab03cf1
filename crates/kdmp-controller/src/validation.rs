//! Checks run against the claims a DataExport names
//!
//! Pure functions over objects the stage handlers already fetched. A claim
//! that is not usable *yet* yields [`Error::Waiting`]; one that never will
//! be yields [`Error::Validation`].

use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod};
use kube::ResourceExt;

use kdmp_common::crd::{DataExportSpec, Reference};
use kdmp_common::quantity::pvc_capacity_bytes;

use crate::Error;

/// StorageClass binding mode that leaves claims Pending until a pod uses them
pub const WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

/// Both references carry a name and a namespace
pub fn check_references(spec: &DataExportSpec) -> Result<(), Error> {
    check_reference("source", &spec.source)?;
    check_reference("destination", &spec.destination)
}

fn check_reference(role: &str, reference: &Reference) -> Result<(), Error> {
    if reference.name.is_empty() {
        return Err(Error::validation(format!("{} name is empty", role)));
    }
    if reference.namespace.is_empty() {
        return Err(Error::validation(format!("{} namespace is empty", role)));
    }
    Ok(())
}

/// Phase of a claim, `Pending` when the status is not populated yet
pub fn claim_phase(pvc: &PersistentVolumeClaim) -> &str {
    pvc.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending")
}

/// Gate a stage on a claim being bound.
///
/// `binding_mode` is the volume binding mode of the claim's StorageClass;
/// a Pending claim under `WaitForFirstConsumer` is accepted because the
/// worker job is what binds it.
pub fn check_bound(
    role: &str,
    pvc: &PersistentVolumeClaim,
    binding_mode: Option<&str>,
) -> Result<(), Error> {
    let key = claim_key(pvc);
    match claim_phase(pvc) {
        "Bound" => Ok(()),
        "Lost" => Err(Error::validation(format!("{} PVC {} is lost", role, key))),
        _ if binding_mode == Some(WAIT_FOR_FIRST_CONSUMER) => Ok(()),
        phase => Err(Error::waiting(format!(
            "{} PVC {} is {}",
            role,
            key,
            phase.to_lowercase()
        ))),
    }
}

/// The destination must hold at least as much as the source
pub fn check_capacity(
    source: &PersistentVolumeClaim,
    destination: &PersistentVolumeClaim,
) -> Result<(), Error> {
    let (Some(src), Some(dst)) = (pvc_capacity_bytes(source)?, pvc_capacity_bytes(destination)?)
    else {
        return Ok(());
    };
    if dst < src {
        return Err(Error::validation(format!(
            "destination PVC size ({}) is less than source PVC size ({})",
            dst, src
        )));
    }
    Ok(())
}

/// Pods that still mount `claim`. Finished pods no longer hold the volume.
pub fn mounting_pods<'a>(pods: &'a [Pod], claim: &str) -> Vec<&'a Pod> {
    pods.iter()
        .filter(|pod| {
            let phase = pod.status.as_ref().and_then(|s| s.phase.as_deref());
            !matches!(phase, Some("Succeeded") | Some("Failed"))
        })
        .filter(|pod| {
            pod.spec
                .as_ref()
                .and_then(|s| s.volumes.as_ref())
                .is_some_and(|volumes| {
                    volumes.iter().any(|v| {
                        v.persistent_volume_claim
                            .as_ref()
                            .is_some_and(|c| c.claim_name == claim)
                    })
                })
        })
        .collect()
}

/// Fail when any pod mounts the source
pub fn check_unmounted(source: &PersistentVolumeClaim, pods: &[&Pod]) -> Result<(), Error> {
    if pods.is_empty() {
        return Ok(());
    }
    let names: Vec<String> = pods.iter().map(|p| p.name_any()).collect();
    Err(Error::validation(format!(
        "source PVC {} is mounted to [{}] pods",
        claim_key(source),
        names.join(" ")
    )))
}

/// rsync without a snapshot copies in place, so both claims must share a
/// namespace
pub fn check_same_namespace(spec: &DataExportSpec) -> Result<(), Error> {
    if spec.source.namespace != spec.destination.namespace {
        return Err(Error::validation(format!(
            "rsync without a snapshot storage class cannot copy from namespace {} to {}",
            spec.source.namespace, spec.destination.namespace
        )));
    }
    Ok(())
}

fn claim_key(pvc: &PersistentVolumeClaim) -> String {
    format!("{}/{}", pvc.namespace().unwrap_or_default(), pvc.name_any())
}
