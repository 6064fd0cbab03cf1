//! Deterministic names for every object KDMP creates
//!
//! Idempotence of the reconciler rests on these: a retried stage derives
//! the same name and finds the object it created last time.

use std::collections::BTreeMap;

use crate::kube_utils::deterministic_hash;
use crate::{
    EXPORT_NAMESPACE_ANNOTATION, EXPORT_NAMESPACE_LABEL, EXPORT_NAME_ANNOTATION,
    EXPORT_NAME_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE,
};

/// Longest name accepted for labels and most Kubernetes objects
pub const MAX_NAME_LEN: usize = 63;

/// Hex characters of the hash suffix appended to truncated names
const HASH_SUFFIX_LEN: usize = 8;

/// Prefix of snapshots and snapshot-restored PVCs
pub const SNAPSHOT_PREFIX: &str = "snap";

/// Prefix of repositories inside a bucket
pub const GENERIC_BACKUP_PREFIX: &str = "generic-backup";

/// Fit `name` into [`MAX_NAME_LEN`].
///
/// Names that already fit are returned unchanged. Longer names are cut and
/// suffixed with `-` and 8 hex characters of a hash of the full name, so two
/// long names sharing a prefix stay distinct.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= MAX_NAME_LEN {
        return name.to_string();
    }
    let keep = MAX_NAME_LEN - HASH_SUFFIX_LEN - 1;
    let mut cut = keep;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    let prefix = name[..cut].trim_end_matches(['-', '.']);
    let hash = deterministic_hash(name);
    format!("{}-{}", prefix, &hash[..HASH_SUFFIX_LEN])
}

/// Labels and annotations tying an object to its DataExport.
///
/// Label values are capped at [`MAX_NAME_LEN`] like names; the annotations
/// keep the untruncated name and namespace for mapping objects back.
pub fn export_references(
    export_name: &str,
    export_namespace: &str,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let labels = BTreeMap::from([
        (EXPORT_NAME_LABEL.to_string(), truncate_name(export_name)),
        (EXPORT_NAMESPACE_LABEL.to_string(), truncate_name(export_namespace)),
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
    ]);
    let annotations = BTreeMap::from([
        (EXPORT_NAME_ANNOTATION.to_string(), export_name.to_string()),
        (EXPORT_NAMESPACE_ANNOTATION.to_string(), export_namespace.to_string()),
    ]);
    (labels, annotations)
}

/// Worker job name for a DataExport: `<export>-<namespace>-<source-pvc>`
pub fn job_name(export_name: &str, namespace: &str, source_pvc: &str) -> String {
    truncate_name(&format!("{}-{}-{}", export_name, namespace, source_pvc))
}

/// Name shared by a snapshot and the PVC restored from it
pub fn snapshot_name(export_name: &str, source_pvc: &str) -> String {
    truncate_name(&format!("{}-{}-{}", SNAPSHOT_PREFIX, export_name, source_pvc))
}

/// Repository for a PVC: `<namespace>-<name>`
pub fn repository_name(pvc_namespace: &str, pvc_name: &str) -> String {
    format!("{}-{}", pvc_namespace, pvc_name)
}

/// Path of a repository inside its bucket
pub fn repository_path(repository: &str) -> String {
    format!("{}/{}", GENERIC_BACKUP_PREFIX, repository)
}
