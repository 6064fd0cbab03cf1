//! Worker Job manifests
//!
//! Pure builders: nothing here talks to the API server.

use std::collections::BTreeMap;

use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Affinity, Container, HostPathVolumeSource, LocalObjectReference, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PersistentVolumeClaimVolumeSource, PodSpec,
    PodTemplateSpec, ResourceRequirements, SecretVolumeSource, SecurityContext, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;

use kdmp_common::config::WorkerConfig;
use kdmp_common::credentials::CREDENTIALS_MOUNT_PATH;
use kdmp_common::naming::export_references;
use kdmp_common::{DRIVER_NAME_LABEL, KDMP_API_VERSION};

use crate::{DriverName, JobOptions, LiveSource};

/// Where the source PVC is mounted
pub const SOURCE_MOUNT_PATH: &str = "/data";
/// Where the destination PVC is mounted
pub const DESTINATION_MOUNT_PATH: &str = "/dest";
/// Kubelet pod directory on the node
pub const HOST_PODS_PATH: &str = "/var/lib/kubelet/pods";
/// Where [`HOST_PODS_PATH`] is mounted for live backups
pub const HOST_PODS_MOUNT_PATH: &str = "/hostpods";

const CONTAINER_NAME: &str = "kdmp-worker";
const HOSTNAME_LABEL: &str = "kubernetes.io/hostname";

/// Inputs for one worker Job
#[derive(Clone, Debug)]
pub struct JobTemplate<'a> {
    pub name: &'a str,
    pub namespace: &'a str,
    pub worker: &'a WorkerConfig,
    pub backoff_limit: i32,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub command: Vec<String>,
    /// Mounted at [`SOURCE_MOUNT_PATH`]
    pub source_pvc: Option<&'a str>,
    /// Mounted at [`DESTINATION_MOUNT_PATH`]
    pub destination_pvc: Option<&'a str>,
    /// Mounted read-only at the credentials path
    pub credentials_secret: Option<&'a str>,
    pub live: Option<&'a LiveSource>,
    pub service_account: Option<&'a str>,
}

/// Labels every worker object carries, and the annotations on the job
pub fn job_labels(
    driver: DriverName,
    opts: &JobOptions,
) -> (BTreeMap<String, String>, BTreeMap<String, String>) {
    let (mut labels, annotations) = export_references(&opts.export_name, &opts.export_namespace);
    labels.insert(DRIVER_NAME_LABEL.to_string(), driver.as_str().to_string());
    (labels, annotations)
}

/// Owner reference to the DataExport. Kubernetes rejects cross-namespace
/// owners, so jobs in another namespace are tracked by label only.
pub fn export_owner(opts: &JobOptions, job_namespace: &str) -> Option<OwnerReference> {
    let uid = opts.export_uid.as_ref()?;
    if opts.export_namespace != job_namespace {
        return None;
    }
    Some(OwnerReference {
        api_version: KDMP_API_VERSION.to_string(),
        kind: "DataExport".to_string(),
        name: opts.export_name.clone(),
        uid: uid.clone(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// Path the executor should read a live source from; the `*` is resolved
/// by the executor against the CSI or in-tree volume directory.
pub fn live_source_path(live: &LiveSource) -> String {
    format!(
        "{}/{}/volumes/*/{}",
        HOST_PODS_MOUNT_PATH, live.pod_uid, live.volume_name
    )
}

fn pvc_volume(name: &str, claim: &str) -> Volume {
    Volume {
        name: name.to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
            claim_name: claim.to_string(),
            read_only: None,
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        read_only: read_only.then_some(true),
        ..Default::default()
    }
}

fn resources(worker: &WorkerConfig) -> ResourceRequirements {
    ResourceRequirements {
        requests: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(worker.request_cpu.clone())),
            ("memory".to_string(), Quantity(worker.request_memory.clone())),
        ])),
        limits: Some(BTreeMap::from([
            ("cpu".to_string(), Quantity(worker.limit_cpu.clone())),
            ("memory".to_string(), Quantity(worker.limit_memory.clone())),
        ])),
        ..Default::default()
    }
}

fn pin_to_node(node: &str) -> Affinity {
    Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: HOSTNAME_LABEL.to_string(),
                        operator: "In".to_string(),
                        values: Some(vec![node.to_string()]),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the Job for `t`
pub fn build_job(t: &JobTemplate<'_>) -> Job {
    let mut volumes = Vec::new();
    let mut mounts = Vec::new();

    if t.live.is_some() {
        volumes.push(Volume {
            name: "host-pods".to_string(),
            host_path: Some(HostPathVolumeSource {
                path: HOST_PODS_PATH.to_string(),
                type_: Some("Directory".to_string()),
            }),
            ..Default::default()
        });
        mounts.push(mount("host-pods", HOST_PODS_MOUNT_PATH, true));
    } else if let Some(claim) = t.source_pvc {
        volumes.push(pvc_volume("source", claim));
        mounts.push(mount("source", SOURCE_MOUNT_PATH, false));
    }
    if let Some(claim) = t.destination_pvc {
        volumes.push(pvc_volume("destination", claim));
        mounts.push(mount("destination", DESTINATION_MOUNT_PATH, false));
    }
    if let Some(secret) = t.credentials_secret {
        volumes.push(Volume {
            name: "cred-secret".to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(secret.to_string()),
                ..Default::default()
            }),
            ..Default::default()
        });
        mounts.push(mount("cred-secret", CREDENTIALS_MOUNT_PATH, true));
    }

    let container = Container {
        name: CONTAINER_NAME.to_string(),
        image: Some(t.worker.image.clone()),
        image_pull_policy: Some("IfNotPresent".to_string()),
        command: Some(t.command.clone()),
        resources: Some(resources(t.worker)),
        volume_mounts: Some(mounts),
        security_context: t.live.map(|_| SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    };

    let pod = PodSpec {
        restart_policy: Some("OnFailure".to_string()),
        containers: vec![container],
        volumes: Some(volumes),
        service_account_name: t.service_account.map(str::to_string),
        image_pull_secrets: t.worker.image_pull_secret.as_ref().map(|s| {
            vec![LocalObjectReference {
                name: s.clone(),
            }]
        }),
        affinity: t.live.map(|live| pin_to_node(&live.node_name)),
        ..Default::default()
    };

    Job {
        metadata: ObjectMeta {
            name: Some(t.name.to_string()),
            namespace: Some(t.namespace.to_string()),
            labels: Some(t.labels.clone()),
            annotations: Some(t.annotations.clone()).filter(|a| !a.is_empty()),
            owner_references: t.owner.clone().map(|o| vec![o]),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(t.backoff_limit),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(t.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(pod),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
