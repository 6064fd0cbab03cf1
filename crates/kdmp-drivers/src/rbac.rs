//! Per-job service account and the narrow role it runs with
//!
//! Workers only ever read their BackupLocation and write their own
//! VolumeBackup. The role grants exactly that, in the job namespace.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;

use kdmp_common::KDMP_GROUP;

const STORK_GROUP: &str = "stork.libopenstorage.org";
const SCC_GROUP: &str = "security.openshift.io";

/// Service account, role and binding for one job
#[derive(Clone, Debug)]
pub struct JobRbac {
    pub service_account: ServiceAccount,
    pub role: Role,
    pub binding: RoleBinding,
}

fn meta(name: &str, namespace: &str, labels: &BTreeMap<String, String>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(labels.clone()),
        ..Default::default()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn rules(openshift_scc: Option<&str>) -> Vec<PolicyRule> {
    let mut rules = vec![
        PolicyRule {
            api_groups: Some(strings(&[STORK_GROUP])),
            resources: Some(strings(&["backuplocations"])),
            verbs: strings(&["get"]),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(strings(&[KDMP_GROUP])),
            resources: Some(strings(&["volumebackups", "volumebackups/status"])),
            verbs: strings(&["get", "update", "patch"]),
            ..Default::default()
        },
    ];
    if let Some(scc) = openshift_scc {
        rules.push(PolicyRule {
            api_groups: Some(strings(&[SCC_GROUP])),
            resources: Some(strings(&["securitycontextconstraints"])),
            resource_names: Some(vec![scc.to_string()]),
            verbs: strings(&["use"]),
            ..Default::default()
        });
    }
    rules
}

/// Build the RBAC objects for job `name`; all three share its name
pub fn build_rbac(
    name: &str,
    namespace: &str,
    labels: &BTreeMap<String, String>,
    openshift_scc: Option<&str>,
) -> JobRbac {
    JobRbac {
        service_account: ServiceAccount {
            metadata: meta(name, namespace, labels),
            ..Default::default()
        },
        role: Role {
            metadata: meta(name, namespace, labels),
            rules: Some(rules(openshift_scc)),
        },
        binding: RoleBinding {
            metadata: meta(name, namespace, labels),
            role_ref: RoleRef {
                api_group: "rbac.authorization.k8s.io".to_string(),
                kind: "Role".to_string(),
                name: name.to_string(),
            },
            subjects: Some(vec![Subject {
                kind: "ServiceAccount".to_string(),
                name: name.to_string(),
                namespace: Some(namespace.to_string()),
                ..Default::default()
            }]),
        },
    }
}
