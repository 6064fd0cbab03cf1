//! CRD installation
//!
//! The operator owns DataExport and VolumeBackup and installs them with
//! server-side apply on every start, so the schema always matches the
//! binary. BackupLocation belongs to Stork and is never installed here.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use kdmp_common::crd::{DataExport, VolumeBackup};
use kdmp_common::retry::{retry_with_backoff, RetryConfig};

const FIELD_MANAGER: &str = "kdmp-operator";

/// Attempts per CRD before startup fails
const INSTALL_ATTEMPTS: u32 = 10;

/// CRD definition with name and resource
pub struct CrdDef {
    pub name: String,
    pub crd: CustomResourceDefinition,
}

fn def(crd: CustomResourceDefinition) -> CrdDef {
    CrdDef {
        name: crd.metadata.name.clone().unwrap_or_default(),
        crd,
    }
}

/// Every CRD this operator owns
pub fn owned_crds() -> Vec<CrdDef> {
    vec![def(DataExport::crd()), def(VolumeBackup::crd())]
}

/// The owned CRDs as one multi-document YAML stream
pub fn render_yaml() -> anyhow::Result<String> {
    let mut docs = Vec::new();
    for def in owned_crds() {
        docs.push(
            serde_yaml::to_string(&def.crd)
                .map_err(|e| anyhow::anyhow!("failed to serialize {} CRD: {}", def.name, e))?,
        );
    }
    Ok(docs.join("---\n"))
}

/// Install or update the owned CRDs
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let retry = RetryConfig::with_max_attempts(INSTALL_ATTEMPTS);

    for def in owned_crds() {
        tracing::info!(crd = %def.name, "Installing CRD");
        let patch = Patch::Apply(&def.crd);
        retry_with_backoff(&retry, &format!("install {} CRD", def.name), || {
            crds.patch(&def.name, &params, &patch)
        })
        .await
        .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("CRDs installed/updated");
    Ok(())
}
