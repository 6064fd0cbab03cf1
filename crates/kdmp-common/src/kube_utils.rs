//! Kubernetes helpers shared by the controller, drivers and executor

use kube::api::{Api, Patch, PatchParams};
use kube::discovery::ApiResource;
use kube::Client;

/// Trait for typed resources that are not derived CRDs.
///
/// Provides the API version and kind as associated constants, so the
/// `ApiResource` for `DynamicObject` access is built in one place.
///
/// ```ignore
/// impl HasApiResource for CsiVolumeSnapshot {
///     const API_VERSION: &'static str = "snapshot.storage.k8s.io/v1";
///     const KIND: &'static str = "VolumeSnapshot";
/// }
///
/// let api: Api<DynamicObject> =
///     Api::namespaced_with(client, "apps", &CsiVolumeSnapshot::api_resource());
/// ```
pub trait HasApiResource {
    /// Full API version (e.g., "snapshot.storage.k8s.io/v1", "v1")
    const API_VERSION: &'static str;
    /// Resource kind (e.g., "VolumeSnapshot")
    const KIND: &'static str;

    fn api_resource() -> ApiResource {
        build_api_resource(Self::API_VERSION, Self::KIND)
    }
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Split `group/version` into its parts. A bare version has an empty group.
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Lower-case plural used in resource URLs
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// 409 caused by a stale resourceVersion
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "Conflict")
}

/// 409 returned by a create of an object that already exists
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Patch the status sub-resource of a namespaced resource.
///
/// When `resource_version` is given it is sent with the patch, so the API
/// server rejects the write with a 409 if the object changed since it was
/// read.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    resource_version: Option<&str>,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = status_patch(resource_version, status);
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

fn status_patch(resource_version: Option<&str>, status: &impl serde::Serialize) -> serde_json::Value {
    match resource_version {
        Some(rv) => serde_json::json!({
            "metadata": { "resourceVersion": rv },
            "status": status,
        }),
        None => serde_json::json!({ "status": status }),
    }
}

/// Compute a deterministic hash of the input, returning a 16-char hex digest.
///
/// Truncated SHA-256, stable across toolchains, so it is safe to persist in
/// resource names.
pub fn deterministic_hash(input: &str) -> String {
    use aws_lc_rs::digest;
    let hash = digest::digest(&digest::SHA256, input.as_bytes());
    hash.as_ref()[..8]
        .iter()
        .fold(String::with_capacity(16), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}
