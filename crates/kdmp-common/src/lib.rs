//! Shared types and plumbing for the KDMP data-management plane
//!
//! Holds the CRDs every other crate speaks (DataExport, VolumeBackup and the
//! read-only BackupLocation view), the central `kdmp-config` configuration,
//! deterministic resource naming, and the ambient stack: errors, telemetry,
//! metrics, events, retries and leader election.

pub mod config;
pub mod credentials;
pub mod crd;
pub mod error;
pub mod events;
pub mod kube_utils;
pub mod leader_election;
pub mod metrics;
pub mod naming;
pub mod quantity;
pub mod retry;
pub mod telemetry;

pub use error::{Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};

/// API group for all KDMP custom resources
pub const KDMP_GROUP: &str = "kdmp.portworx.com";

/// API version for all KDMP custom resources
pub const KDMP_API_VERSION: &str = "kdmp.portworx.com/v1alpha1";

/// Namespace the operator runs in when `POD_NAMESPACE` is not set
pub const DEFAULT_OPERATOR_NAMESPACE: &str = "kube-system";

/// Label carrying the transfer driver that owns a worker job
pub const DRIVER_NAME_LABEL: &str = "kdmp.portworx.com/driver-name";

/// Label carrying the name of the DataExport a worker job belongs to
pub const EXPORT_NAME_LABEL: &str = "kdmp.portworx.com/dataexport-name";

/// Label carrying the namespace of the DataExport a worker job belongs to
pub const EXPORT_NAMESPACE_LABEL: &str = "kdmp.portworx.com/dataexport-namespace";

/// Annotation carrying the full DataExport name; the label value may be
/// truncated
pub const EXPORT_NAME_ANNOTATION: &str = "kdmp.portworx.com/dataexport-name";

/// Annotation carrying the DataExport namespace
pub const EXPORT_NAMESPACE_ANNOTATION: &str = "kdmp.portworx.com/dataexport-namespace";

/// Label marking objects created and owned by KDMP
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "kdmp";

/// Resolve the namespace the operator is running in
pub fn operator_namespace() -> String {
    std::env::var("POD_NAMESPACE").unwrap_or_else(|_| DEFAULT_OPERATOR_NAMESPACE.to_string())
}
