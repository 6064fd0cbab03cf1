//! Volume snapshot drivers
//!
//! Two backends sit behind [`SnapshotDriver`]: CSI snapshots
//! (`snapshot.storage.k8s.io/v1`) and the legacy external-storage snapshots
//! (`volumesnapshot.external-storage.k8s.io/v1`). The DataExport's snapshot
//! storage class picks one through [`SnapshotRegistry::for_class`].

pub mod csi;
pub mod driver;
pub mod error;
pub mod external_storage;
pub mod kube_client;
pub mod registry;

pub use driver::{
    RestoreRequest, SnapshotDriver, SnapshotInfo, SnapshotRef, SnapshotRequest, SnapshotState,
};
pub use error::SnapshotError;
pub use registry::{SnapshotRegistry, STORK_SNAPSHOT_CLASS};
