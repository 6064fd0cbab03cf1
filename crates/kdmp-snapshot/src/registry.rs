//! Snapshot backend selection

use std::sync::Arc;

use crate::csi::CsiSnapshotDriver;
use crate::external_storage::ExternalStorageSnapshotDriver;
use crate::kube_client::SnapshotKubeClient;
use crate::SnapshotDriver;

/// Snapshot storage class that selects the external-storage backend
pub const STORK_SNAPSHOT_CLASS: &str = "stork-snapshot";

/// Both backends, built once at startup
#[derive(Clone)]
pub struct SnapshotRegistry {
    csi: Arc<dyn SnapshotDriver>,
    external: Arc<dyn SnapshotDriver>,
}

impl SnapshotRegistry {
    pub fn new(kube: Arc<dyn SnapshotKubeClient>) -> Self {
        Self {
            csi: Arc::new(CsiSnapshotDriver::new(kube.clone())),
            external: Arc::new(ExternalStorageSnapshotDriver::new(kube)),
        }
    }

    /// Registry over caller-supplied backends
    pub fn with_drivers(csi: Arc<dyn SnapshotDriver>, external: Arc<dyn SnapshotDriver>) -> Self {
        Self { csi, external }
    }

    /// `stork-snapshot` picks external-storage; any other class names a
    /// VolumeSnapshotClass
    pub fn for_class(&self, class: &str) -> Arc<dyn SnapshotDriver> {
        if class == STORK_SNAPSHOT_CLASS {
            self.external.clone()
        } else {
            self.csi.clone()
        }
    }
}
