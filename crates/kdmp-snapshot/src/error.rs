//! Snapshot error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// The requested VolumeSnapshotClass does not exist
    #[error("volume snapshot class {0} not found")]
    ClassNotFound(String),

    /// The snapshot exists but cannot be used yet
    #[error("snapshot {name} is not ready: {message}")]
    NotReady { name: String, message: String },

    #[error("malformed {kind} {name}: {message}")]
    Malformed {
        kind: String,
        name: String,
        message: String,
    },
}

impl SnapshotError {
    pub fn not_ready(name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::NotReady {
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn malformed(kind: &str, name: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Malformed {
            kind: kind.to_string(),
            name: name.into(),
            message: msg.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => kdmp_common::error::is_transient_kube_error(e),
            Self::NotReady { .. } => true,
            Self::ClassNotFound(_) | Self::Malformed { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_class_is_permanent() {
        let err = SnapshotError::ClassNotFound("csi-default".to_string());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "volume snapshot class csi-default not found");
    }

    #[test]
    fn unbound_snapshot_is_retried() {
        assert!(SnapshotError::not_ready("snap-a", "no content bound").is_retryable());
    }
}
