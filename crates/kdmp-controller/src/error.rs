//! Controller error types and their mapping to DataExport reasons

use kdmp_drivers::DriverError;
use kdmp_snapshot::SnapshotError;

/// Category of a failure recorded on a DataExport
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReasonKind {
    /// The request or a referenced object is invalid
    Validation,
    Snapshot,
    /// The worker job or its supporting objects could not be created
    JobProvisioning,
    /// The worker job ran and failed
    JobFailed,
    /// The engine reported an error
    Engine,
    Transient,
}

impl ReasonKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::Snapshot => "SnapshotError",
            Self::JobProvisioning => "JobProvisioningError",
            Self::JobFailed => "JobFailedError",
            Self::Engine => "EngineError",
            Self::Transient => "TransientError",
        }
    }
}

impl std::fmt::Display for ReasonKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Common(#[from] kdmp_common::Error),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    /// The request or a referenced object cannot be used as is
    #[error("{0}")]
    Validation(String),

    /// A referenced object is not usable yet
    #[error("{0}")]
    Waiting(String),

    #[error("missing namespace on DataExport")]
    MissingNamespace,
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn waiting(msg: impl Into<String>) -> Self {
        Self::Waiting(msg.into())
    }

    /// Whether the next reconcile may succeed without a spec change
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => kdmp_common::error::is_transient_kube_error(e),
            Self::Common(e) => e.is_retryable(),
            Self::Driver(e) => e.is_retryable(),
            Self::Snapshot(e) => e.is_retryable(),
            Self::Validation(_) => false,
            Self::Waiting(_) => true,
            Self::MissingNamespace => false,
        }
    }

    /// Reason kind recorded when this error ends a stage
    pub fn reason_kind(&self) -> ReasonKind {
        if self.is_retryable() {
            return ReasonKind::Transient;
        }
        match self {
            Self::Validation(_) | Self::MissingNamespace => ReasonKind::Validation,
            Self::Common(kdmp_common::Error::Validation { .. }) => ReasonKind::Validation,
            Self::Snapshot(_) => ReasonKind::Snapshot,
            Self::Driver(DriverError::InvalidOptions { .. }) => ReasonKind::Validation,
            Self::Driver(_) => ReasonKind::JobProvisioning,
            Self::Kube(_) | Self::Common(_) | Self::Waiting(_) => ReasonKind::JobProvisioning,
        }
    }
}
