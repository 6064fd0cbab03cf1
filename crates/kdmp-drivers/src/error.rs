//! Driver error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Common(#[from] kdmp_common::Error),

    /// The per-driver job limit is reached; try again later
    #[error("waiting for a free {driver} job slot ({active}/{limit} active)")]
    RateLimited {
        driver: String,
        active: usize,
        limit: usize,
    },

    #[error("invalid options for {driver}: {message}")]
    InvalidOptions { driver: String, message: String },

    #[error("invalid job id {0:?}, expected namespace/name")]
    InvalidJobId(String),

    #[error("backup location {location}: {message}")]
    BackupLocation { location: String, message: String },

    #[error("no driver registered for {0}")]
    NotRegistered(String),
}

impl DriverError {
    pub fn invalid_options(driver: impl std::fmt::Display, msg: impl Into<String>) -> Self {
        Self::InvalidOptions {
            driver: driver.to_string(),
            message: msg.into(),
        }
    }

    pub fn backup_location(location: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::BackupLocation {
            location: location.into(),
            message: msg.into(),
        }
    }

    /// Whether the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => kdmp_common::error::is_transient_kube_error(e),
            Self::Common(e) => e.is_retryable(),
            Self::RateLimited { .. } => true,
            Self::InvalidOptions { .. } => false,
            Self::InvalidJobId(_) => false,
            Self::BackupLocation { .. } => false,
            Self::NotRegistered(_) => false,
        }
    }
}
