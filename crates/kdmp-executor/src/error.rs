//! Executor error types

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A credentials file could not be read or holds an unusable value
    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// The engine ran and reported a failure
    #[error("{engine} failed: {message}")]
    Engine { engine: String, message: String },

    /// The source path could not be resolved to a single directory
    #[error("source path {path}: {message}")]
    Source { path: String, message: String },
}

impl ExecutorError {
    pub fn credentials(msg: impl Into<String>) -> Self {
        Self::Credentials(msg.into())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn engine(engine: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Engine {
            engine: engine.into(),
            message: msg.into(),
        }
    }

    pub fn source_path(path: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Source {
            path: path.into(),
            message: msg.into(),
        }
    }

    /// Whether retrying the same call may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Kube(e) => kdmp_common::error::is_transient_kube_error(e),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_errors_name_the_engine() {
        let err = ExecutorError::engine("restic", "repository is locked");
        assert_eq!(err.to_string(), "restic failed: repository is locked");
        assert!(!err.is_retryable());
    }

    #[test]
    fn conflicts_are_retryable() {
        let err = ExecutorError::Kube(kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        }));
        assert!(err.is_retryable());
    }
}
