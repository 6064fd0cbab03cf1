//! Error types shared by the KDMP crates
//!
//! Variants carry the resource they concern so log lines and DataExport
//! reasons point at the object that needs attention.

use thiserror::Error;

/// Default context value when no specific resource is known
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Result alias for [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Main error type for shared KDMP operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// A referenced object failed validation
    #[error("validation error for {resource}: {message}")]
    Validation {
        /// `namespace/name` of the offending object
        resource: String,
        message: String,
    },

    /// A `kdmp-config` key held a value that could not be used
    #[error("invalid configuration {key}: {message}")]
    Config { key: String, message: String },

    /// A Kubernetes quantity string could not be parsed
    #[error("invalid quantity {value:?}: {message}")]
    Quantity { value: String, message: String },

    /// Serialization/deserialization error
    #[error("serialization error for {kind}: {message}")]
    Serialization { kind: String, message: String },

    #[error("internal error [{context}]: {message}")]
    Internal { context: String, message: String },
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    pub fn validation_for(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    pub fn config(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: msg.into(),
        }
    }

    pub fn quantity(value: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Quantity {
            value: value.into(),
            message: msg.into(),
        }
    }

    pub fn serialization(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            context: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => is_transient_kube_error(source),
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Quantity { .. } => false,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }
}

/// Classify a kube error as transient.
///
/// Connection failures, timeouts, 5xx responses, 409 conflicts and 429
/// throttling are transient. Every other 4xx needs a change in the world.
pub fn is_transient_kube_error(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(ae) => {
            ae.code == 409 || ae.code == 429 || !(400..500).contains(&ae.code)
        }
        _ => true,
    }
}
