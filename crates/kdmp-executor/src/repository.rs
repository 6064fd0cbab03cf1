//! Repository bootstrap shared by the engines
//!
//! Probe for the repository, initialize it when absent, then connect. Two
//! workers may race to initialize the same repository; the loser sees an
//! "already exists" error and carries on.

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::ExecutorError;

/// Engine messages meaning another worker initialized the repository first
const ALREADY_INITIALIZED: &[&str] = &[
    "already initialized",
    "already exists",
    "found existing data in storage location",
];

#[cfg_attr(test, automock)]
#[async_trait]
pub trait Repository: Send + Sync {
    /// Display name for logs
    fn describe(&self) -> String;

    /// Whether the repository exists
    async fn probe(&self) -> Result<bool, ExecutorError>;

    async fn init(&self) -> Result<(), ExecutorError>;

    async fn connect(&self) -> Result<(), ExecutorError>;
}

pub fn is_already_initialized(message: &str) -> bool {
    let message = message.to_lowercase();
    ALREADY_INITIALIZED.iter().any(|m| message.contains(m))
}

/// Make `repo` usable, creating it when it does not exist yet
pub async fn ensure(repo: &dyn Repository) -> Result<(), ExecutorError> {
    if !repo.probe().await? {
        info!(repository = %repo.describe(), "initializing repository");
        match repo.init().await {
            Ok(()) => {}
            Err(ExecutorError::Engine { message, .. }) if is_already_initialized(&message) => {
                info!(repository = %repo.describe(), "repository was initialized concurrently");
            }
            Err(e) => return Err(e),
        }
    }
    repo.connect().await
}
