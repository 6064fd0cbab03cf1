//! Layout of the job-scoped credentials secret
//!
//! Drivers write a BackupLocation into a Secret with these keys and mount it
//! read-only at [`CREDENTIALS_MOUNT_PATH`]; the executor reads each key back
//! as a file.

/// Where the credentials secret is mounted inside worker pods
pub const CREDENTIALS_MOUNT_PATH: &str = "/etc/cred-secret";

pub const KEY_TYPE: &str = "type";
pub const KEY_PATH: &str = "path";
pub const KEY_PASSWORD: &str = "password";
pub const KEY_ENDPOINT: &str = "endpoint";
pub const KEY_ACCESS_KEY: &str = "accessKey";
pub const KEY_SECRET_KEY: &str = "secretKey";
pub const KEY_REGION: &str = "region";
pub const KEY_DISABLE_SSL: &str = "disableSsl";
pub const KEY_STORAGE_ACCOUNT_NAME: &str = "storageAccountName";
pub const KEY_STORAGE_ACCOUNT_KEY: &str = "storageAccountKey";
pub const KEY_PROJECT_ID: &str = "projectId";
pub const KEY_ACCOUNT_KEY: &str = "accountKey";

/// Password used when a BackupLocation carries none
pub const DEFAULT_REPOSITORY_PASSWORD: &str = "kdmp-repository";
