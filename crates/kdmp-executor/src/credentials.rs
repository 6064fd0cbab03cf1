//! Backup location credentials read from the mounted secret
//!
//! Each secret key is a file under the mount directory. `type`, `path` and
//! `password` are required; the rest depend on the object store.

use std::path::{Path, PathBuf};

use kdmp_common::credentials::*;

use crate::ExecutorError;

/// Prefix every repository lives under inside the bucket
pub const REPOSITORY_PREFIX: &str = "generic-backup";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreType {
    S3,
    Azure,
    Google,
}

impl StoreType {
    fn parse(value: &str) -> Result<Self, ExecutorError> {
        match value {
            "s3" => Ok(Self::S3),
            "azure" => Ok(Self::Azure),
            "google" => Ok(Self::Google),
            other => Err(ExecutorError::credentials(format!(
                "unsupported backup location type {:?}",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Credentials {
    pub store: StoreType,
    /// Bucket or container name
    pub bucket: String,
    pub password: String,
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub disable_ssl: bool,
    pub storage_account_name: String,
    pub storage_account_key: String,
    pub project_id: String,
    /// File holding the Google service account key
    pub account_key_file: PathBuf,
}

impl Credentials {
    pub fn load(dir: &Path) -> Result<Self, ExecutorError> {
        let store = StoreType::parse(&required(dir, KEY_TYPE)?)?;
        let creds = Self {
            store,
            bucket: required(dir, KEY_PATH)?,
            password: required(dir, KEY_PASSWORD)?,
            endpoint: optional(dir, KEY_ENDPOINT)?,
            access_key: optional(dir, KEY_ACCESS_KEY)?,
            secret_key: optional(dir, KEY_SECRET_KEY)?,
            region: optional(dir, KEY_REGION)?,
            disable_ssl: optional(dir, KEY_DISABLE_SSL)? == "true",
            storage_account_name: optional(dir, KEY_STORAGE_ACCOUNT_NAME)?,
            storage_account_key: optional(dir, KEY_STORAGE_ACCOUNT_KEY)?,
            project_id: optional(dir, KEY_PROJECT_ID)?,
            account_key_file: dir.join(KEY_ACCOUNT_KEY),
        };
        creds.check()?;
        Ok(creds)
    }

    fn check(&self) -> Result<(), ExecutorError> {
        let missing = match self.store {
            StoreType::S3 if self.access_key.is_empty() => Some(KEY_ACCESS_KEY),
            StoreType::S3 if self.secret_key.is_empty() => Some(KEY_SECRET_KEY),
            StoreType::Azure if self.storage_account_name.is_empty() => {
                Some(KEY_STORAGE_ACCOUNT_NAME)
            }
            StoreType::Azure if self.storage_account_key.is_empty() => {
                Some(KEY_STORAGE_ACCOUNT_KEY)
            }
            StoreType::Google if self.project_id.is_empty() => Some(KEY_PROJECT_ID),
            _ => None,
        };
        match missing {
            Some(key) => Err(ExecutorError::credentials(format!("{} is empty", key))),
            None => Ok(()),
        }
    }

    /// `generic-backup/<repository>` inside the bucket
    pub fn prefix(&self, repository: &str) -> String {
        format!("{}/{}", REPOSITORY_PREFIX, repository)
    }

    /// S3 endpoint with its scheme, defaulting to AWS
    pub fn s3_endpoint(&self) -> String {
        let host = if self.endpoint.is_empty() {
            "s3.amazonaws.com"
        } else {
            self.endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
        };
        let scheme = if self.disable_ssl { "http" } else { "https" };
        format!("{}://{}", scheme, host)
    }

    /// Object store environment shared by restic and kopia
    pub fn store_env(&self) -> Vec<(String, String)> {
        let pairs: Vec<(&str, String)> = match self.store {
            StoreType::S3 => vec![
                ("AWS_ACCESS_KEY_ID", self.access_key.clone()),
                ("AWS_SECRET_ACCESS_KEY", self.secret_key.clone()),
                ("AWS_DEFAULT_REGION", self.region.clone()),
            ],
            StoreType::Azure => vec![
                ("AZURE_ACCOUNT_NAME", self.storage_account_name.clone()),
                ("AZURE_ACCOUNT_KEY", self.storage_account_key.clone()),
            ],
            StoreType::Google => vec![
                ("GOOGLE_PROJECT_ID", self.project_id.clone()),
                (
                    "GOOGLE_APPLICATION_CREDENTIALS",
                    self.account_key_file.display().to_string(),
                ),
            ],
        };
        pairs
            .into_iter()
            .filter(|(_, v)| !v.is_empty())
            .map(|(k, v)| (k.to_string(), v))
            .collect()
    }
}

fn read(dir: &Path, key: &str) -> Result<Option<String>, ExecutorError> {
    let path = dir.join(key);
    match std::fs::read_to_string(&path) {
        Ok(value) => Ok(Some(value.trim().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(ExecutorError::io(path, e)),
    }
}

fn required(dir: &Path, key: &str) -> Result<String, ExecutorError> {
    read(dir, key)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            ExecutorError::credentials(format!("{} is missing from {}", key, dir.display()))
        })
}

fn optional(dir: &Path, key: &str) -> Result<String, ExecutorError> {
    Ok(read(dir, key)?.unwrap_or_default())
}
