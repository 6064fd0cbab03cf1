//! kopia backups, restores and repository lifecycle
//!
//! `kopia snapshot create --json` prints one manifest on stdout when it
//! finishes; progress lines go to stderr. A manifest without an id, or with
//! fatal errors, is a failed backup whatever the exit code says.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use tracing::info;

use kdmp_common::crd::VolumeBackupStatus;

use crate::cli::{BackupArgs, DeleteArgs, RepositoryArgs, RestoreArgs};
use crate::credentials::{Credentials, StoreType};
use crate::process::{self, EngineCommand, ProcessOutput, Stream};
use crate::progress::{OutputParser, ProgressReporter};
use crate::repository::{self, Repository};
use crate::source;
use crate::status::StatusSink;
use crate::ExecutorError;

const KOPIA: &str = "kopia";

/// Writable scratch space for kopia's config, cache and logs
const KOPIA_WORK_DIR: &str = "/tmp/kdmp-kopia";

/// Messages kopia prints when no repository exists at the location
const MISSING_REPOSITORY: &[&str] = &["repository not initialized", "blob not found"];

/// Messages meaning a snapshot to delete is already gone
const SNAPSHOT_GONE: &[&str] = &["not found", "unable to find"];

/// `(48.2%)` in a progress line
static PERCENT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\((\d+(?:\.\d+)?)%\)").unwrap_or_else(|e| panic!("invalid percent pattern: {e}"))
});

/// Storage flags for `kopia repository create|connect`
pub fn storage_args(creds: &Credentials, repository: &str) -> Vec<String> {
    let prefix = format!("{}/", creds.prefix(repository));
    let mut args: Vec<String> = match creds.store {
        StoreType::S3 => {
            let endpoint = creds.s3_endpoint();
            let host = endpoint
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .to_string();
            let mut args = vec![
                "s3".to_string(),
                format!("--bucket={}", creds.bucket),
                format!("--prefix={}", prefix),
                format!("--endpoint={}", host),
                format!("--access-key={}", creds.access_key),
                format!("--secret-access-key={}", creds.secret_key),
            ];
            if !creds.region.is_empty() {
                args.push(format!("--region={}", creds.region));
            }
            if creds.disable_ssl {
                args.push("--disable-tls".to_string());
            }
            args
        }
        StoreType::Azure => vec![
            "azure".to_string(),
            format!("--container={}", creds.bucket),
            format!("--prefix={}", prefix),
            format!("--storage-account={}", creds.storage_account_name),
            format!("--storage-key={}", creds.storage_account_key),
        ],
        StoreType::Google => vec![
            "gcs".to_string(),
            format!("--bucket={}", creds.bucket),
            format!("--prefix={}", prefix),
            format!("--credentials-file={}", creds.account_key_file.display()),
        ],
    };
    args.push("--no-check-for-updates".to_string());
    args
}

pub struct KopiaRepository {
    location: String,
    storage: Vec<String>,
    env: Vec<(String, String)>,
    connected: AtomicBool,
}

impl KopiaRepository {
    pub fn new(creds: &Credentials, repository: &str) -> Self {
        let mut env = creds.store_env();
        env.extend([
            ("KOPIA_PASSWORD".to_string(), creds.password.clone()),
            (
                "KOPIA_CONFIG_PATH".to_string(),
                format!("{}/repository.config", KOPIA_WORK_DIR),
            ),
            (
                "KOPIA_CACHE_DIRECTORY".to_string(),
                format!("{}/cache", KOPIA_WORK_DIR),
            ),
            ("KOPIA_LOG_DIR".to_string(), format!("{}/logs", KOPIA_WORK_DIR)),
            ("KOPIA_CHECK_FOR_UPDATES".to_string(), "false".to_string()),
        ]);
        Self {
            location: format!("{}/{}", creds.bucket, creds.prefix(repository)),
            storage: storage_args(creds, repository),
            env,
            connected: AtomicBool::new(false),
        }
    }

    pub fn command(&self) -> EngineCommand {
        EngineCommand::new(KOPIA).envs(self.env.clone())
    }

    fn repository_command(&self, verb: &str) -> EngineCommand {
        self.command()
            .args(["repository", verb])
            .args(self.storage.iter().cloned())
    }
}

#[async_trait]
impl Repository for KopiaRepository {
    fn describe(&self) -> String {
        self.location.clone()
    }

    /// Connecting is the only way to find out whether the repository exists
    async fn probe(&self) -> Result<bool, ExecutorError> {
        let output = process::run(&self.repository_command("connect")).await?;
        if output.success {
            self.connected.store(true, Ordering::SeqCst);
            return Ok(true);
        }
        let stderr = output.stderr_summary().to_lowercase();
        if MISSING_REPOSITORY.iter().any(|m| stderr.contains(m)) {
            return Ok(false);
        }
        Err(ExecutorError::engine(KOPIA, output.stderr_summary()))
    }

    async fn init(&self) -> Result<(), ExecutorError> {
        let output = process::run(&self.repository_command("create")).await?;
        if output.success {
            // create leaves the repository connected
            self.connected.store(true, Ordering::SeqCst);
            Ok(())
        } else {
            Err(ExecutorError::engine(KOPIA, output.stderr_summary()))
        }
    }

    async fn connect(&self) -> Result<(), ExecutorError> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let output = process::run(&self.repository_command("connect")).await?;
        if !output.success {
            return Err(ExecutorError::engine(KOPIA, output.stderr_summary()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Output parsing
// =============================================================================

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Stats {
    #[serde(default)]
    total_size: u64,
    #[serde(default)]
    error_count: u64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DirSummary {
    #[serde(default)]
    num_failed: u64,
}

#[derive(Debug, Default, Deserialize)]
struct RootEntry {
    #[serde(default)]
    summ: Option<DirSummary>,
}

/// The manifest `kopia snapshot create --json` prints
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Manifest {
    #[serde(default)]
    id: String,
    #[serde(default)]
    stats: Stats,
    #[serde(default)]
    root_entry: Option<RootEntry>,
}

impl Manifest {
    fn fatal_errors(&self) -> u64 {
        let failed = self
            .root_entry
            .as_ref()
            .and_then(|r| r.summ.as_ref())
            .map(|s| s.num_failed)
            .unwrap_or_default();
        self.stats.error_count.max(failed)
    }

    /// The manifest is the last JSON object on stdout
    fn from_stdout(stdout: &str) -> Option<Self> {
        if let Ok(manifest) = serde_json::from_str(stdout.trim()) {
            return Some(manifest);
        }
        stdout
            .lines()
            .rev()
            .filter(|l| l.trim_start().starts_with('{'))
            .find_map(|l| serde_json::from_str(l).ok())
    }
}

/// Progress percentages from stderr plus the manifest at exit
#[derive(Debug, Default)]
pub struct KopiaParser {
    status: VolumeBackupStatus,
}

impl OutputParser for KopiaParser {
    fn observe(&mut self, stream: Stream, line: &str) {
        if stream != Stream::Stderr {
            return;
        }
        let line = line.trim();
        if line.starts_with("ERROR") {
            self.status.last_known_error = line.trim_start_matches("ERROR").trim().to_string();
            return;
        }
        if let Some(percent) = PERCENT
            .captures(line)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
        {
            // estimates can briefly shrink; never report backwards
            self.status.progress_percentage =
                self.status.progress_percentage.max(percent.clamp(0.0, 100.0));
        }
    }

    fn status(&self) -> VolumeBackupStatus {
        self.status.clone()
    }
}

impl KopiaParser {
    pub fn finish_backup(&self, output: &ProcessOutput) -> Result<VolumeBackupStatus, ExecutorError> {
        let Some(manifest) = Manifest::from_stdout(&output.stdout) else {
            return Err(ExecutorError::engine(
                KOPIA,
                format!("backup printed no snapshot manifest: {}", output.failure_detail()),
            ));
        };
        let fatal = manifest.fatal_errors();
        if fatal > 0 {
            return Err(ExecutorError::engine(
                KOPIA,
                format!("snapshot {} finished with {} fatal errors", manifest.id, fatal),
            ));
        }
        if manifest.id.is_empty() {
            return Err(ExecutorError::engine(KOPIA, "snapshot manifest has no id"));
        }
        Ok(VolumeBackupStatus {
            progress_percentage: 100.0,
            total_bytes: manifest.stats.total_size,
            total_bytes_processed: manifest.stats.total_size,
            snapshot_id: manifest.id,
            last_known_error: self.status.last_known_error.clone(),
        })
    }

    pub fn finish_restore(&self, output: &ProcessOutput) -> Result<VolumeBackupStatus, ExecutorError> {
        if !output.success {
            return Err(ExecutorError::engine(
                KOPIA,
                format!("restore failed: {}", output.failure_detail()),
            ));
        }
        Ok(VolumeBackupStatus {
            progress_percentage: 100.0,
            ..self.status.clone()
        })
    }
}

// =============================================================================
// Operations
// =============================================================================

async fn open(args: &RepositoryArgs) -> Result<KopiaRepository, ExecutorError> {
    let creds = Credentials::load(&args.secret_file_path)?;
    let repo = KopiaRepository::new(&creds, &args.repository);
    repository::ensure(&repo).await?;
    Ok(repo)
}

pub async fn backup(
    args: &BackupArgs,
    sink: Arc<dyn StatusSink>,
) -> Result<VolumeBackupStatus, ExecutorError> {
    let mut reporter = ProgressReporter::new(sink);
    let mut parser = KopiaParser::default();

    let result = async {
        let repo = open(&args.repo).await?;
        let source = source::resolve(&args.source_path)?;
        info!(repository = %repo.describe(), source = %source.display(), "starting kopia backup");
        let cmd = repo
            .command()
            .args(["snapshot", "create"])
            .arg(source.display().to_string())
            .args(["--json", "--progress-update-interval=5s"])
            .arg(format!("--description={}", args.volume_backup_name));
        let output = reporter.run_reported(&cmd, &mut parser).await?;
        parser.finish_backup(&output)
    }
    .await;

    let last = parser.status();
    reporter.finish(last, result).await
}

pub async fn restore(
    args: &RestoreArgs,
    sink: Arc<dyn StatusSink>,
) -> Result<VolumeBackupStatus, ExecutorError> {
    let mut reporter = ProgressReporter::new(sink);
    let mut parser = KopiaParser::default();

    let result = async {
        let repo = open(&args.repo).await?;
        info!(repository = %repo.describe(), snapshot = %args.snapshot_id, "starting kopia restore");
        let cmd = repo
            .command()
            .args(["snapshot", "restore", args.snapshot_id.as_str()])
            .arg(args.target_path.display().to_string());
        let output = reporter.run_reported(&cmd, &mut parser).await?;
        parser.finish_restore(&output)
    }
    .await;

    let last = parser.status();
    reporter.finish(last, result).await
}

/// Remove one snapshot. A snapshot that is already gone counts as deleted.
pub async fn delete(args: &DeleteArgs) -> Result<(), ExecutorError> {
    let repo = open(&args.repo).await?;
    let cmd = repo
        .command()
        .args(["snapshot", "delete", args.snapshot_id.as_str(), "--delete"]);
    let output = process::run(&cmd).await?;
    if output.success {
        info!(snapshot = %args.snapshot_id, "snapshot deleted");
        return Ok(());
    }
    let stderr = output.stderr_summary();
    if SNAPSHOT_GONE
        .iter()
        .any(|m| stderr.to_lowercase().contains(m))
    {
        info!(snapshot = %args.snapshot_id, "snapshot already deleted");
        return Ok(());
    }
    Err(ExecutorError::engine(KOPIA, stderr))
}

/// Take maintenance ownership and run full maintenance
pub async fn maintenance(args: &RepositoryArgs) -> Result<(), ExecutorError> {
    let repo = open(args).await?;
    for step in [
        vec!["maintenance", "set", "--owner=me"],
        vec!["maintenance", "run", "--full", "--safety=full"],
    ] {
        let output = process::run(&repo.command().args(step)).await?;
        if !output.success {
            return Err(ExecutorError::engine(KOPIA, output.failure_detail()));
        }
    }
    info!(repository = %repo.describe(), "maintenance completed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(store: StoreType) -> Credentials {
        Credentials {
            store,
            bucket: "backups".to_string(),
            password: "pw".to_string(),
            endpoint: "https://minio:9000".to_string(),
            access_key: "a".to_string(),
            secret_key: "s".to_string(),
            region: "us-east-1".to_string(),
            disable_ssl: false,
            storage_account_name: "acct".to_string(),
            storage_account_key: "key".to_string(),
            project_id: "proj".to_string(),
            account_key_file: "/etc/cred-secret/accountKey".into(),
        }
    }

    fn output(success: bool, stdout: &str, stderr: &[&str]) -> ProcessOutput {
        ProcessOutput {
            success,
            code: Some(if success { 0 } else { 1 }),
            stdout: stdout.to_string(),
            stderr_tail: stderr.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn s3_storage_flags() {
        let args = storage_args(&creds(StoreType::S3), "apps-data");
        assert_eq!(args[0], "s3");
        assert!(args.contains(&"--bucket=backups".to_string()));
        assert!(args.contains(&"--prefix=generic-backup/apps-data/".to_string()));
        assert!(args.contains(&"--endpoint=minio:9000".to_string()));
        assert!(args.contains(&"--region=us-east-1".to_string()));
        assert!(!args.contains(&"--disable-tls".to_string()));
    }

    #[test]
    fn azure_and_gcs_storage_flags() {
        let azure = storage_args(&creds(StoreType::Azure), "apps-data");
        assert_eq!(azure[0], "azure");
        assert!(azure.contains(&"--container=backups".to_string()));
        assert!(azure.contains(&"--storage-account=acct".to_string()));

        let gcs = storage_args(&creds(StoreType::Google), "apps-data");
        assert_eq!(gcs[0], "gcs");
        assert!(gcs.contains(&"--credentials-file=/etc/cred-secret/accountKey".to_string()));
    }

    #[test]
    fn stderr_progress_only_moves_forward() {
        let mut parser = KopiaParser::default();
        parser.observe(
            Stream::Stderr,
            " | 1 hashing, 20 hashed (1.2 GB), 0 cached (0 B), uploaded 1.1 GB, estimated 2.5 GB (48.0%) 1m left",
        );
        assert_eq!(parser.status().progress_percentage, 48.0);
        parser.observe(Stream::Stderr, " / estimated 2.6 GB (46.1%) 1m left");
        assert_eq!(parser.status().progress_percentage, 48.0);
        parser.observe(Stream::Stdout, "(99%)");
        assert_eq!(parser.status().progress_percentage, 48.0);
    }

    #[test]
    fn error_lines_are_remembered() {
        let mut parser = KopiaParser::default();
        parser.observe(Stream::Stderr, "ERROR error reading /data/x: permission denied");
        assert_eq!(
            parser.status().last_known_error,
            "error reading /data/x: permission denied"
        );
    }

    #[test]
    fn manifest_completes_a_backup() {
        let parser = KopiaParser::default();
        let stdout = r#"{"id":"k3f9a","source":{"host":"kdmp","path":"/data"},"stats":{"totalSize":8192,"fileCount":4,"errorCount":0,"ignoredErrorCount":1},"rootEntry":{"name":"data","summ":{"size":8192,"numFailed":0}}}"#;
        let status = parser.finish_backup(&output(true, stdout, &[])).unwrap();
        assert_eq!(status.snapshot_id, "k3f9a");
        assert_eq!(status.total_bytes, 8192);
        assert_eq!(status.progress_percentage, 100.0);
    }

    #[test]
    fn fatal_errors_fail_despite_exit_zero() {
        let parser = KopiaParser::default();
        let stdout = r#"{"id":"k3f9a","stats":{"totalSize":8192,"errorCount":0},"rootEntry":{"summ":{"numFailed":2}}}"#;
        let err = parser.finish_backup(&output(true, stdout, &[])).unwrap_err();
        assert_eq!(
            err.to_string(),
            "kopia failed: snapshot k3f9a finished with 2 fatal errors"
        );
    }

    #[test]
    fn manifest_may_follow_other_output() {
        let parser = KopiaParser::default();
        let stdout = "Snapshotting kdmp@kdmp:/data ...\n{\"id\":\"k1\",\"stats\":{\"totalSize\":1}}";
        assert_eq!(
            parser.finish_backup(&output(true, stdout, &[])).unwrap().snapshot_id,
            "k1"
        );
    }

    #[test]
    fn missing_manifest_or_id_fails() {
        let parser = KopiaParser::default();
        let err = parser
            .finish_backup(&output(false, "", &["unable to open repository"]))
            .unwrap_err();
        assert!(err.to_string().contains("unable to open repository"));

        let err = parser
            .finish_backup(&output(true, r#"{"stats":{"totalSize":1}}"#, &[]))
            .unwrap_err();
        assert!(err.to_string().contains("has no id"));
    }

    #[test]
    fn config_stays_in_the_work_dir() {
        let repo = KopiaRepository::new(&creds(StoreType::S3), "apps-data");
        assert!(repo.env.contains(&(
            "KOPIA_CONFIG_PATH".to_string(),
            "/tmp/kdmp-kopia/repository.config".to_string()
        )));
        assert_eq!(repo.describe(), "backups/generic-backup/apps-data");
    }
}
