//! restic backups and restores
//!
//! restic runs with `--json`, writing one record per stdout line. `status`
//! records carry progress; the final `summary` record of a backup carries
//! the totals and the snapshot id. A backup without a summary failed, even
//! when restic exits 0.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use kdmp_common::crd::VolumeBackupStatus;

use crate::cli::{BackupArgs, RestoreArgs};
use crate::credentials::{Credentials, StoreType};
use crate::process::{self, EngineCommand, ProcessOutput, Stream};
use crate::progress::{OutputParser, ProgressReporter};
use crate::repository::{self, Repository};
use crate::source;
use crate::status::StatusSink;
use crate::ExecutorError;

const RESTIC: &str = "restic";

/// Host recorded on every snapshot, so snapshots do not depend on pod names
const SNAPSHOT_HOST: &str = "kdmp";

/// Messages restic prints when no repository exists at the URL
const MISSING_REPOSITORY: &[&str] = &[
    "is there a repository at the following location",
    "does not exist",
    "unable to open config file",
];

/// Repository URL for `repository` in the location described by `creds`
pub fn repository_url(creds: &Credentials, repository: &str) -> String {
    let prefix = creds.prefix(repository);
    match creds.store {
        StoreType::S3 => format!("s3:{}/{}/{}", creds.s3_endpoint(), creds.bucket, prefix),
        StoreType::Azure => format!("azure:{}:/{}", creds.bucket, prefix),
        StoreType::Google => format!("gs:{}:/{}", creds.bucket, prefix),
    }
}

pub struct ResticRepository {
    url: String,
    env: Vec<(String, String)>,
}

impl ResticRepository {
    pub fn new(creds: &Credentials, repository: &str) -> Self {
        let url = repository_url(creds, repository);
        let mut env = creds.store_env();
        env.push(("RESTIC_REPOSITORY".to_string(), url.clone()));
        env.push(("RESTIC_PASSWORD".to_string(), creds.password.clone()));
        Self { url, env }
    }

    /// A restic invocation against this repository
    pub fn command(&self) -> EngineCommand {
        EngineCommand::new(RESTIC).envs(self.env.clone())
    }
}

#[async_trait]
impl Repository for ResticRepository {
    fn describe(&self) -> String {
        self.url.clone()
    }

    async fn probe(&self) -> Result<bool, ExecutorError> {
        let output = process::run(&self.command().args(["cat", "config"])).await?;
        if output.success {
            return Ok(true);
        }
        let stderr = output.stderr_summary().to_lowercase();
        if MISSING_REPOSITORY.iter().any(|m| stderr.contains(m)) {
            return Ok(false);
        }
        Err(ExecutorError::engine(RESTIC, output.stderr_summary()))
    }

    async fn init(&self) -> Result<(), ExecutorError> {
        let output = process::run(&self.command().arg("init")).await?;
        if output.success {
            Ok(())
        } else {
            Err(ExecutorError::engine(RESTIC, output.stderr_summary()))
        }
    }

    /// restic opens the repository on every invocation
    async fn connect(&self) -> Result<(), ExecutorError> {
        Ok(())
    }
}

// =============================================================================
// Output parsing
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "message_type", rename_all = "snake_case")]
enum Message {
    Status(StatusRecord),
    Summary(SummaryRecord),
    Error(ErrorRecord),
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct StatusRecord {
    /// 0.0 to 1.0
    #[serde(default)]
    percent_done: f64,
    #[serde(default)]
    total_bytes: u64,
    #[serde(default)]
    bytes_done: u64,
}

#[derive(Debug, Deserialize)]
struct SummaryRecord {
    #[serde(default)]
    total_bytes_processed: u64,
    #[serde(default)]
    snapshot_id: String,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ErrorRecord {
    #[serde(default)]
    error: ErrorBody,
    #[serde(default)]
    item: String,
}

/// Folds restic JSON records into a VolumeBackup status
#[derive(Debug, Default)]
pub struct ResticParser {
    status: VolumeBackupStatus,
    summary_seen: bool,
}

impl OutputParser for ResticParser {
    fn observe(&mut self, stream: Stream, line: &str) {
        if stream == Stream::Stderr {
            return;
        }
        let Ok(message) = serde_json::from_str::<Message>(line) else {
            return;
        };
        match message {
            Message::Status(s) => {
                self.status.progress_percentage =
                    (s.percent_done * 100.0).clamp(0.0, 100.0);
                self.status.total_bytes = s.total_bytes;
                self.status.total_bytes_processed = s.bytes_done;
            }
            Message::Summary(s) => {
                self.summary_seen = true;
                self.status.progress_percentage = 100.0;
                if s.total_bytes_processed > 0 {
                    self.status.total_bytes = s.total_bytes_processed;
                    self.status.total_bytes_processed = s.total_bytes_processed;
                }
                if !s.snapshot_id.is_empty() {
                    self.status.snapshot_id = s.snapshot_id;
                }
            }
            Message::Error(e) => {
                self.status.last_known_error = if e.item.is_empty() {
                    e.error.message
                } else {
                    format!("{}: {}", e.item, e.error.message)
                };
            }
            Message::Other => {}
        }
    }

    fn status(&self) -> VolumeBackupStatus {
        self.status.clone()
    }
}

impl ResticParser {
    /// Outcome of a backup: the summary decides, not the exit code
    pub fn finish_backup(&self, output: &ProcessOutput) -> Result<VolumeBackupStatus, ExecutorError> {
        if !self.summary_seen || self.status.snapshot_id.is_empty() {
            return Err(ExecutorError::engine(
                RESTIC,
                format!(
                    "backup did not report a snapshot: {}",
                    output.failure_detail()
                ),
            ));
        }
        if !output.success {
            warn!(code = ?output.code, "restic reported a snapshot but exited non-zero");
        }
        Ok(self.status.clone())
    }

    pub fn finish_restore(&self, output: &ProcessOutput) -> Result<VolumeBackupStatus, ExecutorError> {
        if !output.success {
            return Err(ExecutorError::engine(
                RESTIC,
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

pub async fn backup(
    args: &BackupArgs,
    sink: Arc<dyn StatusSink>,
) -> Result<VolumeBackupStatus, ExecutorError> {
    let creds = Credentials::load(&args.repo.secret_file_path)?;
    let repo = ResticRepository::new(&creds, &args.repo.repository);
    let mut reporter = ProgressReporter::new(sink);
    let mut parser = ResticParser::default();

    let result = async {
        repository::ensure(&repo).await?;
        let source = source::resolve(&args.source_path)?;
        info!(repository = %repo.describe(), source = %source.display(), "starting restic backup");
        let cmd = repo
            .command()
            .args(["backup", "--json", "--host", SNAPSHOT_HOST, "--tag"])
            .arg(&args.volume_backup_name)
            .arg(".")
            .current_dir(source);
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
    let creds = Credentials::load(&args.repo.secret_file_path)?;
    let repo = ResticRepository::new(&creds, &args.repo.repository);
    let mut reporter = ProgressReporter::new(sink);
    let mut parser = ResticParser::default();

    let result = async {
        repository::ensure(&repo).await?;
        info!(repository = %repo.describe(), snapshot = %args.snapshot_id, "starting restic restore");
        let cmd = repo
            .command()
            .args(["restore", "--json", args.snapshot_id.as_str(), "--target"])
            .arg(args.target_path.display().to_string());
        let output = reporter.run_reported(&cmd, &mut parser).await?;
        parser.finish_restore(&output)
    }
    .await;

    let last = parser.status();
    reporter.finish(last, result).await
}
