//! Volume to volume copies
//!
//! rsync jobs have no VolumeBackup; the controller reads their outcome from
//! the job itself. Progress only goes to the log.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{info, warn};

use crate::cli::RsyncArgs;
use crate::process::{self, EngineCommand, Stream};
use crate::ExecutorError;

const RSYNC: &str = "rsync";

/// Percent steps between progress log lines
const LOG_STEP: u32 = 10;

/// `--info=progress2` line: `  1,234,567  45%  10.20MB/s  0:00:12`
static PROGRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^\s*([\d,]+)\s+(\d+)%").unwrap_or_else(|e| panic!("invalid progress pattern: {e}"))
});

/// Copy the contents of the source directory, not the directory itself
fn contents_of(path: &Path) -> String {
    let path = path.display().to_string();
    if path.ends_with('/') {
        path
    } else {
        format!("{}/", path)
    }
}

pub fn command(args: &RsyncArgs) -> EngineCommand {
    EngineCommand::new(RSYNC)
        .args(args.flags())
        .args(["--info=progress2", "--no-inc-recursive"])
        .arg(contents_of(&args.source_path))
        .arg(contents_of(&args.destination_path))
}

/// Bytes copied and percent complete from a progress line
fn parse_progress(line: &str) -> Option<(u64, u32)> {
    let caps = PROGRESS.captures(line)?;
    let bytes = caps.get(1)?.as_str().replace(',', "").parse().ok()?;
    let percent = caps.get(2)?.as_str().parse().ok()?;
    Some((bytes, percent))
}

pub async fn run(args: &RsyncArgs) -> Result<(), ExecutorError> {
    let cmd = command(args);
    info!(command = %cmd.describe(), "starting rsync");

    let mut logged = 0;
    let output = process::stream(&cmd, |stream, line| match stream {
        Stream::Stdout => {
            if let Some((bytes, percent)) = parse_progress(line) {
                if percent >= logged + LOG_STEP || (percent == 100 && logged < 100) {
                    logged = percent;
                    info!(bytes, percent, "rsync progress");
                }
            }
        }
        Stream::Stderr => warn!(line, "rsync"),
    })
    .await?;

    if !output.success {
        return Err(ExecutorError::engine(RSYNC, output.failure_detail()));
    }
    info!("rsync completed");
    Ok(())
}
