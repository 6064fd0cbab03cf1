//! Backup source resolution
//!
//! Live backups read a volume through the kubelet pods directory,
//! `/hostpods/<pod-uid>/volumes/*/<pv-name>`, where the `*` segment is the
//! volume plugin and unknown to the driver. CSI volumes keep their data one
//! level further down, under `mount/`.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::ExecutorError;

const WILDCARD: &str = "*";
const CSI_MOUNT_DIR: &str = "mount";

/// Turn the `--source-path` argument into the directory to back up
pub fn resolve(source: &str) -> Result<PathBuf, ExecutorError> {
    let path = expand_wildcard(source)?;
    if !path.is_dir() {
        return Err(ExecutorError::source_path(source, "is not a directory"));
    }
    let mount = path.join(CSI_MOUNT_DIR);
    let resolved = if mount.is_dir() { mount } else { path };
    debug!(source, resolved = %resolved.display(), "source path resolved");
    Ok(resolved)
}

fn expand_wildcard(source: &str) -> Result<PathBuf, ExecutorError> {
    let path = Path::new(source);
    let components: Vec<Component<'_>> = path.components().collect();
    let wildcards = components
        .iter()
        .filter(|c| c.as_os_str() == WILDCARD)
        .count();
    match wildcards {
        0 => return Ok(path.to_path_buf()),
        1 => {}
        _ => return Err(ExecutorError::source_path(source, "more than one wildcard segment")),
    }

    let split = components
        .iter()
        .position(|c| c.as_os_str() == WILDCARD)
        .unwrap_or_default();
    let prefix: PathBuf = components[..split].iter().collect();
    let suffix: PathBuf = components[split + 1..].iter().collect();

    let entries = std::fs::read_dir(&prefix).map_err(|e| ExecutorError::io(&prefix, e))?;
    let mut matches = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| ExecutorError::io(&prefix, e))?;
        let candidate = entry.path().join(&suffix);
        if candidate.exists() {
            matches.push(candidate);
        }
    }

    match matches.len() {
        1 => Ok(matches.remove(0)),
        0 => Err(ExecutorError::source_path(source, "matched nothing")),
        n => Err(ExecutorError::source_path(
            source,
            format!("matched {} paths", n),
        )),
    }
}
