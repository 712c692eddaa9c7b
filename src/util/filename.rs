//! Redo log file naming conventions.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

/// Prefix of archived log names.
const ARCHIVE_PREFIX: &str = "redo-";

/// Marker preceding the sequence number in archived log names.
const SEQ_MARKER: &str = "-seq";

/// Extension of archived log names.
const ARCHIVE_SUFFIX: &str = ".log";

/// Generate the rollover temp file path for a log file.
pub fn temp_log_path(log_path: &Path) -> PathBuf {
    let mut name = log_path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    log_path.with_file_name(name)
}

/// Generate an archived log file name.
///
/// Format: `redo-<yyyyMMdd.HHmmss.SSS>-seq<N>.log`, using the log's create time.
pub fn archive_file_name(create_time_ms: i64, sequence: u64) -> String {
    let stamp = DateTime::<Utc>::from_timestamp_millis(create_time_ms)
        .unwrap_or_default()
        .format("%Y%m%d.%H%M%S%.3f");
    format!(
        "{}{}{}{}{}",
        ARCHIVE_PREFIX, stamp, SEQ_MARKER, sequence, ARCHIVE_SUFFIX
    )
}

/// Generate an archived log file path.
pub fn archive_file_path(archive_dir: &Path, create_time_ms: i64, sequence: u64) -> PathBuf {
    archive_dir.join(archive_file_name(create_time_ms, sequence))
}

/// Parse an archived log name and return its sequence number.
///
/// Returns `None` if the name doesn't match the archive pattern.
pub fn parse_archive_name(name: &str) -> Option<u64> {
    let body = name
        .strip_prefix(ARCHIVE_PREFIX)?
        .strip_suffix(ARCHIVE_SUFFIX)?;
    let pos = body.rfind(SEQ_MARKER)?;
    body[pos + SEQ_MARKER.len()..].parse::<u64>().ok()
}

/// List archived logs as `(sequence, path)`, sorted by sequence.
pub fn list_archived_logs(archive_dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut logs = Vec::new();

    if !archive_dir.exists() {
        return Ok(logs);
    }

    for entry in std::fs::read_dir(archive_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();

        if let Some(sequence) = parse_archive_name(&name) {
            logs.push((sequence, entry.path()));
        }
    }

    logs.sort();
    Ok(logs)
}

/// Get the file size, or 0 if the file doesn't exist.
pub fn file_size_or_zero(path: &Path) -> std::io::Result<u64> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(e),
    }
}

/// Delete a file, ignoring "not found" errors.
pub fn delete_file(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create directory if it doesn't exist.
pub fn create_dir_if_missing(path: &Path) -> std::io::Result<()> {
    match std::fs::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create the parent directory of a file path if it doesn't exist.
pub fn create_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => create_dir_if_missing(parent),
        _ => Ok(()),
    }
}

/// Sync the directory containing `path` so renames and deletes are durable.
#[cfg(unix)]
pub fn sync_parent_dir(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::File::open(parent)?.sync_all(),
        _ => Ok(()),
    }
}

/// Directory handles can't be synced on this platform.
#[cfg(not(unix))]
pub fn sync_parent_dir(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
