//! Log file sequencing, archive naming and rollover crash recovery.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use log::{info, warn};

use crate::options::RedoLogOptions;
use crate::util::filename;
use crate::Result;

/// Owns the sequence counter shared by a log file and its rotations.
#[derive(Debug)]
pub struct RolloverManager {
    log_path: PathBuf,
    archive_dir: PathBuf,
    sequence: AtomicU64,
}

impl RolloverManager {
    pub fn new(log_path: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            archive_dir: archive_dir.into(),
            sequence: AtomicU64::new(0),
        }
    }

    /// Manager for the primary log described by `options`.
    pub fn from_options(options: &RedoLogOptions) -> Self {
        Self::new(&options.log_path, &options.archive_dir)
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Path of the file a rollover builds before renaming it into place.
    pub fn temp_path(&self) -> PathBuf {
        filename::temp_log_path(&self.log_path)
    }

    pub fn current_sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Raise the counter to at least `sequence`. Never lowers it.
    pub fn init_sequence(&self, sequence: u64) {
        self.sequence.fetch_max(sequence, Ordering::SeqCst);
    }

    /// Advance the counter and return the new value.
    pub fn increment_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Archive destination of a log with the given create time and sequence.
    pub fn archive_path(&self, create_time: i64, sequence: u64) -> PathBuf {
        filename::archive_file_path(&self.archive_dir, create_time, sequence)
    }

    /// Archived logs with sequence `>= from_sequence`, oldest first.
    pub fn archived_logs(&self, from_sequence: u64) -> Result<Vec<PathBuf>> {
        Ok(filename::list_archived_logs(&self.archive_dir)?
            .into_iter()
            .filter(|(sequence, _)| *sequence >= from_sequence)
            .map(|(_, path)| path)
            .collect())
    }

    /// Finish or discard a rollover interrupted by a crash.
    ///
    /// A leftover temp file next to a missing log means the crash hit
    /// between archiving the old log and renaming the new one into place:
    /// the temp file becomes the log. If the log still exists the old file
    /// was never moved and the temp file is discarded.
    pub fn crash_recovery(&self) -> Result<()> {
        let temp = self.temp_path();
        if !temp.exists() {
            return Ok(());
        }

        if self.log_path.exists() {
            warn!(
                "event=rollover_recovery action=discard_temp temp={} bytes={}",
                temp.display(),
                filename::file_size_or_zero(&temp)?
            );
            filename::delete_file(&temp)?;
        } else {
            info!(
                "event=rollover_recovery action=promote_temp temp={} log={}",
                temp.display(),
                self.log_path.display()
            );
            fs::rename(&temp, &self.log_path)?;
        }
        filename::sync_parent_dir(&self.log_path)?;
        Ok(())
    }
}
