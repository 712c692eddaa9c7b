//! On-disk queue for entries written while no leader is reachable.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{info, warn};
use parking_lot::RwLock;

use crate::metrics::RedoMetrics;
use crate::options::RedoLogOptions;
use crate::types::LogEntry;
use crate::wal::{FileLogReader, FileLogWriter, LogWriter, RolloverManager, WriterConfig};
use crate::Result;

/// Destination of a staging drain.
pub trait DrainTarget {
    /// Deliver one staged entry.
    fn deliver(&self, entry: &LogEntry) -> Result<()>;

    /// Make every delivered entry durable before staging forgets them.
    fn persist(&self) -> Result<()> {
        Ok(())
    }
}

/// Result of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainOutcome {
    pub delivered: usize,
    /// Entries that could not be delivered and stay staged.
    pub requeued: usize,
}

/// A [`FileLogWriter`] used as a FIFO of undelivered entries.
///
/// Staging shares a gate with draining: any number of threads may stage
/// at once, a drain runs alone. Each drain bumps an epoch so a writer that
/// decided to stage based on stale leadership can detect it and re-route.
pub struct LocalStagingWriter {
    writer: FileLogWriter,
    rollover: Arc<RolloverManager>,
    gate: RwLock<()>,
    drain_epoch: AtomicU64,
    metrics: Arc<RedoMetrics>,
}

impl LocalStagingWriter {
    /// Staging log at `path`. Drained files are deleted, never archived.
    pub fn new(path: impl Into<PathBuf>, config: WriterConfig, metrics: Arc<RedoMetrics>) -> Self {
        let path = path.into();
        let archive_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let config = WriterConfig {
            delete_on_rollover: true,
            ..config
        };
        let rollover = Arc::new(RolloverManager::new(path, archive_dir));
        Self {
            writer: FileLogWriter::new(config, Arc::clone(&rollover)),
            rollover,
            gate: RwLock::new(()),
            drain_epoch: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn from_options(options: &RedoLogOptions, metrics: Arc<RedoMetrics>) -> Self {
        Self::new(
            &options.staging_path,
            WriterConfig::from_options(options),
            metrics,
        )
    }

    pub fn path(&self) -> &Path {
        self.writer.path()
    }

    /// Open staging, first finishing any drain a crash interrupted.
    pub fn open(&self) -> Result<()> {
        self.rollover.crash_recovery()?;
        self.writer.open()
    }

    pub fn close(&self) -> Result<()> {
        self.writer.close()
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.fsync()
    }

    pub fn is_empty(&self) -> bool {
        LogWriter::is_empty(&self.writer)
    }

    /// Current drain epoch. Read it before deciding to stage.
    pub fn epoch(&self) -> u64 {
        self.drain_epoch.load(Ordering::SeqCst)
    }

    /// Append an entry unless a drain ran since `epoch`.
    ///
    /// Returns `false` without writing when the epoch moved, so the
    /// caller can route the entry again with fresh leadership.
    pub fn stage(&self, entry: &LogEntry, synchronous: bool, epoch: u64) -> Result<bool> {
        let _shared = self.gate.read();
        if self.drain_epoch.load(Ordering::SeqCst) != epoch {
            return Ok(false);
        }
        self.writer.log(entry, synchronous)?;
        self.metrics.staged.inc();
        Ok(true)
    }

    /// Entries currently staged, oldest first.
    pub fn staged_entries(&self) -> Result<Vec<LogEntry>> {
        let _shared = self.gate.read();
        FileLogReader::read_all(self.writer.path())
    }

    /// Replay every staged entry, in order, to `target`.
    ///
    /// Delivery stops at the first failure. The undelivered tail is moved
    /// into a fresh staging file, so each entry ends up either delivered
    /// or staged exactly once.
    pub fn drain(&self, target: &dyn DrainTarget) -> Result<DrainOutcome> {
        let _exclusive = self.gate.write();
        self.drain_epoch.fetch_add(1, Ordering::SeqCst);
        if self.is_empty() {
            return Ok(DrainOutcome::default());
        }

        let entries = FileLogReader::read_all(self.writer.path())?;
        let mut delivered = 0;
        for entry in &entries {
            if let Err(err) = target.deliver(entry) {
                warn!(
                    "event=staging_drain_interrupted delivered={} remaining={} error={}",
                    delivered,
                    entries.len() - delivered,
                    err
                );
                break;
            }
            delivered += 1;
        }

        if delivered > 0 {
            target.persist()?;
        }
        let remaining = &entries[delivered..];
        self.writer.rollover(remaining)?;

        self.metrics.staging_drains.inc();
        self.metrics.drained.add(delivered as u64);
        info!(
            "event=staging_drained delivered={} requeued={}",
            delivered,
            remaining.len()
        );
        Ok(DrainOutcome {
            delivered,
            requeued: remaining.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TransactionId;
    use crate::Error;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Recorder {
        delivered: Mutex<Vec<LogEntry>>,
        fail_after: usize,
        persisted: Mutex<bool>,
    }

    impl Recorder {
        fn new(fail_after: usize) -> Self {
            Self {
                delivered: Mutex::new(Vec::new()),
                fail_after,
                persisted: Mutex::new(false),
            }
        }
    }

    impl DrainTarget for Recorder {
        fn deliver(&self, entry: &LogEntry) -> Result<()> {
            let mut delivered = self.delivered.lock();
            if delivered.len() >= self.fail_after {
                return Err(Error::leader_unavailable("leader moved"));
            }
            delivered.push(entry.clone());
            Ok(())
        }

        fn persist(&self) -> Result<()> {
            *self.persisted.lock() = true;
            Ok(())
        }
    }

    fn staging(dir: &Path) -> LocalStagingWriter {
        let config = WriterConfig {
            fsync_interval: Duration::ZERO,
            ..WriterConfig::default()
        };
        let staging =
            LocalStagingWriter::new(dir.join("staging.log"), config, Arc::new(RedoMetrics::new()));
        staging.open().unwrap();
        staging
    }

    fn entries(n: i32) -> Vec<LogEntry> {
        (1..=n)
            .map(|i| {
                LogEntry::start(TransactionId::new(1, i), i, vec![i as u8; 4]).with_timestamp(i as i64)
            })
            .collect()
    }

    #[test]
    fn test_drain_delivers_in_order() {
        let dir = tempdir().unwrap();
        let staging = staging(dir.path());
        for entry in entries(5) {
            assert!(staging.stage(&entry, true, staging.epoch()).unwrap());
        }

        let target = Recorder::new(usize::MAX);
        let outcome = staging.drain(&target).unwrap();
        assert_eq!(outcome, DrainOutcome { delivered: 5, requeued: 0 });
        assert_eq!(*target.delivered.lock(), entries(5));
        assert!(*target.persisted.lock());
        assert!(staging.is_empty());
        assert!(staging.staged_entries().unwrap().is_empty());
    }

    #[test]
    fn test_interrupted_drain_requeues_tail_once() {
        let dir = tempdir().unwrap();
        let staging = staging(dir.path());
        for entry in entries(6) {
            staging.stage(&entry, false, staging.epoch()).unwrap();
        }

        let first = Recorder::new(2);
        let outcome = staging.drain(&first).unwrap();
        assert_eq!(outcome, DrainOutcome { delivered: 2, requeued: 4 });
        assert_eq!(staging.staged_entries().unwrap(), entries(6)[2..].to_vec());

        let second = Recorder::new(usize::MAX);
        staging.drain(&second).unwrap();
        let mut all = first.delivered.lock().clone();
        all.extend(second.delivered.lock().iter().cloned());
        assert_eq!(all, entries(6));
    }

    #[test]
    fn test_stage_rejected_after_drain() {
        let dir = tempdir().unwrap();
        let staging = staging(dir.path());
        let epoch = staging.epoch();
        staging.drain(&Recorder::new(usize::MAX)).unwrap();

        assert!(!staging.stage(&entries(1)[0], false, epoch).unwrap());
        assert!(staging.is_empty());
    }

    #[test]
    fn test_reopen_recovers_requeued_tail_after_crash() {
        let dir = tempdir().unwrap();
        let first = staging(dir.path());
        for entry in entries(3) {
            first.stage(&entry, true, first.epoch()).unwrap();
        }
        first.close().unwrap();

        // Crash after the old file was deleted, before the rename.
        let path = dir.path().join("staging.log");
        std::fs::rename(&path, crate::util::filename::temp_log_path(&path)).unwrap();

        let reopened = staging(dir.path());
        assert_eq!(reopened.staged_entries().unwrap(), entries(3));
        assert!(!crate::util::filename::temp_log_path(&path).exists());

        let target = Recorder::new(usize::MAX);
        reopened.drain(&target).unwrap();
        assert_eq!(*target.delivered.lock(), entries(3));
    }

    #[test]
    fn test_drain_of_empty_staging() {
        let dir = tempdir().unwrap();
        let staging = staging(dir.path());
        let outcome = staging.drain(&Recorder::new(0)).unwrap();
        assert_eq!(outcome, DrainOutcome::default());
    }
}
