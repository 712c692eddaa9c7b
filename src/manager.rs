//! Redo log lifecycle: transactions, checkpoints and rollover policy.
//!
//! The manager sits between mailbox code and a [`LogWriter`]. It tracks
//! which transactions are in flight so a rollover can carry them into the
//! next file, and decides when the active file is big or old enough to
//! rotate.
//!
//! # Thread Safety
//!
//! Logging threads share a reader lock; rollover and checkpoint take it
//! exclusively so no entry lands between the active-set snapshot and the
//! rotation.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::metrics::RedoMetrics;
use crate::options::RedoLogOptions;
use crate::types::{ActiveTransactions, CommitCallback, LogEntry, TransactionId, TxnIdGenerator};
use crate::util::filename::{create_dir_if_missing, create_parent_dir};
use crate::util::now_millis;
use crate::wal::{FileLogWriter, LogWriter, RolloverManager, WriterConfig, HEADER_LEN};
use crate::{Error, Result};

/// Owns the redo log of one server.
pub struct RedoLogManager {
    options: Arc<RedoLogOptions>,
    writer: Arc<dyn LogWriter>,
    rollover: Arc<RolloverManager>,
    /// Shared by loggers, exclusive for rollover and checkpoint.
    rollover_lock: RwLock<()>,
    active: Mutex<ActiveTransactions>,
    txn_ids: TxnIdGenerator,
    enabled: AtomicBool,
    /// Size of the active file when it was opened or last rotated.
    initial_size: AtomicU64,
    metrics: Arc<RedoMetrics>,
}

impl RedoLogManager {
    /// Manager over a plain file writer laid out per `options`.
    pub fn new(options: RedoLogOptions) -> Result<Self> {
        options.validate()?;
        let metrics = Arc::new(RedoMetrics::new());
        let rollover = Arc::new(RolloverManager::from_options(&options));
        let writer = Arc::new(FileLogWriter::with_metrics(
            WriterConfig::from_options(&options),
            Arc::clone(&rollover),
            Arc::clone(&metrics),
        ));
        Ok(Self::with_writer(options, writer, rollover, metrics))
    }

    /// Manager over any writer, e.g. a leader-aware router.
    ///
    /// `rollover` must be the manager the writer draws sequences from.
    pub fn with_writer(
        options: RedoLogOptions,
        writer: Arc<dyn LogWriter>,
        rollover: Arc<RolloverManager>,
        metrics: Arc<RedoMetrics>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            writer,
            rollover,
            rollover_lock: RwLock::new(()),
            active: Mutex::new(ActiveTransactions::new()),
            txn_ids: TxnIdGenerator::new(),
            enabled: AtomicBool::new(false),
            initial_size: AtomicU64::new(0),
            metrics,
        }
    }

    pub fn options(&self) -> &RedoLogOptions {
        &self.options
    }

    pub fn writer(&self) -> &Arc<dyn LogWriter> {
        &self.writer
    }

    pub fn metrics(&self) -> &Arc<RedoMetrics> {
        &self.metrics
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Recover from an interrupted rollover and open the log.
    pub fn start(&self) -> Result<()> {
        if self.is_enabled() {
            return Ok(());
        }
        create_parent_dir(&self.options.log_path)?;
        create_dir_if_missing(&self.options.archive_dir)?;
        self.rollover.crash_recovery()?;

        self.writer.open()?;
        self.rollover.init_sequence(self.writer.sequence());
        self.initial_size.store(self.writer.size(), Ordering::SeqCst);
        self.enabled.store(true, Ordering::SeqCst);

        info!(
            "event=redolog_started path={} seq={} size={}",
            self.options.log_path.display(),
            self.writer.sequence(),
            self.writer.size()
        );
        Ok(())
    }

    /// Rotate out the active file, then flush and close.
    pub fn stop(&self) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.force_rollover()?;
        self.enabled.store(false, Ordering::SeqCst);
        self.writer.flush()?;
        self.writer.close()?;
        // Carried into the new file; a restart begins with an empty set.
        self.active.lock().clear();
        self.metrics.active_transactions.set(0);

        let logged = self.metrics.entries_logged.get();
        let ms_per_item = if logged == 0 {
            0.0
        } else {
            self.metrics.log_latency.sum() as f64 / 1000.0 / logged as f64
        };
        info!(
            "event=redolog_stopped logged={} ms_per_item={:.3}",
            logged, ms_per_item
        );
        Ok(())
    }

    pub fn new_txn_id(&self) -> TransactionId {
        self.txn_ids.next_id()
    }

    /// Log an entry and rotate the file if it has grown past its limits.
    pub fn log(&self, entry: &LogEntry, synchronous: bool) -> Result<()> {
        self.log_only(entry, synchronous)?;
        if self.rollover_needed(false) {
            self.rollover(false)?;
        }
        Ok(())
    }

    /// Log an entry without considering rollover.
    pub fn log_only(&self, entry: &LogEntry, synchronous: bool) -> Result<()> {
        if !self.is_enabled() {
            return Err(Error::WriterClosed);
        }
        let _shared = self.rollover_lock.read();
        {
            let mut active = self.active.lock();
            active.track(entry);
            self.metrics.active_transactions.set(active.len() as i64);
        }
        self.writer
            .log(entry, synchronous)
            .map_err(|err| self.escalate("log", err))
    }

    /// Log the commit of the transaction opened by `start`.
    ///
    /// The commit record itself is not synced; `callback` fires once it
    /// is durable.
    pub fn commit(&self, start: &LogEntry, callback: Option<CommitCallback>) -> Result<()> {
        let mut entry = LogEntry::commit(start.txn_id(), start.mailbox_id());
        if let Some(callback) = callback {
            entry = entry.with_commit_callback(callback);
        }
        self.log(&entry, false)
    }

    /// Log the abort of the transaction opened by `start`, synchronously.
    pub fn abort(&self, start: &LogEntry) -> Result<()> {
        let entry = LogEntry::abort(start.txn_id(), start.mailbox_id());
        self.log(&entry, true)
    }

    /// Durably record the set of in-flight transactions. Nothing is
    /// written while none are active.
    pub fn checkpoint(&self) -> Result<()> {
        let _exclusive = self.rollover_lock.write();
        self.checkpoint_locked()
    }

    fn checkpoint_locked(&self) -> Result<()> {
        let ids = self.active.lock().ids();
        if ids.is_empty() {
            return Ok(());
        }
        debug!("event=redolog_checkpoint active={}", ids.len());
        self.writer
            .log(&LogEntry::checkpoint(&ids), true)
            .map_err(|err| self.escalate("checkpoint", err))
    }

    /// Whether the active file should be rotated.
    ///
    /// A forced rollover only needs a non-empty file. Otherwise the file
    /// must reach the hard size limit, or pass the soft limit after having
    /// grown since it was opened and be at least the minimum age.
    pub fn rollover_needed(&self, force: bool) -> bool {
        let size = self.writer.size();
        if force {
            return size > HEADER_LEN as u64;
        }
        if size >= self.options.rollover_hard_max_bytes {
            return true;
        }
        if size < self.options.rollover_soft_max_bytes
            || size <= self.initial_size.load(Ordering::SeqCst)
        {
            return false;
        }
        let age_ms = now_millis().saturating_sub(self.writer.create_time());
        age_ms >= self.options.rollover_min_age.as_millis() as i64
    }

    /// Checkpoint and rotate if needed. Returns the archived file, if any.
    pub fn rollover(&self, force: bool) -> Result<Option<PathBuf>> {
        let _exclusive = self.rollover_lock.write();
        if !self.rollover_needed(force) {
            return Ok(None);
        }
        self.checkpoint_locked()?;

        let carry_over = self.active.lock().snapshot();
        let archived = self
            .writer
            .rollover(&carry_over)
            .map_err(|err| self.escalate("rollover", err))?;
        self.initial_size.store(self.writer.size(), Ordering::SeqCst);

        info!(
            "event=redolog_rotated seq={} carried={} archived={}",
            self.writer.sequence(),
            carry_over.len(),
            archived
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "none".to_string())
        );
        Ok(archived)
    }

    pub fn force_rollover(&self) -> Result<Option<PathBuf>> {
        self.rollover(true)
    }

    pub fn flush(&self) -> Result<()> {
        self.writer.flush()
    }

    pub fn current_sequence(&self) -> u64 {
        self.rollover.current_sequence()
    }

    /// Archived logs with sequence at or above `from_sequence`, oldest first.
    pub fn archived_logs(&self, from_sequence: u64) -> Result<Vec<PathBuf>> {
        self.rollover.archived_logs(from_sequence)
    }

    pub fn active_transaction_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Pass I/O failures to the fatal policy before returning them.
    fn escalate(&self, context: &str, err: Error) -> Error {
        if matches!(err, Error::Io(_)) {
            self.options.fatal_policy.signal(context, &err);
        }
        err
    }
}
