//! File-backed redo log writer.
//!
//! Appends framed entries to a single file and keeps the header current.
//! Synchronous writes are made durable either inline or by joining the
//! next batched fsync driven by the [`FsyncScheduler`]. Commit callbacks
//! ride the [`CommitNotifyQueue`] and fire right after the fsync that
//! covers them.
//!
//! Lock order is `state` then `flushed`. The queue is drained under the
//! state lock but callbacks fire after it is released.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::fatal::FatalPolicy;
use crate::metrics::{RedoMetrics, Timer};
use crate::options::RedoLogOptions;
use crate::types::{CommitId, LogEntry};
use crate::util::{filename, now_millis};
use crate::{Error, Result};

use super::fsync::{FsyncScheduler, SyncTarget};
use super::header::LogHeader;
use super::notify::{CommitNotifyQueue, PendingNotification, ReadyNotifications};
use super::rollover::RolloverManager;
use super::{LogWriter, HEADER_LEN};

/// Writer settings, usually derived from [`RedoLogOptions`].
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub server_id: String,
    /// Zero disables batching: synchronous writes fsync inline.
    pub fsync_interval: Duration,
    pub fsync_wait_timeout: Duration,
    pub notify_queue_capacity: usize,
    pub delete_on_rollover: bool,
    pub fatal_policy: FatalPolicy,
}

impl WriterConfig {
    pub fn from_options(options: &RedoLogOptions) -> Self {
        Self {
            server_id: options.server_id.clone(),
            fsync_interval: options.fsync_interval,
            fsync_wait_timeout: options.fsync_wait_timeout,
            notify_queue_capacity: options.notify_queue_capacity,
            delete_on_rollover: options.delete_on_rollover,
            fatal_policy: options.fatal_policy,
        }
    }

    pub fn batched(&self) -> bool {
        !self.fsync_interval.is_zero()
    }
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self::from_options(&RedoLogOptions::default())
    }
}

/// Where a writer gets the sequence number for a fresh file.
#[derive(Debug, Clone)]
pub enum SequenceSource {
    /// Shared with a rollover manager; the writer can rotate.
    Shared(Arc<RolloverManager>),
    /// Pinned, as for the temp file built during a rollover.
    Fixed(u64),
}

impl SequenceSource {
    fn current(&self) -> u64 {
        match self {
            SequenceSource::Shared(manager) => manager.current_sequence(),
            SequenceSource::Fixed(sequence) => *sequence,
        }
    }

    fn observe(&self, sequence: u64) {
        if let SequenceSource::Shared(manager) = self {
            manager.init_sequence(sequence);
        }
    }
}

struct WriterState {
    file: Option<File>,
    header: LogHeader,
    /// Entries appended since the writer was created. Never reset.
    log_count: u64,
    /// Value of `log_count` at the last completed fsync.
    fsync_count: u64,
    last_mailbox: Option<i32>,
    notify_queue: CommitNotifyQueue,
}

impl WriterState {
    fn append(&mut self, entry: &LogEntry, frame: &[u8]) -> Result<()> {
        let file = self.file.as_mut().ok_or(Error::WriterClosed)?;
        file.write_all(frame)?;

        self.header.file_size += frame.len() as u64;
        if self.header.first_op_time == 0 {
            self.header.first_op_time = entry.timestamp();
        }
        self.header.last_op_time = entry.timestamp();
        self.header.write_to(file)?;

        self.log_count += 1;
        Ok(())
    }

    /// Queue a commit callback. A full queue forces an fsync; the
    /// callbacks it made ready come back with `true`.
    fn enqueue(&mut self, notification: PendingNotification) -> Result<(bool, ReadyNotifications)> {
        let Self {
            file, notify_queue, ..
        } = &mut *self;
        let mut forced = false;
        let ready = notify_queue.push(notification, || {
            file.as_ref().ok_or(Error::WriterClosed)?.sync_data()?;
            forced = true;
            Ok(())
        })?;
        if forced {
            self.fsync_count = self.log_count;
        }
        Ok((forced, ready))
    }

    /// Fsync if anything was appended since the last one. Returns whether
    /// an fsync happened.
    fn sync(&mut self) -> Result<bool> {
        if self.log_count <= self.fsync_count {
            return Ok(false);
        }
        let Some(file) = self.file.as_ref() else {
            return Ok(false);
        };
        file.sync_data()?;
        self.fsync_count = self.log_count;
        Ok(true)
    }
}

struct WriterInner {
    path: PathBuf,
    config: WriterConfig,
    sequence: SequenceSource,
    state: Mutex<WriterState>,
    /// Highest `log_count` known durable.
    flushed: Mutex<u64>,
    flushed_cond: Condvar,
    metrics: Arc<RedoMetrics>,
}

impl WriterInner {
    fn publish_flushed(&self, count: u64) {
        let mut flushed = self.flushed.lock();
        if count > *flushed {
            *flushed = count;
        }
        self.flushed_cond.notify_all();
    }

    /// Fsync under the state lock. The returned callbacks are fired by
    /// the caller after the lock is released.
    fn sync_locked(&self, state: &mut WriterState) -> Result<ReadyNotifications> {
        let timer = Timer::new(&self.metrics.fsync_latency);
        if state.sync()? {
            self.metrics.fsyncs.inc();
        } else {
            timer.cancel();
        }
        self.publish_flushed(state.fsync_count);
        Ok(state.notify_queue.flush())
    }

    fn fsync(&self) -> Result<()> {
        let ready = {
            let mut state = self.state.lock();
            self.sync_locked(&mut state)?
        };
        ready.fire();
        Ok(())
    }

    /// Block until `target` entries are durable.
    ///
    /// If the batched fsync does not arrive within the configured timeout
    /// the caller syncs inline instead of failing the write.
    fn wait_for_fsync(&self, target: u64) -> Result<()> {
        let deadline = Instant::now() + self.config.fsync_wait_timeout;
        let mut flushed = self.flushed.lock();
        while *flushed < target {
            if self.flushed_cond.wait_until(&mut flushed, deadline).timed_out()
                && *flushed < target
            {
                drop(flushed);
                warn!(
                    "event=fsync_wait_timeout path={} target={} timeout_ms={}",
                    self.path.display(),
                    target,
                    self.config.fsync_wait_timeout.as_millis()
                );
                self.metrics.fsync_wait_timeouts.inc();
                return self.fsync();
            }
        }
        Ok(())
    }

    fn open_file(&self) -> Result<(File, LogHeader)> {
        filename::create_parent_dir(&self.path)?;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;

        let len = file.metadata()?.len();
        let mut header = if len == 0 {
            LogHeader::new(self.sequence.current(), &self.config.server_id, now_millis())
        } else {
            let header = LogHeader::read_from(&mut file)?;
            if header.open {
                warn!(
                    "event=log_not_closed_cleanly path={} seq={}",
                    self.path.display(),
                    header.sequence
                );
            }
            self.sequence.observe(header.sequence);
            header
        };

        header.open = true;
        header.file_size = len.max(HEADER_LEN as u64);
        header.write_to(&mut file)?;
        file.sync_all()?;

        info!(
            "event=log_opened path={} seq={} size={}",
            self.path.display(),
            header.sequence,
            header.file_size
        );
        Ok((file, header))
    }
}

impl SyncTarget for WriterInner {
    fn sync(&self) -> Result<()> {
        self.fsync()
    }
}

/// Appends redo entries to one file.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use redolog::{FileLogWriter, LogEntry, RolloverManager, TransactionId, WriterConfig};
///
/// # fn main() -> redolog::Result<()> {
/// let rollover = Arc::new(RolloverManager::new("/var/redo/redo.log", "/var/redo/archive"));
/// let writer = FileLogWriter::new(WriterConfig::default(), rollover);
/// writer.open()?;
/// let txn = TransactionId::new(1_700_000_000, 1);
/// writer.log(&LogEntry::start(txn, 7, &b"op"[..]), false)?;
/// writer.log(&LogEntry::commit(txn, 7), true)?;
/// writer.close()?;
/// # Ok(())
/// # }
/// ```
pub struct FileLogWriter {
    inner: Arc<WriterInner>,
    scheduler: Mutex<Option<FsyncScheduler>>,
}

impl FileLogWriter {
    /// Writer for the rollover manager's log path.
    pub fn new(config: WriterConfig, rollover: Arc<RolloverManager>) -> Self {
        Self::with_metrics(config, rollover, Arc::new(RedoMetrics::new()))
    }

    /// Writer that reports into shared metrics.
    pub fn with_metrics(
        config: WriterConfig,
        rollover: Arc<RolloverManager>,
        metrics: Arc<RedoMetrics>,
    ) -> Self {
        let path = rollover.log_path().to_path_buf();
        Self::build(path, config, SequenceSource::Shared(rollover), metrics)
    }

    /// Writer for a file with a pinned sequence. It cannot roll over.
    pub fn with_fixed_sequence(path: impl Into<PathBuf>, config: WriterConfig, sequence: u64) -> Self {
        Self::build(
            path.into(),
            config,
            SequenceSource::Fixed(sequence),
            Arc::new(RedoMetrics::new()),
        )
    }

    fn build(
        path: PathBuf,
        config: WriterConfig,
        sequence: SequenceSource,
        metrics: Arc<RedoMetrics>,
    ) -> Self {
        let header = LogHeader::new(sequence.current(), &config.server_id, 0);
        let state = WriterState {
            file: None,
            header,
            log_count: 0,
            fsync_count: 0,
            last_mailbox: None,
            notify_queue: CommitNotifyQueue::new(config.notify_queue_capacity),
        };
        Self {
            inner: Arc::new(WriterInner {
                path,
                config,
                sequence,
                state: Mutex::new(state),
                flushed: Mutex::new(0),
                flushed_cond: Condvar::new(),
                metrics,
            }),
            scheduler: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn config(&self) -> &WriterConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<RedoMetrics> {
        &self.inner.metrics
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().file.is_some()
    }

    /// Copy of the in-memory header.
    pub fn header(&self) -> LogHeader {
        self.inner.state.lock().header.clone()
    }

    pub fn sequence(&self) -> u64 {
        self.inner.state.lock().header.sequence
    }

    pub fn size(&self) -> u64 {
        self.inner.state.lock().header.file_size
    }

    pub fn create_time(&self) -> i64 {
        self.inner.state.lock().header.create_time
    }

    /// Commit callbacks still waiting for an fsync.
    pub fn pending_notifications(&self) -> usize {
        self.inner.state.lock().notify_queue.len()
    }

    /// Open the file, creating it with a fresh header if missing.
    ///
    /// The header is persisted with the open flag set before any entry can
    /// be appended. Opening an open writer is a no-op.
    pub fn open(&self) -> Result<()> {
        {
            let mut state = self.inner.state.lock();
            if state.file.is_some() {
                return Ok(());
            }
            let (file, header) = self.inner.open_file()?;
            state.file = Some(file);
            state.header = header;
            state.last_mailbox = None;
        }
        self.start_scheduler()
    }

    /// Append one entry.
    ///
    /// With `synchronous` set the call returns only once the entry is on
    /// stable storage. Consecutive writes for the same mailbox sync inline
    /// since nothing else would share the batch.
    pub fn log(&self, entry: &LogEntry, synchronous: bool) -> Result<()> {
        let start = Instant::now();
        let frame = entry.encode();

        let mut ready = Vec::new();
        let appended = {
            let mut state = self.inner.state.lock();
            self.append_locked(&mut state, entry, &frame, synchronous, &mut ready)
        };

        // Fired even if the sync failed: a forced fsync may have made some durable.
        for drained in ready {
            drained.fire();
        }
        if let Some(target) = appended? {
            self.inner.wait_for_fsync(target)?;
        }

        let metrics = &self.inner.metrics;
        metrics.entries_logged.inc();
        metrics.bytes_logged.add(frame.len() as u64);
        metrics.log_latency.observe_since(start);
        Ok(())
    }

    /// Append under the state lock. Returns the `log_count` to wait for
    /// when a batched fsync must cover the entry.
    fn append_locked(
        &self,
        state: &mut WriterState,
        entry: &LogEntry,
        frame: &[u8],
        synchronous: bool,
        ready: &mut Vec<ReadyNotifications>,
    ) -> Result<Option<u64>> {
        let batched = self.inner.config.batched();
        state.append(entry, frame)?;

        let same_mailbox = state.last_mailbox == Some(entry.mailbox_id());
        state.last_mailbox = Some(entry.mailbox_id());

        let has_callback = entry.commit_callback().is_some();
        if let Some(callback) = entry.commit_callback() {
            let commit_id = CommitId::new(state.header.sequence, entry.txn_id());
            let notification = PendingNotification::new(Arc::clone(callback), commit_id);
            let (forced, drained) = state.enqueue(notification)?;
            if forced {
                self.inner.metrics.fsyncs.inc();
                self.inner.publish_flushed(state.fsync_count);
            }
            ready.push(drained);
        }

        // Without a scheduler nothing else would fire the callback.
        let must_sync = synchronous || (has_callback && !batched);
        if !must_sync {
            Ok(None)
        } else if !batched || same_mailbox {
            ready.push(self.inner.sync_locked(state)?);
            Ok(None)
        } else {
            Ok(Some(state.log_count))
        }
    }

    /// Fsync now and fire pending commit callbacks.
    pub fn fsync(&self) -> Result<()> {
        self.inner.fsync()
    }

    /// Stop the scheduler, persist the closed header and release the file.
    pub fn close(&self) -> Result<()> {
        self.stop_scheduler();

        let mut state = self.inner.state.lock();
        let Some(mut file) = state.file.take() else {
            return Ok(());
        };
        state.header.open = false;
        state.header.write_to(&mut file)?;
        file.sync_all()?;

        state.fsync_count = state.log_count;
        let ready = state.notify_queue.flush();
        self.inner.publish_flushed(state.fsync_count);

        info!(
            "event=log_closed path={} seq={} size={}",
            self.inner.path.display(),
            state.header.sequence,
            state.header.file_size
        );
        drop(state);
        ready.fire();
        Ok(())
    }

    /// Rotate the file.
    ///
    /// The new file is built under a temp name with the next sequence and
    /// the `carry_over` entries, then the old file is archived (or deleted)
    /// and the temp file renamed into place. A failure before the old file
    /// moves leaves it active again.
    pub fn rollover(&self, carry_over: &[LogEntry]) -> Result<Option<PathBuf>> {
        let SequenceSource::Shared(manager) = &self.inner.sequence else {
            return Err(Error::internal("fixed-sequence writer cannot roll over"));
        };
        if !self.is_open() {
            return Err(Error::WriterClosed);
        }

        let start = Instant::now();
        self.close()?;
        let (old_sequence, old_create_time) = {
            let state = self.inner.state.lock();
            (state.header.sequence, state.header.create_time)
        };
        let new_sequence = manager.increment_sequence();
        let temp_path = filename::temp_log_path(&self.inner.path);

        let prepared = self.write_rollover_file(&temp_path, new_sequence, carry_over);
        let disposed = prepared.and_then(|()| self.dispose_old_file(manager, old_create_time, old_sequence));
        let archived = match disposed {
            Ok(archived) => archived,
            Err(err) => {
                if let Err(cleanup) = filename::delete_file(&temp_path) {
                    warn!(
                        "event=rollover_temp_cleanup_failed path={} error={}",
                        temp_path.display(),
                        cleanup
                    );
                }
                if let Err(reopen) = self.open() {
                    error!(
                        "event=rollover_reopen_failed path={} error={}",
                        self.inner.path.display(),
                        reopen
                    );
                }
                return Err(err);
            }
        };

        fs::rename(&temp_path, &self.inner.path)?;
        filename::sync_parent_dir(&self.inner.path)?;
        self.open()?;

        self.inner.metrics.rollovers.inc();
        self.inner.metrics.rollover_latency.observe_since(start);
        info!(
            "event=rollover_complete path={} old_seq={} new_seq={} carried={} elapsed_ms={}",
            self.inner.path.display(),
            old_sequence,
            new_sequence,
            carry_over.len(),
            start.elapsed().as_millis()
        );
        Ok(archived)
    }

    fn write_rollover_file(&self, temp_path: &Path, sequence: u64, carry_over: &[LogEntry]) -> Result<()> {
        filename::delete_file(temp_path)?;
        let config = WriterConfig {
            fsync_interval: Duration::ZERO,
            ..self.inner.config.clone()
        };
        let temp = FileLogWriter::with_fixed_sequence(temp_path, config, sequence);
        temp.open()?;
        for entry in carry_over {
            temp.log(entry, false)?;
        }
        temp.close()
    }

    fn dispose_old_file(
        &self,
        manager: &RolloverManager,
        create_time: i64,
        sequence: u64,
    ) -> Result<Option<PathBuf>> {
        if self.inner.config.delete_on_rollover {
            filename::delete_file(&self.inner.path)?;
            debug!("event=rollover_deleted path={} seq={}", self.inner.path.display(), sequence);
            return Ok(None);
        }
        filename::create_dir_if_missing(manager.archive_dir())?;
        let dest = manager.archive_path(create_time, sequence);
        fs::rename(&self.inner.path, &dest)?;
        debug!("event=rollover_archived path={} seq={}", dest.display(), sequence);
        Ok(Some(dest))
    }

    fn start_scheduler(&self) -> Result<()> {
        if !self.inner.config.batched() {
            return Ok(());
        }
        let mut slot = self.scheduler.lock();
        if slot.is_some() {
            return Ok(());
        }
        let name = self
            .inner
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let target: Weak<dyn SyncTarget> = Arc::downgrade(&self.inner) as Weak<dyn SyncTarget>;
        *slot = Some(FsyncScheduler::start(
            name,
            self.inner.config.fsync_interval,
            target,
            self.inner.config.fatal_policy,
        )?);
        Ok(())
    }

    fn stop_scheduler(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
    }
}

impl LogWriter for FileLogWriter {
    fn open(&self) -> Result<()> {
        FileLogWriter::open(self)
    }

    fn close(&self) -> Result<()> {
        FileLogWriter::close(self)
    }

    fn log(&self, entry: &LogEntry, synchronous: bool) -> Result<()> {
        FileLogWriter::log(self, entry, synchronous)
    }

    fn flush(&self) -> Result<()> {
        self.fsync()
    }

    fn rollover(&self, carry_over: &[LogEntry]) -> Result<Option<PathBuf>> {
        FileLogWriter::rollover(self, carry_over)
    }

    fn sequence(&self) -> u64 {
        FileLogWriter::sequence(self)
    }

    fn size(&self) -> u64 {
        FileLogWriter::size(self)
    }

    fn create_time(&self) -> i64 {
        FileLogWriter::create_time(self)
    }
}
