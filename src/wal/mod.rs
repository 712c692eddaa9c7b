//! Redo log files: format, writer, reader and rotation.
//!
//! A redo log file is a fixed 512-byte header followed by a stream of
//! framed entries appended strictly in order. Entries are never rewritten;
//! only the header is updated in place.
//!
//! # Components
//!
//! - [`LogHeader`]: the header codec
//! - [`FileLogWriter`]: appends entries, batches fsyncs, rotates the file
//! - [`FsyncScheduler`]: background thread that drives batched fsyncs
//! - [`CommitNotifyQueue`]: callbacks waiting for durability
//! - [`RolloverManager`]: file sequence numbers, archive naming, crash recovery
//! - [`FileLogReader`]: replays a file from offset 512

mod fsync;
mod header;
mod notify;
mod reader;
mod rollover;
mod writer;

use std::path::PathBuf;

pub use fsync::{clamp_interval, FsyncScheduler, SyncTarget};
pub use header::{LogHeader, Version, SERVER_ID_MAX_LEN};
pub use notify::{CommitNotifyQueue, PendingNotification, ReadyNotifications};
pub use reader::FileLogReader;
pub use rollover::RolloverManager;
pub use writer::{FileLogWriter, SequenceSource, WriterConfig};

use crate::types::LogEntry;
use crate::Result;

/// Size of the file header in bytes.
pub const HEADER_LEN: usize = 512;

/// Magic bytes at the start of every redo log file.
pub const MAGIC: &[u8; 7] = b"ZM_REDO";

/// Common interface of every redo log destination.
///
/// Implemented by the file-backed writer and by the leader-aware router,
/// which composes a local writer, a remote forwarder and a staging log.
pub trait LogWriter: Send + Sync {
    /// Open the log for appends.
    fn open(&self) -> Result<()>;

    /// Write the final header, sync and release the file.
    fn close(&self) -> Result<()>;

    /// Append one entry, optionally waiting until it is durable.
    fn log(&self, entry: &LogEntry, synchronous: bool) -> Result<()>;

    /// Force everything logged so far to disk.
    fn flush(&self) -> Result<()>;

    /// Rotate the active file, carrying `carry_over` into the new one.
    ///
    /// Returns the archived file, if the old file was kept.
    fn rollover(&self, carry_over: &[LogEntry]) -> Result<Option<PathBuf>>;

    /// Sequence number of the active file.
    fn sequence(&self) -> u64;

    /// Size of the active file, header included.
    fn size(&self) -> u64;

    /// Creation time of the active file in milliseconds.
    fn create_time(&self) -> i64;

    /// Whether the active file holds no entries.
    fn is_empty(&self) -> bool {
        self.size() <= HEADER_LEN as u64
    }
}
