//! # redolog
//!
//! A durable redo log for a mail-store server.
//!
//! ## Features
//!
//! - **Fixed-layout files**: 512-byte header plus a stream of CRC-framed entries
//! - **Batched fsync**: a background scheduler groups synchronous writes into one fsync
//! - **Commit callbacks**: fired exactly once, only after the bytes are durable
//! - **Atomic rollover**: in-flight transactions are carried into the next file
//! - **Leader-aware routing**: followers forward to the leader, leaderless writes are staged
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use redolog::{LogEntry, RedoLogManager, RedoLogOptions};
//!
//! # fn main() -> redolog::Result<()> {
//! let manager = RedoLogManager::new(RedoLogOptions::in_dir("/var/redo"))?;
//! manager.start()?;
//!
//! let start = LogEntry::start(manager.new_txn_id(), 42, &b"create folder"[..]);
//! manager.log(&start, false)?;
//! manager.commit(&start, None)?;
//!
//! manager.stop()?;
//! # Ok(())
//! # }
//! ```

// Public modules
pub mod cluster;
pub mod error;
pub mod fatal;
pub mod manager;
pub mod metrics;
pub mod options;
pub mod types;
pub mod util;
pub mod wal;

// Re-export main types for convenience
pub use error::{Error, Result};
pub use fatal::FatalPolicy;
pub use options::{OptionsBuilder, RedoLogOptions};
pub use types::{
    ActiveTransactions, CallbackResult, CommitCallback, CommitId, EntryKind, LogEntry,
    TransactionId, TxnIdGenerator,
};

// Log files
pub use wal::{
    FileLogReader, FileLogWriter, LogHeader, LogWriter, RolloverManager, WriterConfig, HEADER_LEN,
};

// Cluster routing
pub use cluster::{
    EndpointHandle, HttpForwarder, LeaderAwareWriter, LeaderElection, LeadershipState,
    LocalStagingWriter, ManualElection, RedologEndpoint, RemoteForwarder, StaticDirectory,
};

// Lifecycle
pub use manager::RedoLogManager;

// Metrics
pub use metrics::{MetricsSummary, RedoMetrics};
