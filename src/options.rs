//! Configuration options for the redo log.

use std::path::PathBuf;
use std::time::Duration;

use crate::fatal::FatalPolicy;
use crate::wal::HEADER_LEN;

/// Default interval between background fsyncs (10ms).
pub const DEFAULT_FSYNC_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound on how long a synchronous writer waits for a batched fsync.
pub const DEFAULT_FSYNC_WAIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default capacity of the commit notification queue.
pub const DEFAULT_NOTIFY_QUEUE_CAPACITY: usize = 100;

/// Default minimum age of a log before a soft-limit rollover (30 minutes).
pub const DEFAULT_ROLLOVER_MIN_AGE: Duration = Duration::from_secs(30 * 60);

/// Default soft size limit for rollover (1GB).
pub const DEFAULT_ROLLOVER_SOFT_MAX: u64 = 1024 * 1024 * 1024;

/// Default hard size limit for rollover (4GB).
pub const DEFAULT_ROLLOVER_HARD_MAX: u64 = 4 * 1024 * 1024 * 1024;

/// Default timeout for forwarding one entry to the leader.
pub const DEFAULT_FORWARD_TIMEOUT: Duration = Duration::from_secs(5);

/// Redo log configuration options.
#[derive(Debug, Clone)]
pub struct RedoLogOptions {
    // === Files ===
    /// Path of the active log file.
    pub log_path: PathBuf,

    /// Directory that receives rolled-over logs.
    pub archive_dir: PathBuf,

    /// Path of the local staging log used while no leader is known.
    pub staging_path: PathBuf,

    /// Identity of this server, recorded in every log header.
    pub server_id: String,

    // === Durability ===
    /// Interval between background fsyncs. Zero syncs every synchronous write inline.
    pub fsync_interval: Duration,

    /// How long a synchronous write waits for the background fsync.
    pub fsync_wait_timeout: Duration,

    /// Capacity of the commit notification queue.
    pub notify_queue_capacity: usize,

    /// What to do on unrecoverable errors.
    pub fatal_policy: FatalPolicy,

    // === Rollover ===
    /// Delete rolled-over logs instead of archiving them.
    pub delete_on_rollover: bool,

    /// Minimum log age before a soft-limit rollover.
    pub rollover_min_age: Duration,

    /// Size at which an old-enough log is rolled over.
    pub rollover_soft_max_bytes: u64,

    /// Size at which a log is always rolled over.
    pub rollover_hard_max_bytes: u64,

    // === Cluster ===
    /// Timeout for one forward to the leader.
    pub forward_timeout: Duration,
}

impl Default for RedoLogOptions {
    fn default() -> Self {
        Self {
            // Files
            log_path: PathBuf::from("redolog/redo.log"),
            archive_dir: PathBuf::from("redolog/archive"),
            staging_path: PathBuf::from("redolog/staging.log"),
            server_id: String::new(),

            // Durability
            fsync_interval: DEFAULT_FSYNC_INTERVAL,
            fsync_wait_timeout: DEFAULT_FSYNC_WAIT_TIMEOUT,
            notify_queue_capacity: DEFAULT_NOTIFY_QUEUE_CAPACITY,
            fatal_policy: FatalPolicy::default(),

            // Rollover
            delete_on_rollover: false,
            rollover_min_age: DEFAULT_ROLLOVER_MIN_AGE,
            rollover_soft_max_bytes: DEFAULT_ROLLOVER_SOFT_MAX,
            rollover_hard_max_bytes: DEFAULT_ROLLOVER_HARD_MAX,

            // Cluster
            forward_timeout: DEFAULT_FORWARD_TIMEOUT,
        }
    }
}

impl RedoLogOptions {
    /// Create new options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Options rooted in a single directory: `redo.log`, `archive/` and `staging.log`.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            log_path: dir.join("redo.log"),
            archive_dir: dir.join("archive"),
            staging_path: dir.join("staging.log"),
            ..Self::default()
        }
    }

    /// Validate the options.
    pub fn validate(&self) -> crate::Result<()> {
        if self.log_path.file_name().is_none() {
            return Err(crate::Error::InvalidConfiguration(
                "log_path must name a file".into(),
            ));
        }

        if self.notify_queue_capacity == 0 {
            return Err(crate::Error::InvalidConfiguration(
                "notify_queue_capacity must be at least 1".into(),
            ));
        }

        if self.rollover_soft_max_bytes > self.rollover_hard_max_bytes {
            return Err(crate::Error::InvalidConfiguration(
                "rollover_soft_max_bytes must be <= rollover_hard_max_bytes".into(),
            ));
        }

        if self.rollover_soft_max_bytes <= HEADER_LEN as u64 {
            return Err(crate::Error::InvalidConfiguration(format!(
                "rollover limits must exceed the {} byte header",
                HEADER_LEN
            )));
        }

        if self.fsync_wait_timeout.is_zero() {
            return Err(crate::Error::InvalidConfiguration(
                "fsync_wait_timeout must be non-zero".into(),
            ));
        }

        Ok(())
    }

    /// Whether synchronous writes are batched behind the background fsync.
    pub fn batched_fsync(&self) -> bool {
        !self.fsync_interval.is_zero()
    }
}

/// Builder for RedoLogOptions.
#[derive(Debug, Clone, Default)]
pub struct OptionsBuilder {
    options: RedoLogOptions,
}

impl OptionsBuilder {
    /// Create a new builder with default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Root all files in one directory.
    pub fn dir(mut self, dir: impl Into<PathBuf>) -> Self {
        let layout = RedoLogOptions::in_dir(dir);
        self.options.log_path = layout.log_path;
        self.options.archive_dir = layout.archive_dir;
        self.options.staging_path = layout.staging_path;
        self
    }

    /// Set the active log path.
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.log_path = path.into();
        self
    }

    /// Set the archive directory.
    pub fn archive_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.options.archive_dir = dir.into();
        self
    }

    /// Set the staging log path.
    pub fn staging_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.options.staging_path = path.into();
        self
    }

    /// Set the server id.
    pub fn server_id(mut self, id: impl Into<String>) -> Self {
        self.options.server_id = id.into();
        self
    }

    /// Set the fsync interval.
    pub fn fsync_interval(mut self, interval: Duration) -> Self {
        self.options.fsync_interval = interval;
        self
    }

    /// Set the fsync wait timeout.
    pub fn fsync_wait_timeout(mut self, timeout: Duration) -> Self {
        self.options.fsync_wait_timeout = timeout;
        self
    }

    /// Set the notify queue capacity.
    pub fn notify_queue_capacity(mut self, capacity: usize) -> Self {
        self.options.notify_queue_capacity = capacity;
        self
    }

    /// Set the fatal error policy.
    pub fn fatal_policy(mut self, policy: FatalPolicy) -> Self {
        self.options.fatal_policy = policy;
        self
    }

    /// Delete instead of archiving on rollover.
    pub fn delete_on_rollover(mut self, value: bool) -> Self {
        self.options.delete_on_rollover = value;
        self
    }

    /// Set rollover limits.
    pub fn rollover_limits(mut self, min_age: Duration, soft_max: u64, hard_max: u64) -> Self {
        self.options.rollover_min_age = min_age;
        self.options.rollover_soft_max_bytes = soft_max;
        self.options.rollover_hard_max_bytes = hard_max;
        self
    }

    /// Set the forward timeout.
    pub fn forward_timeout(mut self, timeout: Duration) -> Self {
        self.options.forward_timeout = timeout;
        self
    }

    /// Build the options.
    pub fn build(self) -> crate::Result<RedoLogOptions> {
        self.options.validate()?;
        Ok(self.options)
    }
}
