//! Background fsync scheduler.
//!
//! The scheduler owns a thread that wakes every interval and asks its
//! target to sync. It never touches writer internals: the target exposes
//! [`SyncTarget::sync`], which flushes and then signals any waiting
//! writers itself.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};

use crate::fatal::FatalPolicy;
use crate::Result;

/// Shortest interval between background fsyncs.
pub const MIN_FSYNC_INTERVAL: Duration = Duration::from_millis(1);

/// Longest interval between background fsyncs.
pub const MAX_FSYNC_INTERVAL: Duration = Duration::from_millis(1000);

/// How often `stop` reports that it is still waiting for the thread.
const LIVENESS_LOG_INTERVAL: Duration = Duration::from_secs(1);

/// Something the scheduler can ask to become durable.
pub trait SyncTarget: Send + Sync {
    /// Flush pending data to stable storage.
    fn sync(&self) -> Result<()>;
}

/// Clamp a configured interval to `[1ms, 1000ms]`.
pub fn clamp_interval(interval: Duration) -> Duration {
    interval.clamp(MIN_FSYNC_INTERVAL, MAX_FSYNC_INTERVAL)
}

/// Handle to a running fsync thread.
pub struct FsyncScheduler {
    name: String,
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl FsyncScheduler {
    /// Start a scheduler that syncs `target` every `interval`.
    ///
    /// The thread exits on its own once the target is dropped. A sync
    /// failure is handed to `policy`; under the default policy that halts
    /// the process.
    pub fn start(
        name: impl Into<String>,
        interval: Duration,
        target: Weak<dyn SyncTarget>,
        policy: FatalPolicy,
    ) -> Result<Self> {
        let name = name.into();
        let interval = clamp_interval(interval);
        let (stop_tx, stop_rx) = mpsc::channel::<()>();
        let (done_tx, done_rx) = mpsc::channel::<()>();

        let thread_name = name.clone();
        let handle = thread::Builder::new()
            .name(format!("fsync-{}", name))
            .spawn(move || {
                run_loop(&thread_name, interval, &stop_rx, &target, policy);
                let _ = done_tx.send(());
            })?;

        debug!(
            "event=fsync_scheduler_started name={} interval_ms={}",
            name,
            interval.as_millis()
        );

        Ok(Self {
            name,
            stop_tx: Some(stop_tx),
            done_rx,
            handle: Some(handle),
        })
    }

    /// Stop the thread and wait for it to exit.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(stop_tx) = self.stop_tx.take() else {
            return;
        };
        let _ = stop_tx.send(());
        drop(stop_tx);

        loop {
            match self.done_rx.recv_timeout(LIVENESS_LOG_INTERVAL) {
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    info!("event=fsync_scheduler_stopping name={} waiting=true", self.name);
                }
            }
        }

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("event=fsync_scheduler_panicked name={}", self.name);
            }
        }
        debug!("event=fsync_scheduler_stopped name={}", self.name);
    }
}

impl Drop for FsyncScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_loop(
    name: &str,
    interval: Duration,
    stop_rx: &Receiver<()>,
    target: &Weak<dyn SyncTarget>,
    policy: FatalPolicy,
) {
    loop {
        match stop_rx.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {
                let Some(target) = target.upgrade() else {
                    break;
                };
                if let Err(err) = target.sync() {
                    policy.signal(&format!("background fsync ({})", name), &err);
                }
            }
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTarget {
        syncs: AtomicUsize,
    }

    impl SyncTarget for CountingTarget {
        fn sync(&self) -> Result<()> {
            self.syncs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_clamp_interval() {
        assert_eq!(clamp_interval(Duration::ZERO), MIN_FSYNC_INTERVAL);
        assert_eq!(clamp_interval(Duration::from_secs(30)), MAX_FSYNC_INTERVAL);
        assert_eq!(
            clamp_interval(Duration::from_millis(25)),
            Duration::from_millis(25)
        );
    }

    #[test]
    fn test_scheduler_syncs_periodically() {
        let target = Arc::new(CountingTarget {
            syncs: AtomicUsize::new(0),
        });
        let weak: Weak<dyn SyncTarget> = Arc::downgrade(&target) as Weak<dyn SyncTarget>;
        let scheduler =
            FsyncScheduler::start("test", Duration::from_millis(2), weak, FatalPolicy::Halt)
                .unwrap();

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while target.syncs.load(Ordering::SeqCst) < 3 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        scheduler.stop();

        let after_stop = target.syncs.load(Ordering::SeqCst);
        assert!(after_stop >= 3);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(target.syncs.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn test_scheduler_exits_when_target_dropped() {
        let target = Arc::new(CountingTarget {
            syncs: AtomicUsize::new(0),
        });
        let weak: Weak<dyn SyncTarget> = Arc::downgrade(&target) as Weak<dyn SyncTarget>;
        let scheduler =
            FsyncScheduler::start("orphan", Duration::from_millis(1), weak, FatalPolicy::Halt)
                .unwrap();
        drop(target);
        // Joins promptly because the loop notices the dead target.
        scheduler.stop();
    }
}
