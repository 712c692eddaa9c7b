//! Commit notification queue.
//!
//! Commit records may carry a callback that must fire only after the
//! record's bytes are durable. The writer parks those callbacks here and
//! drains the queue right after each fsync. Drained callbacks are fired by
//! the caller once it has released the lock guarding the queue, so a
//! callback may log to the same writer.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};

use log::error;

use crate::types::{CommitCallback, CommitId};
use crate::Result;

/// A callback waiting for the fsync that covers its commit record.
pub struct PendingNotification {
    pub callback: CommitCallback,
    pub commit_id: CommitId,
}

impl PendingNotification {
    pub fn new(callback: CommitCallback, commit_id: CommitId) -> Self {
        Self {
            callback,
            commit_id,
        }
    }

    fn fire(self) {
        let commit_id = self.commit_id;
        let callback = self.callback;
        match catch_unwind(AssertUnwindSafe(|| callback(commit_id))) {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                error!(
                    "event=commit_callback_failed commit_id={} error={}",
                    commit_id, err
                );
            }
            Err(_) => {
                error!("event=commit_callback_panicked commit_id={}", commit_id);
            }
        }
    }
}

/// Bounded FIFO of pending commit notifications.
pub struct CommitNotifyQueue {
    queue: VecDeque<PendingNotification>,
    capacity: usize,
}

impl CommitNotifyQueue {
    /// Create a queue holding at most `capacity` notifications.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.capacity
    }

    /// Queue a notification.
    ///
    /// When the queue is full, `make_durable` is called first and the queue
    /// is drained to make room, so callbacks still never run ahead of their
    /// fsync. The drained notifications are returned for the caller to
    /// fire. An error from `make_durable` leaves the queue untouched.
    pub fn push<F>(
        &mut self,
        notification: PendingNotification,
        make_durable: F,
    ) -> Result<ReadyNotifications>
    where
        F: FnOnce() -> Result<()>,
    {
        let ready = if self.is_full() {
            make_durable()?;
            self.flush()
        } else {
            ReadyNotifications::default()
        };
        self.queue.push_back(notification);
        Ok(ready)
    }

    /// Remove the oldest notification.
    pub fn pop(&mut self) -> Option<PendingNotification> {
        self.queue.pop_front()
    }

    /// Remove every queued notification, oldest first.
    ///
    /// Must only be called once the queued commit records are durable.
    pub fn flush(&mut self) -> ReadyNotifications {
        let mut ready = ReadyNotifications::default();
        while let Some(notification) = self.pop() {
            ready.0.push(notification);
        }
        ready
    }
}

/// Notifications whose commit records are durable, waiting to be fired.
#[must_use = "ready notifications must be fired"]
#[derive(Default)]
pub struct ReadyNotifications(Vec<PendingNotification>);

impl ReadyNotifications {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Fire every callback, oldest first. A failing or panicking callback
    /// is logged and the rest still fire.
    pub fn fire(self) -> usize {
        let fired = self.0.len();
        for notification in self.0 {
            notification.fire();
        }
        fired
    }
}
