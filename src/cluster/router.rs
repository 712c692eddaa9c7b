//! Routes each entry to the local log, the remote leader or staging.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use arc_swap::ArcSwap;
use log::{debug, error, info, warn};
use parking_lot::{Mutex, RwLock};

use crate::metrics::RedoMetrics;
use crate::options::RedoLogOptions;
use crate::types::{CommitId, LogEntry};
use crate::wal::{FileLogWriter, LogWriter, RolloverManager, WriterConfig};
use crate::{Error, Result};

use super::forwarder::RemoteForwarder;
use super::staging::{DrainTarget, LocalStagingWriter};
use super::{LeaderElection, LeadershipState};

/// Work for the coordinator thread.
enum Transition {
    LeadershipChanged,
    /// Acknowledged once every earlier transition has been applied.
    Barrier(Sender<()>),
    Shutdown,
}

struct RouterShared {
    local: FileLogWriter,
    forwarder: Arc<dyn RemoteForwarder>,
    staging: LocalStagingWriter,
    election: Arc<dyn LeaderElection>,
    leadership: ArcSwap<LeadershipState>,
    /// Whether the local writer is open. Writers to the local log hold the
    /// read side; leadership transitions take the write side.
    opened: RwLock<bool>,
    events: Mutex<Option<Sender<Transition>>>,
    metrics: Arc<RedoMetrics>,
}

impl RouterShared {
    fn notify(&self, transition: Transition) -> bool {
        match self.events.lock().as_ref() {
            Some(events) => events.send(transition).is_ok(),
            None => false,
        }
    }

    fn run(self: Arc<Self>, events: Receiver<Transition>) {
        while let Ok(transition) = events.recv() {
            match transition {
                Transition::LeadershipChanged => self.apply_leadership(),
                Transition::Barrier(done) => {
                    let _ = done.send(());
                }
                Transition::Shutdown => break,
            }
        }
        debug!("event=leadership_coordinator_exit");
    }

    fn apply_leadership(&self) {
        let next = LeadershipState::from_election(&*self.election);
        let previous = self.leadership.load_full();
        if *previous != next {
            info!("event=leadership_changed from={} to={}", previous, next);
        }

        let opened = *self.opened.read();
        if next.is_leader() {
            self.step_up(next);
            return;
        }
        if opened {
            self.step_down(next.clone());
        } else {
            self.leadership.store(Arc::new(next.clone()));
        }

        if !next.leader_known() {
            if !self.staging.is_empty() {
                debug!("event=staging_held reason=no_leader");
            }
            return;
        }
        if let LeadershipState::Follower(leader) = next {
            let target = RemoteTarget {
                forwarder: &*self.forwarder,
                leader: &leader,
            };
            self.drain_staging(&target, "remote");
        }
    }

    /// Open the local log and move staged entries into it.
    ///
    /// The drain runs under the monitor so no new entry reaches the local
    /// log ahead of older staged ones.
    fn step_up(&self, next: LeadershipState) {
        let mut opened = self.opened.write();
        if !*opened {
            if let Err(err) = self.local.open() {
                error!("event=leader_open_failed error={}", err);
                self.leadership.store(Arc::new(LeadershipState::Unknown));
                return;
            }
            *opened = true;
        }
        self.leadership.store(Arc::new(next));
        let target = LocalTarget { local: &self.local };
        self.drain_staging(&target, "local");
    }

    /// Rotate and close the local log once another node leads.
    fn step_down(&self, next: LeadershipState) {
        let mut opened = self.opened.write();
        self.leadership.store(Arc::new(next));
        if !*opened {
            return;
        }
        if let Err(err) = self.local.rollover(&[]) {
            error!("event=step_down_rollover_failed error={}", err);
        }
        if let Err(err) = self.local.close() {
            error!("event=step_down_close_failed error={}", err);
        }
        *opened = false;
    }

    fn drain_staging(&self, target: &dyn DrainTarget, destination: &str) {
        match self.staging.drain(target) {
            Ok(outcome) => {
                if outcome.delivered > 0 || outcome.requeued > 0 {
                    info!(
                        "event=staging_replayed destination={} delivered={} requeued={}",
                        destination, outcome.delivered, outcome.requeued
                    );
                }
            }
            Err(err) => {
                error!(
                    "event=staging_replay_failed destination={} error={}",
                    destination, err
                );
            }
        }
    }

    fn forward(&self, leader: &str, entry: &LogEntry, synchronous: bool) -> Result<()> {
        // The callback can only fire once the leader has the entry durably.
        let callback = entry.commit_callback();
        self.forwarder
            .forward(leader, entry, synchronous || callback.is_some())?;
        self.metrics.forwarded.inc();
        if let Some(callback) = callback {
            if let Err(err) = callback(CommitId::new(0, entry.txn_id())) {
                warn!(
                    "event=commit_callback_failed txn={} error={}",
                    entry.txn_id(),
                    err
                );
            }
        }
        Ok(())
    }
}

struct LocalTarget<'a> {
    local: &'a FileLogWriter,
}

impl DrainTarget for LocalTarget<'_> {
    fn deliver(&self, entry: &LogEntry) -> Result<()> {
        self.local.log(entry, false)
    }

    fn persist(&self) -> Result<()> {
        self.local.fsync()
    }
}

struct RemoteTarget<'a> {
    forwarder: &'a dyn RemoteForwarder,
    leader: &'a str,
}

impl DrainTarget for RemoteTarget<'_> {
    fn deliver(&self, entry: &LogEntry) -> Result<()> {
        self.forwarder.forward(self.leader, entry, true)
    }
}

/// A [`LogWriter`] whose destination follows cluster write leadership.
///
/// Leadership changes reported by the election are queued and applied in
/// order by a single coordinator thread, so callbacks never rotate or close
/// the local log from the notifier's thread.
pub struct LeaderAwareWriter {
    shared: Arc<RouterShared>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderAwareWriter {
    pub fn new(
        local: FileLogWriter,
        forwarder: Arc<dyn RemoteForwarder>,
        staging: LocalStagingWriter,
        election: Arc<dyn LeaderElection>,
        metrics: Arc<RedoMetrics>,
    ) -> Self {
        let shared = Arc::new(RouterShared {
            local,
            forwarder,
            staging,
            election: Arc::clone(&election),
            leadership: ArcSwap::from_pointee(LeadershipState::Unknown),
            opened: RwLock::new(false),
            events: Mutex::new(None),
            metrics,
        });

        let weak: Weak<RouterShared> = Arc::downgrade(&shared);
        election.subscribe(Box::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.notify(Transition::LeadershipChanged);
            }
        }));

        Self {
            shared,
            coordinator: Mutex::new(None),
        }
    }

    /// Router with a local writer and staging log laid out per `options`.
    pub fn from_options(
        options: &RedoLogOptions,
        rollover: Arc<RolloverManager>,
        forwarder: Arc<dyn RemoteForwarder>,
        election: Arc<dyn LeaderElection>,
        metrics: Arc<RedoMetrics>,
    ) -> Self {
        let local = FileLogWriter::with_metrics(
            WriterConfig::from_options(options),
            rollover,
            Arc::clone(&metrics),
        );
        let staging = LocalStagingWriter::from_options(options, Arc::clone(&metrics));
        Self::new(local, forwarder, staging, election, metrics)
    }

    /// Leadership as last applied by the coordinator.
    pub fn leadership(&self) -> LeadershipState {
        (**self.shared.leadership.load()).clone()
    }

    pub fn local(&self) -> &FileLogWriter {
        &self.shared.local
    }

    pub fn staging(&self) -> &LocalStagingWriter {
        &self.shared.staging
    }

    /// Block until every leadership change reported so far is applied.
    pub fn await_transitions(&self) {
        let (done_tx, done_rx) = mpsc::channel();
        if self.shared.notify(Transition::Barrier(done_tx)) {
            let _ = done_rx.recv();
        }
    }

    fn route(&self, entry: &LogEntry, synchronous: bool) -> Result<()> {
        let shared = &self.shared;
        loop {
            let epoch = shared.staging.epoch();
            {
                let opened = shared.opened.read();
                if *opened {
                    return shared.local.log(entry, synchronous);
                }
            }

            let leader = match &**shared.leadership.load() {
                LeadershipState::Follower(id) => Some(id.clone()),
                _ => None,
            };
            if let Some(leader) = leader {
                match shared.forward(&leader, entry, synchronous) {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        shared.metrics.forward_failures.inc();
                        warn!(
                            "event=forward_failed leader={} txn={} error={}",
                            leader,
                            entry.txn_id(),
                            err
                        );
                    }
                }
            }

            if shared.staging.stage(entry, synchronous, epoch)? {
                return Ok(());
            }
            debug!("event=stage_retry txn={}", entry.txn_id());
        }
    }
}

impl LogWriter for LeaderAwareWriter {
    /// Open staging, start the coordinator and apply the current leadership.
    fn open(&self) -> Result<()> {
        {
            let mut coordinator = self.coordinator.lock();
            if coordinator.is_some() {
                return Ok(());
            }
            self.shared.staging.open()?;

            let (events_tx, events_rx) = mpsc::channel();
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name("redolog-leadership".to_string())
                .spawn(move || shared.run(events_rx))
                .map_err(|err| Error::internal(format!("failed to spawn coordinator: {}", err)))?;
            *coordinator = Some(handle);
            *self.shared.events.lock() = Some(events_tx);
        }
        self.shared.notify(Transition::LeadershipChanged);
        self.await_transitions();
        Ok(())
    }

    fn close(&self) -> Result<()> {
        let Some(handle) = self.coordinator.lock().take() else {
            return Ok(());
        };
        self.shared.notify(Transition::Shutdown);
        self.shared.events.lock().take();
        if handle.join().is_err() {
            error!("event=leadership_coordinator_panicked");
        }

        {
            let mut opened = self.shared.opened.write();
            if *opened {
                self.shared.local.close()?;
                *opened = false;
            }
            self.shared
                .leadership
                .store(Arc::new(LeadershipState::Unknown));
        }
        self.shared.staging.close()
    }

    fn log(&self, entry: &LogEntry, synchronous: bool) -> Result<()> {
        self.route(entry, synchronous)
    }

    fn flush(&self) -> Result<()> {
        {
            let opened = self.shared.opened.read();
            if *opened {
                self.shared.local.fsync()?;
            }
        }
        self.shared.staging.flush()
    }

    fn rollover(&self, carry_over: &[LogEntry]) -> Result<Option<PathBuf>> {
        let opened = self.shared.opened.write();
        if !*opened {
            return Ok(None);
        }
        self.shared.local.rollover(carry_over)
    }

    fn sequence(&self) -> u64 {
        self.shared.local.sequence()
    }

    fn size(&self) -> u64 {
        self.shared.local.size()
    }

    fn create_time(&self) -> i64 {
        self.shared.local.create_time()
    }
}

impl Drop for LeaderAwareWriter {
    fn drop(&mut self) {
        if let Err(err) = LogWriter::close(self) {
            warn!("event=router_close_failed error={}", err);
        }
    }
}
