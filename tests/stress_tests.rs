//! Stress tests for concurrency and durability.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use redolog::{
    EntryKind, Error, FatalPolicy, FileLogReader, FileLogWriter, LeaderAwareWriter,
    LeadershipState, LocalStagingWriter, LogEntry, LogWriter, ManualElection, OptionsBuilder,
    RedoLogManager, RedoMetrics, RemoteForwarder, Result, RolloverManager, TransactionId,
    WriterConfig, HEADER_LEN,
};
use tempfile::TempDir;

fn read_everything(log_path: &Path, archive_dir: &Path) -> Vec<LogEntry> {
    let mut archives: Vec<_> = match std::fs::read_dir(archive_dir) {
        Ok(dir) => dir.map(|e| e.unwrap().path()).collect(),
        Err(_) => Vec::new(),
    };
    archives.sort();
    let mut all = Vec::new();
    for path in archives {
        all.extend(FileLogReader::read_all(&path).unwrap());
    }
    if log_path.exists() {
        all.extend(FileLogReader::read_all(log_path).unwrap());
    }
    all
}

/// Many threads issuing synchronous writes through the batched fsync.
#[test]
fn stress_concurrent_synchronous_writers() {
    let dir = TempDir::new().unwrap();
    let config = WriterConfig {
        fsync_interval: Duration::from_millis(2),
        ..WriterConfig::default()
    };
    let rollover = Arc::new(RolloverManager::new(dir.path().join("redo.log"), dir.path().join("archive")));
    let writer = Arc::new(FileLogWriter::new(config, rollover));
    writer.open().unwrap();

    let threads = 8;
    let per_thread = 200;
    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let writer = Arc::clone(&writer);
            thread::spawn(move || {
                for i in 0..per_thread {
                    let entry = LogEntry::new(
                        EntryKind::Op,
                        TransactionId::new(t, i),
                        t,
                        format!("thread {} op {}", t, i).into_bytes(),
                    );
                    writer.log(&entry, true).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let size = writer.size();
    writer.close().unwrap();
    let entries = FileLogReader::read_all(writer.path()).unwrap();
    assert_eq!(entries.len(), (threads * per_thread) as usize);
    let framed: usize = entries.iter().map(LogEntry::encoded_len).sum();
    assert_eq!(size, (HEADER_LEN + framed) as u64);

    // Per-thread order is preserved.
    for t in 0..threads {
        let counters: Vec<i32> = entries
            .iter()
            .filter(|e| e.mailbox_id() == t)
            .map(|e| e.txn_id().counter)
            .collect();
        assert_eq!(counters, (0..per_thread).collect::<Vec<_>>());
    }

    let metrics = writer.metrics().summary();
    assert!(metrics.fsyncs > 0);
    assert!(metrics.fsyncs <= metrics.entries_logged);
}

/// Rollovers racing with loggers lose and duplicate nothing.
#[test]
fn stress_rollover_under_load() {
    let dir = TempDir::new().unwrap();
    let options = OptionsBuilder::new()
        .dir(dir.path())
        .fsync_interval(Duration::from_millis(1))
        .fatal_policy(FatalPolicy::LogAndContinue)
        .build()
        .unwrap();
    let log_path = options.log_path.clone();
    let archive_dir = options.archive_dir.clone();
    let manager = Arc::new(RedoLogManager::new(options).unwrap());
    manager.start().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let rotator = {
        let manager = Arc::clone(&manager);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            while running.load(Ordering::SeqCst) {
                manager.force_rollover().unwrap();
                thread::sleep(Duration::from_millis(3));
            }
        })
    };

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                for i in 0..250 {
                    let entry = LogEntry::new(EntryKind::Op, TransactionId::new(t, i), t, vec![1u8; 64]);
                    manager.log(&entry, i % 10 == 0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    running.store(false, Ordering::SeqCst);
    rotator.join().unwrap();
    manager.stop().unwrap();

    let ops: Vec<(i32, i32)> = read_everything(&log_path, &archive_dir)
        .into_iter()
        .filter(|e| e.kind() == EntryKind::Op)
        .map(|e| (e.txn_id().time, e.txn_id().counter))
        .collect();
    let unique: HashSet<_> = ops.iter().copied().collect();
    assert_eq!(ops.len(), 1000);
    assert_eq!(unique.len(), 1000);
}

#[derive(Default)]
struct RecordingForwarder {
    delivered: Mutex<Vec<LogEntry>>,
}

impl RemoteForwarder for RecordingForwarder {
    fn forward(&self, _leader_id: &str, entry: &LogEntry, _synchronous: bool) -> Result<()> {
        if entry.txn_id().counter % 7 == 3 {
            return Err(Error::leader_unavailable("flaky"));
        }
        self.delivered.lock().push(entry.clone());
        Ok(())
    }
}

/// Leadership flapping while writers run: every entry ends up somewhere once.
#[test]
fn stress_leadership_flips() {
    let dir = TempDir::new().unwrap();
    let config = WriterConfig {
        fsync_interval: Duration::ZERO,
        ..WriterConfig::default()
    };
    let metrics = Arc::new(RedoMetrics::new());
    let rollover = Arc::new(RolloverManager::new(dir.path().join("redo.log"), dir.path().join("archive")));
    let local = FileLogWriter::with_metrics(config.clone(), rollover, Arc::clone(&metrics));
    let staging = LocalStagingWriter::new(dir.path().join("staging.log"), config, Arc::clone(&metrics));
    let forwarder = Arc::new(RecordingForwarder::default());
    let election = Arc::new(ManualElection::new(LeadershipState::Unknown));
    let router = Arc::new(LeaderAwareWriter::new(
        local,
        forwarder.clone(),
        staging,
        election.clone(),
        metrics,
    ));
    router.open().unwrap();

    let running = Arc::new(AtomicBool::new(true));
    let flipper = {
        let election = Arc::clone(&election);
        let running = Arc::clone(&running);
        thread::spawn(move || {
            let states = [
                LeadershipState::Follower("n2".into()),
                LeadershipState::Unknown,
                LeadershipState::Leader,
                LeadershipState::Follower("n3".into()),
            ];
            let mut i = 0;
            while running.load(Ordering::SeqCst) {
                election.set(states[i % states.len()].clone());
                i += 1;
                thread::sleep(Duration::from_millis(2));
            }
        })
    };

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let router = Arc::clone(&router);
            thread::spawn(move || {
                for i in 0..150 {
                    let entry = LogEntry::new(EntryKind::Op, TransactionId::new(t, i), t, vec![2u8; 16]);
                    router.log(&entry, false).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    running.store(false, Ordering::SeqCst);
    flipper.join().unwrap();

    election.set(LeadershipState::Leader);
    router.await_transitions();
    assert!(router.staging().is_empty());
    router.close().unwrap();

    let mut ids: Vec<(i32, i32)> = forwarder
        .delivered
        .lock()
        .iter()
        .map(|e| (e.txn_id().time, e.txn_id().counter))
        .collect();
    ids.extend(
        read_everything(&dir.path().join("redo.log"), &dir.path().join("archive"))
            .into_iter()
            .map(|e| (e.txn_id().time, e.txn_id().counter)),
    );
    let unique: HashSet<_> = ids.iter().copied().collect();
    assert_eq!(ids.len(), 600);
    assert_eq!(unique.len(), 600);
}
