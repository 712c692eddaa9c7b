//! Integration tests for complete redo log workflows.

use std::net::TcpListener;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use redolog::{
    FatalPolicy, FileLogReader, FileLogWriter, HttpForwarder, LeaderAwareWriter, LeadershipState,
    LogEntry, LogHeader, LogWriter, ManualElection, OptionsBuilder, RedoLogManager, RedoLogOptions,
    RedoMetrics, RedologEndpoint, RolloverManager, StaticDirectory, TransactionId, WriterConfig,
    HEADER_LEN,
};
use tempfile::TempDir;

fn inline_options(dir: &Path) -> RedoLogOptions {
    OptionsBuilder::new()
        .dir(dir)
        .fsync_interval(Duration::ZERO)
        .fatal_policy(FatalPolicy::LogAndContinue)
        .build()
        .unwrap()
}

fn entries(n: i32) -> Vec<LogEntry> {
    (1..=n)
        .map(|i| {
            LogEntry::start(TransactionId::new(1_700_000_000, i), i, vec![i as u8; 32])
                .with_timestamp(1_000 + i as i64)
        })
        .collect()
}

/// One synchronous write with inline fsync, then reopen.
#[test]
fn integration_inline_sync_end_to_end() {
    let dir = TempDir::new().unwrap();
    let options = inline_options(dir.path());
    let rollover = Arc::new(RolloverManager::from_options(&options));
    let writer = FileLogWriter::new(WriterConfig::from_options(&options), rollover);
    writer.open().unwrap();

    let entry = entries(1).remove(0);
    writer.log(&entry, true).unwrap();
    assert_eq!(writer.size(), (HEADER_LEN + entry.encoded_len()) as u64);
    let size = writer.size();
    writer.close().unwrap();

    let mut file = std::fs::File::open(&options.log_path).unwrap();
    let header = LogHeader::read_from(&mut file).unwrap();
    assert!(!header.open);
    assert_eq!(header.file_size, size);
    assert_eq!(header.last_op_time, entry.timestamp());
    assert_eq!(header.first_op_time, entry.timestamp());
    assert_eq!(std::fs::metadata(&options.log_path).unwrap().len(), size);

    // Reopening adopts the header and keeps appending after it.
    writer.open().unwrap();
    assert_eq!(writer.size(), size);
    writer.log(&entries(2)[1], true).unwrap();
    writer.close().unwrap();
    assert_eq!(FileLogReader::read_all(&options.log_path).unwrap(), entries(2));
}

/// Rollover carries active transactions in start order and nothing else.
#[test]
fn integration_rollover_preserves_start_order() {
    let dir = TempDir::new().unwrap();
    let manager = RedoLogManager::new(inline_options(dir.path())).unwrap();
    manager.start().unwrap();

    let starts = entries(6);
    for entry in &starts {
        manager.log(entry, false).unwrap();
    }
    manager.commit(&starts[0], None).unwrap();
    manager.abort(&starts[3]).unwrap();

    manager.force_rollover().unwrap();
    let replayed = FileLogReader::read_all(&manager.options().log_path).unwrap();
    let expected: Vec<LogEntry> = [1, 2, 4, 5].iter().map(|&i| starts[i].clone()).collect();
    assert_eq!(replayed, expected);
    manager.stop().unwrap();
}

/// Callbacks of batched commits fire exactly once each.
#[test]
fn integration_batched_commit_callbacks() {
    let dir = TempDir::new().unwrap();
    let options = OptionsBuilder::new()
        .dir(dir.path())
        .fsync_interval(Duration::from_millis(5))
        .fatal_policy(FatalPolicy::LogAndContinue)
        .build()
        .unwrap();
    let manager = Arc::new(RedoLogManager::new(options).unwrap());
    manager.start().unwrap();

    let fired = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..4)
        .map(|t| {
            let manager = Arc::clone(&manager);
            let fired = Arc::clone(&fired);
            thread::spawn(move || {
                for i in 0..25 {
                    let start = LogEntry::start(manager.new_txn_id(), t * 100 + i, &b"op"[..]);
                    manager.log(&start, true).unwrap();
                    let fired = Arc::clone(&fired);
                    manager
                        .commit(
                            &start,
                            Some(Arc::new(move |_| {
                                fired.fetch_add(1, Ordering::SeqCst);
                                Ok(())
                            })),
                        )
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    manager.flush().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 100);
    assert_eq!(manager.active_transaction_count(), 0);
    manager.stop().unwrap();
    assert_eq!(fired.load(Ordering::SeqCst), 100);
}

/// A temp file left by a crash between archive and rename becomes the log.
#[test]
fn integration_crash_recovery_promotes_temp_file() {
    let dir = TempDir::new().unwrap();
    let options = inline_options(dir.path());
    let rollover = RolloverManager::from_options(&options);

    let temp = FileLogWriter::with_fixed_sequence(
        rollover.temp_path(),
        WriterConfig::from_options(&options),
        7,
    );
    temp.open().unwrap();
    for entry in entries(2) {
        temp.log(&entry, false).unwrap();
    }
    temp.close().unwrap();
    assert!(!options.log_path.exists());

    let manager = RedoLogManager::new(options.clone()).unwrap();
    manager.start().unwrap();
    assert_eq!(manager.current_sequence(), 7);
    assert!(!rollover.temp_path().exists());
    assert_eq!(FileLogReader::read_all(&options.log_path).unwrap(), entries(2));
}

struct Node {
    _dir: TempDir,
    election: Arc<ManualElection>,
    writer: Arc<LeaderAwareWriter>,
    log_path: std::path::PathBuf,
}

fn node(initial: LeadershipState, directory: Arc<StaticDirectory>) -> Node {
    let dir = TempDir::new().unwrap();
    let options = inline_options(dir.path());
    let election = Arc::new(ManualElection::new(initial));
    let forwarder = Arc::new(HttpForwarder::new(directory, Duration::from_secs(5)));
    let writer = Arc::new(LeaderAwareWriter::from_options(
        &options,
        Arc::new(RolloverManager::from_options(&options)),
        forwarder,
        election.clone(),
        Arc::new(RedoMetrics::new()),
    ));
    writer.open().unwrap();
    Node {
        _dir: dir,
        election,
        writer,
        log_path: options.log_path,
    }
}

/// Follower writes reach the leader's log over HTTP.
#[test]
fn integration_follower_forwards_over_http() {
    let directory = Arc::new(StaticDirectory::new());
    let leader = node(LeadershipState::Leader, directory.clone());
    let endpoint = Arc::new(RedologEndpoint::new(leader.writer.clone()));
    let mut server = endpoint
        .serve(TcpListener::bind("127.0.0.1:0").unwrap())
        .unwrap();
    directory
        .insert("leader-1", &format!("http://{}/", server.local_addr()))
        .unwrap();

    let follower = node(LeadershipState::Follower("leader-1".into()), directory);
    for entry in entries(5) {
        follower.writer.log(&entry, true).unwrap();
    }
    assert!(follower.writer.staging().is_empty());
    assert_eq!(FileLogReader::read_all(&leader.log_path).unwrap(), entries(5));

    server.shutdown();
    follower.writer.close().unwrap();
    leader.writer.close().unwrap();
}

/// Writes made while leaderless are replayed in order once a leader is known.
#[test]
fn integration_staged_writes_replayed_to_new_leader() {
    let directory = Arc::new(StaticDirectory::new());
    let leader = node(LeadershipState::Leader, directory.clone());
    let endpoint = Arc::new(RedologEndpoint::new(leader.writer.clone()));
    let server = endpoint
        .serve(TcpListener::bind("127.0.0.1:0").unwrap())
        .unwrap();
    directory
        .insert("leader-1", &format!("http://{}/", server.local_addr()))
        .unwrap();

    let follower = node(LeadershipState::Unknown, directory);
    for entry in entries(12) {
        follower.writer.log(&entry, false).unwrap();
    }
    assert_eq!(follower.writer.staging().staged_entries().unwrap().len(), 12);
    assert!(FileLogReader::read_all(&leader.log_path).unwrap().is_empty());

    follower
        .election
        .set(LeadershipState::Follower("leader-1".into()));
    follower.writer.await_transitions();

    assert!(follower.writer.staging().is_empty());
    assert_eq!(FileLogReader::read_all(&leader.log_path).unwrap(), entries(12));
}

/// A leader that disappears mid-stream: writes are staged, then promoted locally.
#[test]
fn integration_unreachable_leader_then_local_promotion() {
    let directory = Arc::new(StaticDirectory::new());
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    directory
        .insert("gone", &format!("http://{}/", listener.local_addr().unwrap()))
        .unwrap();
    drop(listener);

    let follower = node(LeadershipState::Follower("gone".into()), directory);
    for entry in entries(4) {
        follower.writer.log(&entry, true).unwrap();
    }
    assert_eq!(follower.writer.staging().staged_entries().unwrap(), entries(4));

    follower.election.set(LeadershipState::Leader);
    follower.writer.await_transitions();
    assert!(follower.writer.leadership().is_leader());
    follower.writer.log(&entries(5)[4], true).unwrap();
    assert_eq!(FileLogReader::read_all(&follower.log_path).unwrap(), entries(5));
}
