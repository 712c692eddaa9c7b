//! Benchmarks for redo log append throughput.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use redolog::{
    EntryKind, FileLogWriter, LogEntry, RolloverManager, TransactionId, WriterConfig,
};
use tempfile::TempDir;

fn writer(dir: &TempDir, fsync_interval: Duration) -> FileLogWriter {
    let config = WriterConfig {
        fsync_interval,
        ..WriterConfig::default()
    };
    let rollover = Arc::new(RolloverManager::new(
        dir.path().join("redo.log"),
        dir.path().join("archive"),
    ));
    let writer = FileLogWriter::new(config, rollover);
    writer.open().unwrap();
    writer
}

fn entry(mailbox: i32, i: i32, size: usize) -> LogEntry {
    LogEntry::new(
        EntryKind::Op,
        TransactionId::new(mailbox, i),
        mailbox,
        vec![0xAB; size],
    )
}

/// Asynchronous appends: no fsync on the write path.
fn bench_async_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("async_append");

    for size in [64usize, 1024, 16 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let writer = writer(&dir, Duration::from_millis(10));
            let entry = entry(1, 1, size);
            b.iter(|| writer.log(black_box(&entry), false).unwrap());
            writer.close().unwrap();
        });
    }

    group.finish();
}

/// Synchronous appends from one thread: every write syncs inline.
fn bench_sync_append_inline(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_append_inline");
    group.sample_size(20);
    group.throughput(Throughput::Elements(1));

    group.bench_function("interval_0", |b| {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir, Duration::ZERO);
        let entry = entry(1, 1, 256);
        b.iter(|| writer.log(black_box(&entry), true).unwrap());
        writer.close().unwrap();
    });

    group.finish();
}

/// Synchronous appends from several mailboxes at once, inline vs batched.
fn bench_sync_append_concurrent(c: &mut Criterion) {
    let mut group = c.benchmark_group("sync_append_concurrent");
    group.sample_size(10);

    let threads = 8;
    let per_thread = 50;
    group.throughput(Throughput::Elements((threads * per_thread) as u64));

    for interval_ms in [0u64, 2, 10].iter() {
        group.bench_with_input(
            BenchmarkId::new("fsync_interval_ms", interval_ms),
            interval_ms,
            |b, &interval_ms| {
                b.iter_with_setup(
                    || {
                        let dir = TempDir::new().unwrap();
                        let writer = Arc::new(writer(&dir, Duration::from_millis(interval_ms)));
                        (dir, writer)
                    },
                    |(_dir, writer)| {
                        let handles: Vec<_> = (0..threads)
                            .map(|t| {
                                let writer = Arc::clone(&writer);
                                thread::spawn(move || {
                                    for i in 0..per_thread {
                                        writer.log(&entry(t, i, 256), true).unwrap();
                                    }
                                })
                            })
                            .collect();
                        for handle in handles {
                            handle.join().unwrap();
                        }
                        writer.close().unwrap();
                    },
                );
            },
        );
    }

    group.finish();
}

/// Encoding and decoding of entry frames.
fn bench_frame_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_codec");
    let entry = entry(1, 1, 1024);
    let frame = entry.encode();

    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("encode_1k", |b| b.iter(|| black_box(&entry).encode()));
    group.bench_function("decode_1k", |b| {
        b.iter(|| LogEntry::decode(black_box(&frame)).unwrap())
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_async_append,
    bench_sync_append_inline,
    bench_sync_append_concurrent,
    bench_frame_codec,
);
criterion_main!(benches);
