//! Redo log metrics.

use std::fmt;

use super::collector::{Counter, Gauge, Histogram};

/// Counters and latencies for every redo log path.
///
/// Shared as `Arc<RedoMetrics>` between the manager, the file writer and
/// the leader-aware router.
#[derive(Debug, Default)]
pub struct RedoMetrics {
    // Appends
    pub entries_logged: Counter,
    pub bytes_logged: Counter,
    /// Latency of `log`, including any durability wait (microseconds).
    pub log_latency: Histogram,

    // Durability
    pub fsyncs: Counter,
    /// Latency of the fsync call itself (microseconds).
    pub fsync_latency: Histogram,
    /// Synchronous writes that gave up waiting for the batch and synced inline.
    pub fsync_wait_timeouts: Counter,

    // Rotation
    pub rollovers: Counter,
    pub rollover_latency: Histogram,

    // Cluster routing
    pub forwarded: Counter,
    pub forward_failures: Counter,
    pub staged: Counter,
    pub drained: Counter,
    pub staging_drains: Counter,

    // State
    pub active_transactions: Gauge,
}

impl RedoMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Render all metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 10] = [
            ("redolog_entries_total", "Entries appended", &self.entries_logged),
            ("redolog_bytes_total", "Framed bytes appended", &self.bytes_logged),
            ("redolog_fsyncs_total", "Fsyncs performed", &self.fsyncs),
            (
                "redolog_fsync_wait_timeouts_total",
                "Synchronous writes that fell back to an inline fsync",
                &self.fsync_wait_timeouts,
            ),
            ("redolog_rollovers_total", "Log files rotated", &self.rollovers),
            ("redolog_forwarded_total", "Entries forwarded to the leader", &self.forwarded),
            (
                "redolog_forward_failures_total",
                "Forward attempts that failed",
                &self.forward_failures,
            ),
            ("redolog_staged_total", "Entries written to local staging", &self.staged),
            ("redolog_drained_total", "Staged entries delivered", &self.drained),
            ("redolog_staging_drains_total", "Staging drain passes", &self.staging_drains),
        ];
        for (name, help, counter) in counters {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} counter\n", name));
            out.push_str(&format!("{} {}\n\n", name, counter.get()));
        }

        out.push_str("# HELP redolog_active_transactions Transactions started but not ended\n");
        out.push_str("# TYPE redolog_active_transactions gauge\n");
        out.push_str(&format!(
            "redolog_active_transactions {}\n\n",
            self.active_transactions.get()
        ));

        let histograms: [(&str, &str, &Histogram); 3] = [
            ("redolog_log_latency_seconds", "Latency of log calls", &self.log_latency),
            ("redolog_fsync_latency_seconds", "Latency of fsync", &self.fsync_latency),
            (
                "redolog_rollover_latency_seconds",
                "Latency of rollover",
                &self.rollover_latency,
            ),
        ];
        for (name, help, histogram) in histograms {
            out.push_str(&format!("# HELP {} {}\n", name, help));
            out.push_str(&format!("# TYPE {} histogram\n", name));
            out.push_str(&histogram.to_prometheus(name));
            out.push('\n');
        }

        out
    }

    /// Snapshot of the headline numbers.
    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            entries_logged: self.entries_logged.get(),
            bytes_logged: self.bytes_logged.get(),
            fsyncs: self.fsyncs.get(),
            rollovers: self.rollovers.get(),
            forwarded: self.forwarded.get(),
            staged: self.staged.get(),
            log_latency_mean_us: self.log_latency.mean(),
            fsync_latency_mean_us: self.fsync_latency.mean(),
        }
    }
}

/// Point-in-time copy of the main redo log metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsSummary {
    pub entries_logged: u64,
    pub bytes_logged: u64,
    pub fsyncs: u64,
    pub rollovers: u64,
    pub forwarded: u64,
    pub staged: u64,
    pub log_latency_mean_us: f64,
    pub fsync_latency_mean_us: f64,
}

impl MetricsSummary {
    /// Average entries covered by one fsync.
    pub fn entries_per_fsync(&self) -> f64 {
        if self.fsyncs == 0 {
            0.0
        } else {
            self.entries_logged as f64 / self.fsyncs as f64
        }
    }
}

impl fmt::Display for MetricsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Redo Log Metrics ===")?;
        writeln!(
            f,
            "  Entries:   {} ({} bytes)",
            self.entries_logged, self.bytes_logged
        )?;
        writeln!(
            f,
            "  Fsyncs:    {} ({:.1} entries/fsync)",
            self.fsyncs,
            self.entries_per_fsync()
        )?;
        writeln!(f, "  Rollovers: {}", self.rollovers)?;
        writeln!(f, "  Forwarded: {}  Staged: {}", self.forwarded, self.staged)?;
        writeln!(
            f,
            "  Latency:   log {:.2} µs, fsync {:.2} µs",
            self.log_latency_mean_us, self.fsync_latency_mean_us
        )
    }
}
