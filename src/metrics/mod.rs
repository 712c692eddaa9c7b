//! Metrics for the redo log.
//!
//! - **Appends**: entries, bytes, `log` latency
//! - **Durability**: fsync count and latency, batching ratio
//! - **Rotation**: rollovers and their latency
//! - **Routing**: forwarded, staged and drained entries
//!
//! Everything renders in Prometheus text format.

mod collector;
mod redo_metrics;

pub use collector::{Counter, Gauge, Histogram, Timer};
pub use redo_metrics::{MetricsSummary, RedoMetrics};
