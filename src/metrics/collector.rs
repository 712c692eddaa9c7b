//! Lock-free metric primitives.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Instant;

/// A monotonically increasing counter.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// A value that moves both ways, such as the number of staged entries.
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicI64,
}

impl Gauge {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, v: i64) {
        self.value.store(v, Ordering::Relaxed);
    }

    pub fn add(&self, v: i64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Number of latency buckets, the last one unbounded.
const BUCKETS: usize = 8;

/// Upper bounds (exclusive, microseconds) of the bounded buckets.
const BUCKET_BOUNDS_US: [u64; BUCKETS - 1] = [
    10,         // cached page writes
    100,        //
    1_000,      // fast fsync on SSD
    10_000,     // one batching interval
    100_000,    //
    1_000_000,  // slow disk
    10_000_000, // fsync wait timeout
];

/// Latency distribution in microseconds.
#[derive(Debug)]
pub struct Histogram {
    count: AtomicU64,
    sum: AtomicU64,
    max: AtomicU64,
    buckets: [AtomicU64; BUCKETS],
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            count: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            max: AtomicU64::new(0),
            buckets: Default::default(),
        }
    }

    /// Record the time elapsed since `start`.
    pub fn observe_since(&self, start: Instant) {
        self.observe(start.elapsed().as_micros() as u64);
    }

    /// Record one observation in microseconds.
    pub fn observe(&self, micros: u64) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.sum.fetch_add(micros, Ordering::Relaxed);
        self.max.fetch_max(micros, Ordering::Relaxed);

        let idx = BUCKET_BOUNDS_US
            .iter()
            .position(|&bound| micros < bound)
            .unwrap_or(BUCKETS - 1);
        self.buckets[idx].fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }

    /// Largest observation, `None` before the first one.
    pub fn max(&self) -> Option<u64> {
        (self.count() > 0).then(|| self.max.load(Ordering::Relaxed))
    }

    pub fn mean(&self) -> f64 {
        match self.count() {
            0 => 0.0,
            n => self.sum() as f64 / n as f64,
        }
    }

    /// Upper bound of the bucket holding the `q` quantile.
    ///
    /// Returns `None` when empty or when the quantile lands in the
    /// unbounded bucket.
    pub fn quantile_bound(&self, q: f64) -> Option<u64> {
        let total = self.count();
        if total == 0 {
            return None;
        }
        let rank = ((total as f64) * q.clamp(0.0, 1.0)).ceil().max(1.0) as u64;
        let mut seen = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            seen += bucket.load(Ordering::Relaxed);
            if seen >= rank {
                return BUCKET_BOUNDS_US.get(idx).copied();
            }
        }
        None
    }

    /// Render in Prometheus text format with bounds in seconds.
    pub fn to_prometheus(&self, name: &str) -> String {
        let mut out = String::new();
        let mut cumulative = 0;
        for (idx, bucket) in self.buckets.iter().enumerate() {
            cumulative += bucket.load(Ordering::Relaxed);
            let le = match BUCKET_BOUNDS_US.get(idx) {
                Some(bound) => format!("{}", *bound as f64 / 1_000_000.0),
                None => "+Inf".to_string(),
            };
            out.push_str(&format!("{}_bucket{{le=\"{}\"}} {}\n", name, le, cumulative));
        }
        out.push_str(&format!("{}_sum {}\n", name, self.sum() as f64 / 1_000_000.0));
        out.push_str(&format!("{}_count {}\n", name, self.count()));
        out
    }
}

/// Records its lifetime into a histogram when dropped.
pub struct Timer<'a> {
    histogram: &'a Histogram,
    start: Instant,
}

impl<'a> Timer<'a> {
    pub fn new(histogram: &'a Histogram) -> Self {
        Self {
            histogram,
            start: Instant::now(),
        }
    }

    /// Drop without recording.
    pub fn cancel(self) {
        std::mem::forget(self);
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.histogram.observe_since(self.start);
    }
}
