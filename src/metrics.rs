use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;
use serde_json::{json, Value};

/// Upper bounds (ms) of the fixed latency buckets; the last one is open.
const BUCKET_BOUNDS: [f64; 8] = [0.5, 1.0, 2.0, 5.0, 10.0, 50.0, 100.0, f64::INFINITY];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Acquire,
    Extend,
    Release,
    Status,
}

pub struct OperationMetrics {
    pub count: AtomicU64,
    pub granted: AtomicU64,
    pub errors: AtomicU64,
    pub total_duration_us: AtomicU64,
    pub max_ms: AtomicU32,
    buckets: [AtomicU64; 8],
}

impl Default for OperationMetrics {
    fn default() -> Self {
        Self {
            count: AtomicU64::new(0),
            granted: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_duration_us: AtomicU64::new(0),
            max_ms: AtomicU32::new(0),
            buckets: Default::default(),
        }
    }
}

impl OperationMetrics {
    pub fn record(&self, duration_ms: f64, granted: bool, is_error: bool) {
        self.count.fetch_add(1, Ordering::Relaxed);
        self.total_duration_us.fetch_add((duration_ms * 1000.0) as u64, Ordering::Relaxed);
        self.max_ms.fetch_max(duration_ms as u32, Ordering::Relaxed);

        if granted {
            self.granted.fetch_add(1, Ordering::Relaxed);
        }
        if is_error {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }

        let bucket = BUCKET_BOUNDS
            .iter()
            .position(|bound| duration_ms <= *bound)
            .unwrap_or(BUCKET_BOUNDS.len() - 1);
        self.buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Value {
        let count = self.count.load(Ordering::Relaxed);
        let total_us = self.total_duration_us.load(Ordering::Relaxed);
        let bucket_counts: Vec<u64> = self.buckets.iter().map(|b| b.load(Ordering::Relaxed)).collect();
        let (p50_ms, p95_ms, p99_ms) = calculate_percentiles(&bucket_counts, count);

        json!({
            "count": count,
            "granted": self.granted.load(Ordering::Relaxed),
            "errors": self.errors.load(Ordering::Relaxed),
            "avg_ms": if count > 0 { total_us as f64 / 1000.0 / count as f64 } else { 0.0 },
            "p50_ms": p50_ms,
            "p95_ms": p95_ms,
            "p99_ms": p99_ms,
            "max_ms": self.max_ms.load(Ordering::Relaxed),
        })
    }
}

/// Per-primitive counters for an authority node.
pub struct Metrics {
    pub start_time: Instant,
    pub acquire: OperationMetrics,
    pub extend: OperationMetrics,
    pub release: OperationMetrics,
    pub status: OperationMetrics,
}

impl Default for Metrics {
    fn default() -> Self {
        Self {
            start_time: Instant::now(),
            acquire: OperationMetrics::default(),
            extend: OperationMetrics::default(),
            release: OperationMetrics::default(),
            status: OperationMetrics::default(),
        }
    }
}

impl Metrics {
    pub fn operation(&self, operation: Operation) -> &OperationMetrics {
        match operation {
            Operation::Acquire => &self.acquire,
            Operation::Extend => &self.extend,
            Operation::Release => &self.release,
            Operation::Status => &self.status,
        }
    }

    pub fn record(&self, operation: Operation, started: Instant, granted: bool, is_error: bool) {
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.operation(operation).record(duration_ms, granted, is_error);
    }

    pub fn snapshot(&self, live_keys: usize) -> Value {
        json!({
            "uptime_seconds": self.start_time.elapsed().as_secs(),
            "live_keys": live_keys,
            "operations": {
                "acquire": self.acquire.snapshot(),
                "extend": self.extend.snapshot(),
                "release": self.release.snapshot(),
                "status": self.status.snapshot(),
            },
        })
    }
}

fn calculate_percentiles(bucket_counts: &[u64], total: u64) -> (f64, f64, f64) {
    if total == 0 {
        return (0.0, 0.0, 0.0);
    }

    let targets = [
        ((total as f64 * 0.50).ceil() as u64).max(1),
        ((total as f64 * 0.95).ceil() as u64).max(1),
        ((total as f64 * 0.99).ceil() as u64).max(1),
    ];
    let mut found = [None; 3];
    let mut cumulative = 0;

    for (i, &count) in bucket_counts.iter().enumerate() {
        cumulative += count;
        for (slot, target) in found.iter_mut().zip(targets) {
            if slot.is_none() && cumulative >= target {
                *slot = Some(BUCKET_BOUNDS[i]);
            }
        }
    }

    let bound = |slot: Option<f64>| slot.unwrap_or(f64::INFINITY);
    (bound(found[0]), bound(found[1]), bound(found[2]))
}
