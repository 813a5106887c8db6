#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and a Prometheus-compatible histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Fixed histogram bucket boundaries (in microseconds for internal storage).
const BUCKET_BOUNDS_US: [u64; 10] = [
    1_000,      // 1ms
    5_000,      // 5ms
    10_000,     // 10ms
    25_000,     // 25ms
    50_000,     // 50ms
    100_000,    // 100ms
    250_000,    // 250ms
    500_000,    // 500ms
    1_000_000,  // 1s
    5_000_000,  // 5s
];

const BUCKET_LABELS: [&str; 10] = [
    "0.001", "0.005", "0.01", "0.025", "0.05",
    "0.1", "0.25", "0.5", "1", "5",
];

/// Prometheus-compatible cumulative histogram with fixed buckets.
pub struct Histogram {
    /// Cumulative bucket counters; bucket[i] counts observations <= BUCKET_BOUNDS_US[i]
    buckets: [AtomicU64; 10],
    /// +Inf bucket (total count)
    count: AtomicU64,
    /// Sum of all observations in microseconds
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    /// Record a duration observation.
    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (bucket, &bound) in self.buckets.iter().zip(BUCKET_BOUNDS_US.iter()) {
            if us <= bound {
                bucket.fetch_add(1, Relaxed);
            }
        }
    }

    /// Render in Prometheus text exposition format.
    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");

        for (bucket, label) in self.buckets.iter().zip(BUCKET_LABELS.iter()) {
            let val = bucket.load(Relaxed);
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {val}");
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        // Convert microseconds to seconds with 6 decimal places
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Server-wide metrics using lock-free atomics.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    // Monotonic counters
    rooms_created_total: AtomicU64,
    rooms_closed_total: AtomicU64,
    joins_total: AtomicU64,
    leaves_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    notifications_sent_total: AtomicU64,
    notifications_failed_total: AtomicU64,
    engine_failures_total: AtomicU64,

    // Histogram
    room_creation: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                rooms_created_total: AtomicU64::new(0),
                rooms_closed_total: AtomicU64::new(0),
                joins_total: AtomicU64::new(0),
                leaves_total: AtomicU64::new(0),
                producers_created_total: AtomicU64::new(0),
                consumers_created_total: AtomicU64::new(0),
                notifications_sent_total: AtomicU64::new(0),
                notifications_failed_total: AtomicU64::new(0),
                engine_failures_total: AtomicU64::new(0),
                room_creation: Histogram::new(),
            }),
        }
    }

    // --- Counter increments ---

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_closed(&self) {
        self.inner.rooms_closed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.inner.leaves_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_notifications_sent(&self) {
        self.inner.notifications_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_notifications_failed(&self) {
        self.inner.notifications_failed_total.fetch_add(1, Relaxed);
    }

    pub fn inc_engine_failures(&self) {
        self.inner.engine_failures_total.fetch_add(1, Relaxed);
    }

    // --- Reads ---

    pub fn rooms_created(&self) -> u64 {
        self.inner.rooms_created_total.load(Relaxed)
    }

    pub fn rooms_closed(&self) -> u64 {
        self.inner.rooms_closed_total.load(Relaxed)
    }

    pub fn notifications_sent(&self) -> u64 {
        self.inner.notifications_sent_total.load(Relaxed)
    }

    pub fn notifications_failed(&self) -> u64 {
        self.inner.notifications_failed_total.load(Relaxed)
    }

    pub fn engine_failures(&self) -> u64 {
        self.inner.engine_failures_total.load(Relaxed)
    }

    // --- Histogram ---

    pub fn observe_room_creation(&self, duration: Duration) {
        self.inner.room_creation.observe(duration);
    }

    // --- Prometheus rendering ---

    /// Render all metrics in Prometheus text exposition format.
    /// `rooms_active` and `participants_active` are passed in from RoomRegistry (on-demand gauges).
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        let i = &self.inner;

        // Counters
        render_counter(&mut out, "sfu_rooms_created_total", "Total rooms created", i.rooms_created_total.load(Relaxed));
        render_counter(&mut out, "sfu_rooms_closed_total", "Total rooms closed", i.rooms_closed_total.load(Relaxed));
        render_counter(&mut out, "sfu_joins_total", "Total room joins", i.joins_total.load(Relaxed));
        render_counter(&mut out, "sfu_leaves_total", "Total room leaves", i.leaves_total.load(Relaxed));
        render_counter(&mut out, "sfu_producers_created_total", "Total producers registered", i.producers_created_total.load(Relaxed));
        render_counter(&mut out, "sfu_consumers_created_total", "Total consumers registered", i.consumers_created_total.load(Relaxed));
        render_counter(&mut out, "sfu_notifications_sent_total", "Total peer notifications delivered", i.notifications_sent_total.load(Relaxed));
        render_counter(&mut out, "sfu_notifications_failed_total", "Total peer notifications dropped", i.notifications_failed_total.load(Relaxed));
        render_counter(&mut out, "sfu_engine_failures_total", "Total rejected media engine calls", i.engine_failures_total.load(Relaxed));

        // Gauges
        render_gauge(&mut out, "sfu_rooms_active", "Currently active rooms", rooms_active as u64);
        render_gauge(&mut out, "sfu_participants_active", "Currently active participants", participants_active as u64);

        // Histogram
        i.room_creation.render(
            "sfu_room_creation_seconds",
            "Room creation latency in seconds",
            &mut out,
        );

        out
    }
}

fn render_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn render_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
