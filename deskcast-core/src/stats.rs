//! Delivery counters and periodic throughput reports.
//!
//! Counters only ever increase and are shared through an `Arc`. The
//! reporter turns them into an average-since-start report once per
//! interval; like the bandwidth estimator it takes explicit instants so
//! the arithmetic can be tested without sleeping.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Default reporting period.
pub const DEFAULT_STATS_INTERVAL: Duration = Duration::from_secs(5);

const BITS_PER_MEGABIT: f64 = 1024.0 * 1024.0;

// ── StatsCounters ────────────────────────────────────────────────

/// Monotonic pipeline counters.
#[derive(Debug, Default)]
pub struct StatsCounters {
    frames: AtomicU64,
    raw_bytes: AtomicU64,
    encoded_bytes: AtomicU64,
    write_failures: AtomicU64,
}

impl StatsCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one frame handed to the encoder.
    pub fn record_frame(&self, bytes: usize) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.raw_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Update the encoder's cumulative output size. Never decreases.
    pub fn observe_encoded_total(&self, total: u64) {
        self.encoded_bytes.fetch_max(total, Ordering::Relaxed);
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn raw_bytes(&self) -> u64 {
        self.raw_bytes.load(Ordering::Relaxed)
    }

    pub fn encoded_bytes(&self) -> u64 {
        self.encoded_bytes.load(Ordering::Relaxed)
    }

    pub fn write_failures(&self) -> u64 {
        self.write_failures.load(Ordering::Relaxed)
    }

    /// Averages since `started`, as seen at `now`.
    pub fn report_at(&self, started: Instant, now: Instant, dropped: u64) -> ThroughputReport {
        ThroughputReport::compute(
            self.frames(),
            self.raw_bytes(),
            self.encoded_bytes(),
            now.saturating_duration_since(started),
            dropped,
            self.write_failures(),
        )
    }
}

// ── ThroughputReport ─────────────────────────────────────────────

/// A single statistics line.
#[derive(Debug, Clone, PartialEq)]
pub struct ThroughputReport {
    pub frames: u64,
    pub elapsed: Duration,
    /// Average delivered frames per second.
    pub fps: f64,
    /// Average encoder output rate in Mbit/s.
    pub encoded_mbps: f64,
    /// Average raw input rate into the encoder in Mbit/s.
    pub raw_mbps: f64,
    /// Frames discarded at the queue.
    pub dropped: u64,
    pub write_failures: u64,
}

impl ThroughputReport {
    pub fn compute(
        frames: u64,
        raw_bytes: u64,
        encoded_bytes: u64,
        elapsed: Duration,
        dropped: u64,
        write_failures: u64,
    ) -> Self {
        let secs = elapsed.as_secs_f64();
        let rate = |n: f64| if secs > 0.0 { n / secs } else { 0.0 };
        Self {
            frames,
            elapsed,
            fps: rate(frames as f64),
            encoded_mbps: rate(encoded_bytes as f64 * 8.0 / BITS_PER_MEGABIT),
            raw_mbps: rate(raw_bytes as f64 * 8.0 / BITS_PER_MEGABIT),
            dropped,
            write_failures,
        }
    }
}

impl fmt::Display for ThroughputReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "sent: {} frames | fps: {:.2} | bitrate: {:.2} Mbps",
            self.frames, self.fps, self.encoded_mbps
        )
    }
}

// ── StatsReporter ────────────────────────────────────────────────

/// Emits a report once every `interval` of wall-clock time.
#[derive(Debug, Clone)]
pub struct StatsReporter {
    started: Instant,
    last_report: Instant,
    interval: Duration,
}

impl StatsReporter {
    pub fn new(started: Instant, interval: Duration) -> Self {
        Self {
            started,
            last_report: started,
            interval,
        }
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    /// Produce a report if at least one interval passed since the last.
    pub fn poll(
        &mut self,
        now: Instant,
        counters: &StatsCounters,
        dropped: u64,
    ) -> Option<ThroughputReport> {
        if now.saturating_duration_since(self.last_report) < self.interval {
            return None;
        }
        self.last_report = now;
        Some(counters.report_at(self.started, now, dropped))
    }
}
