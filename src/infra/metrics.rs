//! Lock-free metrics collection and periodic reporting
//!
//! Uses atomics for hot-path operations to avoid mutex contention.
//! All counter updates are lock-free; reporting is the only operation
//! that needs synchronization (via atomic swap). The Prometheus exporter
//! reads through `snapshot`, which never resets anything, so scrapes and
//! the periodic summary each see their own window.
//!
//! NOTE: All atomics use Relaxed ordering intentionally—these are statistical
//! counters only. Do NOT use these atomics for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Detection latency bucket boundaries (milliseconds)
/// Buckets: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560
const BUCKET_BOUNDS: [u64; 10] = [5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560];
const NUM_BUCKETS: usize = 11;

/// Compute bucket index for a latency value using binary search
#[inline]
fn bucket_index(latency_ms: u64) -> usize {
    BUCKET_BOUNDS.partition_point(|&bound| bound < latency_ms)
}

/// Update an atomic max value using compare-and-swap loop
#[inline]
fn update_atomic_max(atomic_max: &AtomicU64, new_value: u64) {
    let mut current_max = atomic_max.load(Ordering::Relaxed);
    while new_value > current_max {
        match atomic_max.compare_exchange_weak(
            current_max,
            new_value,
            Ordering::Relaxed,
            Ordering::Relaxed,
        ) {
            Ok(_) => break,
            Err(actual) => current_max = actual,
        }
    }
}

/// Swap all buckets to zero and return their values
#[inline]
fn swap_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    let mut result = [0u64; NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

#[inline]
fn load_buckets(buckets: &[AtomicU64; NUM_BUCKETS]) -> [u64; NUM_BUCKETS] {
    std::array::from_fn(|i| buckets[i].load(Ordering::Relaxed))
}

/// Compute percentile from histogram buckets
/// Returns the upper bound of the bucket containing the percentile
fn percentile_from_buckets(buckets: &[u64; NUM_BUCKETS], percentile: f64) -> u64 {
    let total: u64 = buckets.iter().sum();
    if total == 0 {
        return 0;
    }

    let target = (total as f64 * percentile) as u64;
    let mut cumulative = 0u64;

    // Upper bounds for each bucket (last bucket uses 2x the previous bound)
    const BUCKET_UPPER_BOUNDS: [u64; NUM_BUCKETS] =
        [5, 10, 20, 40, 80, 160, 320, 640, 1280, 2560, 5120];

    for (i, &count) in buckets.iter().enumerate() {
        cumulative += count;
        if cumulative >= target {
            return BUCKET_UPPER_BOUNDS[i];
        }
    }
    BUCKET_UPPER_BOUNDS[NUM_BUCKETS - 1]
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Frame requests sent to devices (monotonic)
    frames_requested: AtomicU64,
    /// Complete frames assembled (monotonic)
    frames_received: AtomicU64,
    /// Frames received since last report (reset on report)
    frames_since_report: AtomicU64,
    /// Bytes of assembled frames (monotonic)
    frame_bytes: AtomicU64,
    decode_failures: AtomicU64,
    detect_failures: AtomicU64,
    track_failures: AtomicU64,
    /// Person boxes surviving threshold + NMS (monotonic)
    detections_total: AtomicU64,
    enter_events: AtomicU64,
    exit_events: AtomicU64,
    /// Traffic events applied to the floor plan (monotonic)
    events_applied: AtomicU64,
    /// Traffic events dropped because a device queue was full (monotonic)
    events_dropped: AtomicU64,
    devices_registered: AtomicU64,
    devices_reconnected: AtomicU64,
    devices_disconnected: AtomicU64,
    handshake_failures: AtomicU64,
    discovery_replies: AtomicU64,
    /// Detection latency histogram buckets (reset on report)
    detect_latency_buckets: [AtomicU64; NUM_BUCKETS],
    detect_latency_sum_ms: AtomicU64,
    detect_latency_max_ms: AtomicU64,
    detections_since_report: AtomicU64,
    /// Same histogram, never reset (exporter view)
    detect_latency_buckets_total: [AtomicU64; NUM_BUCKETS],
    detect_latency_sum_total_ms: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            frames_requested: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            frames_since_report: AtomicU64::new(0),
            frame_bytes: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
            detect_failures: AtomicU64::new(0),
            track_failures: AtomicU64::new(0),
            detections_total: AtomicU64::new(0),
            enter_events: AtomicU64::new(0),
            exit_events: AtomicU64::new(0),
            events_applied: AtomicU64::new(0),
            events_dropped: AtomicU64::new(0),
            devices_registered: AtomicU64::new(0),
            devices_reconnected: AtomicU64::new(0),
            devices_disconnected: AtomicU64::new(0),
            handshake_failures: AtomicU64::new(0),
            discovery_replies: AtomicU64::new(0),
            detect_latency_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            detect_latency_sum_ms: AtomicU64::new(0),
            detect_latency_max_ms: AtomicU64::new(0),
            detections_since_report: AtomicU64::new(0),
            detect_latency_buckets_total: std::array::from_fn(|_| AtomicU64::new(0)),
            detect_latency_sum_total_ms: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_frame_requested(&self) {
        self.frames_requested.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_frame_received(&self, bytes: usize) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.frames_since_report.fetch_add(1, Ordering::Relaxed);
        self.frame_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_detect_failure(&self) {
        self.detect_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_track_failure(&self) {
        self.track_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one completed detector call (lock-free)
    #[inline]
    pub fn record_detection(&self, latency_ms: u64, boxes: usize) {
        self.detections_total.fetch_add(boxes as u64, Ordering::Relaxed);
        self.detections_since_report.fetch_add(1, Ordering::Relaxed);
        self.detect_latency_sum_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.detect_latency_buckets[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        self.detect_latency_sum_total_ms.fetch_add(latency_ms, Ordering::Relaxed);
        self.detect_latency_buckets_total[bucket_index(latency_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.detect_latency_max_ms, latency_ms);
    }

    #[inline]
    pub fn record_traffic(&self, enters: usize, exits: usize) {
        self.enter_events.fetch_add(enters as u64, Ordering::Relaxed);
        self.exit_events.fetch_add(exits as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_events_applied(&self, n: usize) {
        self.events_applied.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_events_dropped(&self, n: usize) {
        self.events_dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_registered(&self) {
        self.devices_registered.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_reconnected(&self) {
        self.devices_reconnected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_device_disconnected(&self) {
        self.devices_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_handshake_failure(&self) {
        self.handshake_failures.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_discovery_reply(&self) {
        self.discovery_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_received(&self) -> u64 {
        self.frames_received.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }

    pub fn devices_disconnected(&self) -> u64 {
        self.devices_disconnected.load(Ordering::Relaxed)
    }

    pub fn events_dropped(&self) -> u64 {
        self.events_dropped.load(Ordering::Relaxed)
    }

    /// Generate a metrics summary and reset periodic counters
    ///
    /// This is the only method that resets counters. It uses atomic swap
    /// to get a consistent snapshot while allowing concurrent updates.
    pub fn report(&self, connected_devices: usize, known_devices: usize) -> MetricsSummary {
        let frames_count = self.frames_since_report.swap(0, Ordering::Relaxed);
        let detect_count = self.detections_since_report.swap(0, Ordering::Relaxed);
        let detect_sum = self.detect_latency_sum_ms.swap(0, Ordering::Relaxed);
        let detect_max = self.detect_latency_max_ms.swap(0, Ordering::Relaxed);
        let detect_buckets = swap_buckets(&self.detect_latency_buckets);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let frames_per_sec = if elapsed.as_secs_f64() > 0.0 {
            frames_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            frames_requested: self.frames_requested.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_per_sec,
            frame_bytes: self.frame_bytes.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            detect_failures: self.detect_failures.load(Ordering::Relaxed),
            track_failures: self.track_failures.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            enter_events: self.enter_events.load(Ordering::Relaxed),
            exit_events: self.exit_events.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            devices_registered: self.devices_registered.load(Ordering::Relaxed),
            devices_reconnected: self.devices_reconnected.load(Ordering::Relaxed),
            devices_disconnected: self.devices_disconnected.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            discovery_replies: self.discovery_replies.load(Ordering::Relaxed),
            detect_lat_buckets: detect_buckets,
            detect_lat_sum_ms: detect_sum,
            detect_lat_avg_ms: if detect_count > 0 { detect_sum / detect_count } else { 0 },
            detect_lat_max_ms: detect_max,
            detect_lat_p50_ms: percentile_from_buckets(&detect_buckets, 0.50),
            detect_lat_p99_ms: percentile_from_buckets(&detect_buckets, 0.99),
            connected_devices,
            known_devices,
        }
    }

    /// Read every counter without resetting anything.
    ///
    /// Histogram fields cover the whole process lifetime; `frames_per_sec`
    /// and the latency max cover the window since the last `report`.
    pub fn snapshot(&self, connected_devices: usize, known_devices: usize) -> MetricsSummary {
        let buckets = load_buckets(&self.detect_latency_buckets_total);
        let count: u64 = buckets.iter().sum();
        let sum = self.detect_latency_sum_total_ms.load(Ordering::Relaxed);

        let elapsed = self.last_report_time.lock().elapsed().as_secs_f64();
        let frames_per_sec = if elapsed > 0.0 {
            self.frames_since_report.load(Ordering::Relaxed) as f64 / elapsed
        } else {
            0.0
        };

        MetricsSummary {
            frames_requested: self.frames_requested.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_per_sec,
            frame_bytes: self.frame_bytes.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            detect_failures: self.detect_failures.load(Ordering::Relaxed),
            track_failures: self.track_failures.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            enter_events: self.enter_events.load(Ordering::Relaxed),
            exit_events: self.exit_events.load(Ordering::Relaxed),
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            devices_registered: self.devices_registered.load(Ordering::Relaxed),
            devices_reconnected: self.devices_reconnected.load(Ordering::Relaxed),
            devices_disconnected: self.devices_disconnected.load(Ordering::Relaxed),
            handshake_failures: self.handshake_failures.load(Ordering::Relaxed),
            discovery_replies: self.discovery_replies.load(Ordering::Relaxed),
            detect_lat_buckets: buckets,
            detect_lat_sum_ms: sum,
            detect_lat_avg_ms: if count > 0 { sum / count } else { 0 },
            detect_lat_max_ms: self.detect_latency_max_ms.load(Ordering::Relaxed),
            detect_lat_p50_ms: percentile_from_buckets(&buckets, 0.50),
            detect_lat_p99_ms: percentile_from_buckets(&buckets, 0.99),
            connected_devices,
            known_devices,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of histogram buckets (exported for Prometheus formatting)
pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Exported bucket bounds for Prometheus formatting
pub const METRICS_BUCKET_BOUNDS: [u64; 10] = BUCKET_BOUNDS;

#[derive(Debug)]
pub struct MetricsSummary {
    pub frames_requested: u64,
    pub frames_received: u64,
    pub frames_per_sec: f64,
    pub frame_bytes: u64,
    pub decode_failures: u64,
    pub detect_failures: u64,
    pub track_failures: u64,
    pub detections_total: u64,
    pub enter_events: u64,
    pub exit_events: u64,
    pub events_applied: u64,
    pub events_dropped: u64,
    pub devices_registered: u64,
    pub devices_reconnected: u64,
    pub devices_disconnected: u64,
    pub handshake_failures: u64,
    pub discovery_replies: u64,
    /// Detection latency histogram buckets
    /// Bounds: ≤5, ≤10, ≤20, ≤40, ≤80, ≤160, ≤320, ≤640, ≤1280, ≤2560, >2560 ms
    pub detect_lat_buckets: [u64; NUM_BUCKETS],
    pub detect_lat_sum_ms: u64,
    pub detect_lat_avg_ms: u64,
    pub detect_lat_max_ms: u64,
    pub detect_lat_p50_ms: u64,
    pub detect_lat_p99_ms: u64,
    pub connected_devices: usize,
    pub known_devices: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            frames = %self.frames_received,
            frames_per_sec = format!("{:.1}", self.frames_per_sec),
            detect_avg_ms = %self.detect_lat_avg_ms,
            detect_p99_ms = %self.detect_lat_p99_ms,
            decode_failures = %self.decode_failures,
            detect_failures = %self.detect_failures,
            enters = %self.enter_events,
            exits = %self.exit_events,
            applied = %self.events_applied,
            connected = %self.connected_devices,
            known = %self.known_devices,
            "metrics"
        );
    }
}
