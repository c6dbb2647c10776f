//! Lock-free metrics collection and periodic reporting
//!
//! Counter updates are plain atomic adds; `report()` swaps the periodic
//! counters to get a snapshot.
//!
//! NOTE: All atomics use Relaxed ordering intentionally. These are statistical
//! counters only. Do NOT use them for coordination or logic decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Flow duration bucket boundaries (milliseconds)
/// Buckets: ≤250, ≤500, ≤1000, ≤2000, ≤4000, ≤8000, ≤16000, ≤32000, >32000
const FLOW_BUCKET_BOUNDS: [u64; 8] = [250, 500, 1000, 2000, 4000, 8000, 16000, 32000];
pub const FLOW_NUM_BUCKETS: usize = 9;

#[inline]
fn flow_bucket_index(duration_ms: u64) -> usize {
    FLOW_BUCKET_BOUNDS.partition_point(|&bound| bound < duration_ms)
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
fn swap_buckets(buckets: &[AtomicU64; FLOW_NUM_BUCKETS]) -> [u64; FLOW_NUM_BUCKETS] {
    let mut result = [0u64; FLOW_NUM_BUCKETS];
    for (i, bucket) in buckets.iter().enumerate() {
        result[i] = bucket.swap(0, Ordering::Relaxed);
    }
    result
}

/// Lock-free metrics collector
pub struct Metrics {
    /// Scans received from all scanners (monotonic)
    scans_total: AtomicU64,
    /// Scans since last report (reset on report)
    scans_since_report: AtomicU64,
    /// Scans dropped because the scan queue was full (monotonic)
    scans_dropped: AtomicU64,
    /// Matched flows started (monotonic)
    matched_flows: AtomicU64,
    /// Unmatched (pass-through) flows started (monotonic)
    unmatched_flows: AtomicU64,
    /// Flows that reached the end of their sequence (monotonic)
    flows_succeeded: AtomicU64,
    /// Flows aborted by timeout, interlock or error (monotonic)
    flows_failed: AtomicU64,
    /// Flow requests dropped because the room was busy (monotonic)
    flows_dropped_busy: AtomicU64,
    /// Flow duration histogram (reset on report)
    flow_duration_buckets: [AtomicU64; FLOW_NUM_BUCKETS],
    /// Max flow duration (reset on report)
    flow_duration_max_ms: AtomicU64,
    admissions_accepted: AtomicU64,
    admissions_rejected: AtomicU64,
    alarms_total: AtomicU64,
    alarms_dropped: AtomicU64,
    /// PLC link state (0=down, 1=up)
    plc_connected: AtomicU64,
    /// Jobs not yet complete (updated by status monitor)
    jobs_outstanding: AtomicU64,
    /// Last report time (only accessed from reporter)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            scans_total: AtomicU64::new(0),
            scans_since_report: AtomicU64::new(0),
            scans_dropped: AtomicU64::new(0),
            matched_flows: AtomicU64::new(0),
            unmatched_flows: AtomicU64::new(0),
            flows_succeeded: AtomicU64::new(0),
            flows_failed: AtomicU64::new(0),
            flows_dropped_busy: AtomicU64::new(0),
            flow_duration_buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            flow_duration_max_ms: AtomicU64::new(0),
            admissions_accepted: AtomicU64::new(0),
            admissions_rejected: AtomicU64::new(0),
            alarms_total: AtomicU64::new(0),
            alarms_dropped: AtomicU64::new(0),
            plc_connected: AtomicU64::new(0),
            jobs_outstanding: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    #[inline]
    pub fn record_scan(&self) {
        self.scans_total.fetch_add(1, Ordering::Relaxed);
        self.scans_since_report.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_scan_dropped(&self) {
        self.scans_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_flow_started(&self, matched: bool) {
        if matched {
            self.matched_flows.fetch_add(1, Ordering::Relaxed);
        } else {
            self.unmatched_flows.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a finished flow and how long it held the room
    #[inline]
    pub fn record_flow_finished(&self, succeeded: bool, duration_ms: u64) {
        if succeeded {
            self.flows_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.flows_failed.fetch_add(1, Ordering::Relaxed);
        }
        self.flow_duration_buckets[flow_bucket_index(duration_ms)].fetch_add(1, Ordering::Relaxed);
        update_atomic_max(&self.flow_duration_max_ms, duration_ms);
    }

    #[inline]
    pub fn record_flow_dropped_busy(&self) {
        self.flows_dropped_busy.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_admission(&self, accepted: bool) {
        if accepted {
            self.admissions_accepted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.admissions_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn record_alarm(&self) {
        self.alarms_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_alarm_dropped(&self) {
        self.alarms_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn set_plc_connected(&self, connected: bool) {
        self.plc_connected.store(u64::from(connected), Ordering::Relaxed);
    }

    #[inline]
    pub fn set_jobs_outstanding(&self, count: u64) {
        self.jobs_outstanding.store(count, Ordering::Relaxed);
    }

    pub fn scans_total(&self) -> u64 {
        self.scans_total.load(Ordering::Relaxed)
    }

    pub fn scans_dropped(&self) -> u64 {
        self.scans_dropped.load(Ordering::Relaxed)
    }

    pub fn flows_dropped_busy(&self) -> u64 {
        self.flows_dropped_busy.load(Ordering::Relaxed)
    }

    pub fn flows_failed(&self) -> u64 {
        self.flows_failed.load(Ordering::Relaxed)
    }

    pub fn flows_succeeded(&self) -> u64 {
        self.flows_succeeded.load(Ordering::Relaxed)
    }

    pub fn alarms_total(&self) -> u64 {
        self.alarms_total.load(Ordering::Relaxed)
    }

    pub fn alarms_dropped(&self) -> u64 {
        self.alarms_dropped.load(Ordering::Relaxed)
    }

    /// Snapshot counters, resetting the periodic ones
    pub fn report(&self) -> MetricsSummary {
        let scans_count = self.scans_since_report.swap(0, Ordering::Relaxed);
        let flow_buckets = swap_buckets(&self.flow_duration_buckets);
        let flow_max_ms = self.flow_duration_max_ms.swap(0, Ordering::Relaxed);

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let scans_per_min = if elapsed.as_secs_f64() > 0.0 {
            scans_count as f64 * 60.0 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        MetricsSummary {
            scans_total: self.scans_total.load(Ordering::Relaxed),
            scans_per_min,
            scans_dropped: self.scans_dropped.load(Ordering::Relaxed),
            matched_flows: self.matched_flows.load(Ordering::Relaxed),
            unmatched_flows: self.unmatched_flows.load(Ordering::Relaxed),
            flows_succeeded: self.flows_succeeded.load(Ordering::Relaxed),
            flows_failed: self.flows_failed.load(Ordering::Relaxed),
            flows_dropped_busy: self.flows_dropped_busy.load(Ordering::Relaxed),
            flow_buckets,
            flow_max_ms,
            admissions_accepted: self.admissions_accepted.load(Ordering::Relaxed),
            admissions_rejected: self.admissions_rejected.load(Ordering::Relaxed),
            alarms_total: self.alarms_total.load(Ordering::Relaxed),
            alarms_dropped: self.alarms_dropped.load(Ordering::Relaxed),
            plc_connected: self.plc_connected.load(Ordering::Relaxed) == 1,
            jobs_outstanding: self.jobs_outstanding.load(Ordering::Relaxed),
        }
    }
}

/// Metrics snapshot
#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub scans_total: u64,
    pub scans_per_min: f64,
    pub scans_dropped: u64,
    pub matched_flows: u64,
    pub unmatched_flows: u64,
    pub flows_succeeded: u64,
    pub flows_failed: u64,
    pub flows_dropped_busy: u64,
    /// Bounds: ≤250, ≤500, ≤1000, ≤2000, ≤4000, ≤8000, ≤16000, ≤32000, >32000 ms
    pub flow_buckets: [u64; FLOW_NUM_BUCKETS],
    pub flow_max_ms: u64,
    pub admissions_accepted: u64,
    pub admissions_rejected: u64,
    pub alarms_total: u64,
    pub alarms_dropped: u64,
    pub plc_connected: bool,
    pub jobs_outstanding: u64,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            scans_total = %self.scans_total,
            scans_per_min = format!("{:.1}", self.scans_per_min),
            matched_flows = %self.matched_flows,
            unmatched_flows = %self.unmatched_flows,
            flows_ok = %self.flows_succeeded,
            flows_failed = %self.flows_failed,
            flows_busy = %self.flows_dropped_busy,
            flow_max_ms = %self.flow_max_ms,
            admitted = %self.admissions_accepted,
            rejected = %self.admissions_rejected,
            alarms = %self.alarms_total,
            plc_connected = %self.plc_connected,
            jobs_outstanding = %self.jobs_outstanding,
            "metrics"
        );
    }
}
