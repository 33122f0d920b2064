//! Per-provider transfer accounting in per-second buckets

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Ring size: one bucket per second, one minute of history
const BUCKETS: usize = 60;

#[derive(Default)]
struct Bucket {
    second: AtomicU64,
    bytes: AtomicU64,
}

struct Lane {
    total: AtomicU64,
    buckets: [Bucket; BUCKETS],
}

impl Default for Lane {
    fn default() -> Self {
        Self {
            total: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| Bucket::default()),
        }
    }
}

/// Aggregates transferred byte counts per provider per time bucket.
///
/// Writes are atomic adds on the current second's bucket; reads sum the
/// trailing window. Counters are eventually consistent, which is all the
/// telemetry contract asks for.
pub struct BandwidthMeter {
    lanes: Vec<Lane>,
    started: Instant,
}

impl BandwidthMeter {
    /// Create a meter for `provider_count` providers.
    pub fn new(provider_count: usize) -> Self {
        Self {
            lanes: (0..provider_count).map(|_| Lane::default()).collect(),
            started: Instant::now(),
        }
    }

    /// Number of provider lanes.
    pub fn provider_count(&self) -> usize {
        self.lanes.len()
    }

    /// Account `bytes` transferred from `provider_index` just now.
    pub fn record(&self, provider_index: usize, bytes: u64) {
        let Some(lane) = self.lanes.get(provider_index) else {
            return;
        };
        lane.total.fetch_add(bytes, Ordering::Relaxed);

        // Seconds since meter creation; monotonic, so bucket tags only grow.
        let sec = self.started.elapsed().as_secs() + 1;
        let bucket = &lane.buckets[(sec % BUCKETS as u64) as usize];
        let tagged = bucket.second.load(Ordering::Relaxed);
        if tagged != sec
            && bucket
                .second
                .compare_exchange(tagged, sec, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            bucket.bytes.store(0, Ordering::Relaxed);
        }
        bucket.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Total bytes ever transferred from `provider_index`.
    pub fn total_bytes(&self, provider_index: usize) -> u64 {
        self.lanes
            .get(provider_index)
            .map_or(0, |lane| lane.total.load(Ordering::Relaxed))
    }

    /// Average bytes per second from `provider_index` over the trailing
    /// `window` (clamped to the one-minute ring).
    pub fn recent_bps(&self, provider_index: usize, window: Duration) -> f64 {
        let Some(lane) = self.lanes.get(provider_index) else {
            return 0.0;
        };
        let window_secs = window.as_secs().clamp(1, BUCKETS as u64);
        let now = self.started.elapsed().as_secs() + 1;
        let oldest = now.saturating_sub(window_secs);

        let bytes: u64 = lane
            .buckets
            .iter()
            .filter(|bucket| {
                let sec = bucket.second.load(Ordering::Relaxed);
                sec > oldest && sec <= now
            })
            .map(|bucket| bucket.bytes.load(Ordering::Relaxed))
            .sum();

        bytes as f64 / window_secs as f64
    }

    /// Total bytes across all providers.
    pub fn grand_total(&self) -> u64 {
        (0..self.lanes.len()).map(|i| self.total_bytes(i)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_totals() {
        let meter = BandwidthMeter::new(2);
        meter.record(0, 1000);
        meter.record(0, 500);
        meter.record(1, 42);
        assert_eq!(meter.total_bytes(0), 1500);
        assert_eq!(meter.total_bytes(1), 42);
        assert_eq!(meter.grand_total(), 1542);
    }

    #[test]
    fn test_out_of_range_provider_is_ignored() {
        let meter = BandwidthMeter::new(1);
        meter.record(5, 1000);
        assert_eq!(meter.grand_total(), 0);
        assert_eq!(meter.total_bytes(5), 0);
        assert!(meter.recent_bps(5, Duration::from_secs(10)).abs() < f64::EPSILON);
    }

    #[test]
    fn test_recent_bps_sees_current_second() {
        let meter = BandwidthMeter::new(1);
        meter.record(0, 10_000);
        let bps = meter.recent_bps(0, Duration::from_secs(1));
        assert!((bps - 10_000.0).abs() < f64::EPSILON, "got {bps}");
    }

    #[test]
    fn test_window_clamped() {
        let meter = BandwidthMeter::new(1);
        meter.record(0, 6_000);
        // A huge window clamps to the 60-second ring.
        let bps = meter.recent_bps(0, Duration::from_secs(3600));
        assert!((bps - 100.0).abs() < f64::EPSILON, "got {bps}");
    }
}
