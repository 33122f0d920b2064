//! Per-job provider affinity tracking and candidate ordering

use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use crate::record::{FetchOutcome, ProviderStatSnapshot, StatRecord};

/// Default 1-in-N exploration ratio
const DEFAULT_EXPLORATION_RATIO: u64 = 32;

/// Success rate a provider must hold to be pinned first for a job
const DEFAULT_BEST_MIN_SUCCESS_RATE: f64 = 0.8;

/// How recently a provider must have served a job to stay pinned
const DEFAULT_BEST_MAX_IDLE: Duration = Duration::from_secs(30 * 60);

/// Configuration for [`AffinityTracker`]
#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Master toggle; when off, ordering falls back to configured order
    pub enabled: bool,
    /// Explore (promote the runner-up) once every `exploration_ratio`
    /// ranked fetches; 0 disables exploration
    pub exploration_ratio: u64,
    /// Minimum success rate for [`AffinityTracker::best_provider`]
    pub best_min_success_rate: f64,
    /// Maximum idle time for [`AffinityTracker::best_provider`]
    pub best_max_idle: Duration,
}

impl Default for AffinityConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            exploration_ratio: DEFAULT_EXPLORATION_RATIO,
            best_min_success_rate: DEFAULT_BEST_MIN_SUCCESS_RATE,
            best_max_idle: DEFAULT_BEST_MAX_IDLE,
        }
    }
}

type RowKey = (String, usize);

/// Rolling per-`(job, provider)` performance memory.
///
/// Rows live in a concurrent map with per-row critical sections; reads
/// produce cloned snapshots, so no caller ever holds a row lock across an
/// await point.
pub struct AffinityTracker {
    config: AffinityConfig,
    rows: DashMap<RowKey, StatRecord>,
    dirty: Mutex<HashSet<RowKey>>,
    ranked_fetches: AtomicU64,
}

impl AffinityTracker {
    /// Create a tracker with the given configuration.
    pub fn new(config: AffinityConfig) -> Self {
        Self {
            config,
            rows: DashMap::new(),
            dirty: Mutex::new(HashSet::new()),
            ranked_fetches: AtomicU64::new(0),
        }
    }

    /// Whether affinity-based ordering is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Fold one fetch outcome into the `(job, provider)` row.
    pub fn record(&self, job_key: &str, provider_index: usize, outcome: FetchOutcome) {
        let key = (job_key.to_string(), provider_index);
        self.rows.entry(key.clone()).or_default().record(outcome);
        self.dirty.lock().insert(key);
    }

    /// Load persisted rows, typically once at startup.
    ///
    /// Counters are summed into any live row; `recent_speed_bps` follows
    /// the newer of the two `last_used` timestamps.
    pub fn merge_persisted(&self, snapshots: impl IntoIterator<Item = ProviderStatSnapshot>) {
        for snap in snapshots {
            let key = (snap.job_key.clone(), snap.provider_index);
            self.rows.entry(key).or_default().merge_persisted(&snap);
        }
    }

    /// The provider this job should be pinned to, if any row qualifies:
    /// success rate at least `best_min_success_rate` and activity within
    /// `best_max_idle`, highest score wins.
    pub fn best_provider(&self, job_key: &str) -> Option<usize> {
        if !self.config.enabled {
            return None;
        }
        self.rows
            .iter()
            .filter(|entry| entry.key().0 == job_key)
            .filter(|entry| {
                let record = entry.value();
                record.success_rate() >= self.config.best_min_success_rate
                    && record
                        .idle_for()
                        .is_some_and(|idle| idle < self.config.best_max_idle)
            })
            .map(|entry| (entry.key().1, score(entry.value())))
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .map(|(index, _)| index)
    }

    /// Order candidate provider indexes for a job, best score first.
    ///
    /// Once every `exploration_ratio` calls the runner-up is promoted to
    /// the front so a transiently faster provider cannot lock the job in
    /// forever. The tick is a shared counter, not a random draw, keeping
    /// the ordering a pure function of (rows, fetch ordinal).
    pub fn rank_providers(&self, job_key: &str, candidates: &[usize]) -> Vec<usize> {
        if !self.config.enabled || candidates.len() < 2 {
            return candidates.to_vec();
        }

        let mut scored: Vec<(usize, f64)> = candidates
            .iter()
            .map(|&index| {
                let s = self
                    .rows
                    .get(&(job_key.to_string(), index))
                    .map_or(0.0, |entry| score(entry.value()));
                (index, s)
            })
            .collect();
        // Stable sort keeps configured order among untried providers.
        scored.sort_by(|a, b| b.1.total_cmp(&a.1));

        let tick = self.ranked_fetches.fetch_add(1, Ordering::Relaxed);
        if self.config.exploration_ratio > 0
            && tick % self.config.exploration_ratio == self.config.exploration_ratio - 1
        {
            scored.swap(0, 1);
            debug!(job_key, "affinity exploration tick: promoting runner-up");
        }

        scored.into_iter().map(|(index, _)| index).collect()
    }

    /// Cloned snapshots of every row belonging to `job_key`.
    pub fn snapshot(&self, job_key: &str) -> Vec<ProviderStatSnapshot> {
        self.rows
            .iter()
            .filter(|entry| entry.key().0 == job_key)
            .map(|entry| ProviderStatSnapshot::from_record(&entry.key().0, entry.key().1, entry.value()))
            .collect()
    }

    /// Cloned snapshots of every row.
    pub fn snapshot_all(&self) -> Vec<ProviderStatSnapshot> {
        self.rows
            .iter()
            .map(|entry| ProviderStatSnapshot::from_record(&entry.key().0, entry.key().1, entry.value()))
            .collect()
    }

    /// Drop all rows for one job.
    pub fn clear(&self, job_key: &str) {
        self.rows.retain(|key, _| key.0 != job_key);
        self.dirty.lock().retain(|key| key.0 != job_key);
    }

    /// Drop everything.
    pub fn clear_all(&self) {
        self.rows.clear();
        self.dirty.lock().clear();
    }

    /// Take the set of rows touched since the last drain, as snapshots.
    /// Used by the flush task; callers re-mark on sink failure to keep
    /// delivery at-least-once.
    pub fn drain_dirty(&self) -> Vec<ProviderStatSnapshot> {
        let keys: Vec<RowKey> = self.dirty.lock().drain().collect();
        keys.into_iter()
            .filter_map(|key| {
                self.rows
                    .get(&key)
                    .map(|entry| ProviderStatSnapshot::from_record(&key.0, key.1, entry.value()))
            })
            .collect()
    }

    /// Re-mark rows as dirty after a failed sink delivery.
    pub fn mark_dirty(&self, snapshots: &[ProviderStatSnapshot]) {
        let mut dirty = self.dirty.lock();
        for snap in snapshots {
            dirty.insert((snap.job_key.clone(), snap.provider_index));
        }
    }
}

impl Default for AffinityTracker {
    fn default() -> Self {
        Self::new(AffinityConfig::default())
    }
}

/// Ranking score: reliability-weighted log throughput.
fn score(record: &StatRecord) -> f64 {
    record.success_rate() * (1.0 + record.recent_speed_bps()).ln()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn success(bytes: u64, ms: u64) -> FetchOutcome {
        FetchOutcome::Success {
            bytes,
            elapsed: Duration::from_millis(ms),
        }
    }

    fn no_exploration() -> AffinityConfig {
        AffinityConfig {
            exploration_ratio: 0,
            ..AffinityConfig::default()
        }
    }

    #[test]
    fn test_rank_prefers_faster_provider() {
        let tracker = AffinityTracker::new(no_exploration());
        // Provider 0: 1 MB/s. Provider 1: 4 MB/s.
        for _ in 0..10 {
            tracker.record("job", 0, success(1_000_000, 1000));
            tracker.record("job", 1, success(4_000_000, 1000));
        }
        assert_eq!(tracker.rank_providers("job", &[0, 1]), vec![1, 0]);
    }

    #[test]
    fn test_rank_penalizes_failures() {
        let tracker = AffinityTracker::new(no_exploration());
        // Same speed, but provider 1 fails half its fetches.
        for _ in 0..10 {
            tracker.record("job", 0, success(1_000_000, 1000));
            tracker.record("job", 1, success(1_000_000, 1000));
            tracker.record("job", 1, FetchOutcome::Failed);
        }
        assert_eq!(tracker.rank_providers("job", &[0, 1]), vec![0, 1]);
    }

    #[test]
    fn test_exploration_promotes_runner_up() {
        let config = AffinityConfig {
            exploration_ratio: 4,
            ..AffinityConfig::default()
        };
        let tracker = AffinityTracker::new(config);
        for _ in 0..10 {
            tracker.record("job", 0, success(4_000_000, 1000));
            tracker.record("job", 1, success(1_000_000, 1000));
        }
        let mut orders = Vec::new();
        for _ in 0..4 {
            orders.push(tracker.rank_providers("job", &[0, 1]));
        }
        // Three exploitation ticks, one exploration tick.
        assert_eq!(orders.iter().filter(|o| *o == &vec![0, 1]).count(), 3);
        assert_eq!(orders.iter().filter(|o| *o == &vec![1, 0]).count(), 1);
    }

    #[test]
    fn test_best_provider_requires_success_rate() {
        let tracker = AffinityTracker::new(no_exploration());
        for _ in 0..4 {
            tracker.record("job", 0, success(1_000_000, 500));
            tracker.record("job", 0, FetchOutcome::Failed);
        }
        // 50% success rate is below the 0.8 bar.
        assert_eq!(tracker.best_provider("job"), None);

        for _ in 0..40 {
            tracker.record("job", 1, success(1_000_000, 500));
        }
        assert_eq!(tracker.best_provider("job"), Some(1));
    }

    #[test]
    fn test_clear_scopes_to_job() {
        let tracker = AffinityTracker::default();
        tracker.record("a", 0, success(1, 1));
        tracker.record("b", 0, success(1, 1));
        tracker.clear("a");
        assert!(tracker.snapshot("a").is_empty());
        assert_eq!(tracker.snapshot("b").len(), 1);
    }

    #[test]
    fn test_merge_persisted_latest_timestamp_wins() {
        let tracker = AffinityTracker::default();
        tracker.record("job", 0, success(1_000, 1000));
        let mut live = tracker.snapshot("job").remove(0);

        // A persisted row from the future carries a different speed.
        live.last_used_unix_ms += 60_000;
        live.recent_speed_bps = 9_999.0;
        live.successful_segments = 5;
        tracker.merge_persisted([live]);

        let merged = tracker.snapshot("job").remove(0);
        assert_eq!(merged.successful_segments, 6);
        // Live window still has samples, so live speed wins on read; the
        // seeded value only matters for rows without live samples.
        tracker.clear_all();
        let mut seeded = ProviderStatSnapshot {
            job_key: "cold".to_string(),
            provider_index: 1,
            successful_segments: 10,
            failed_segments: 0,
            timeout_errors: 0,
            missing_errors: 0,
            total_bytes: 1_000_000,
            total_time_ms: 1_000,
            last_used_unix_ms: 1,
            recent_speed_bps: 1234.5,
        };
        tracker.merge_persisted([seeded.clone()]);
        seeded = tracker.snapshot("cold").remove(0);
        assert!((seeded.recent_speed_bps - 1234.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_drain_dirty_at_least_once() {
        let tracker = AffinityTracker::default();
        tracker.record("job", 0, success(1, 1));
        let drained = tracker.drain_dirty();
        assert_eq!(drained.len(), 1);
        assert!(tracker.drain_dirty().is_empty());

        // A failed delivery re-marks the rows.
        tracker.mark_dirty(&drained);
        assert_eq!(tracker.drain_dirty().len(), 1);
    }

    #[test]
    fn test_disabled_tracker_keeps_configured_order() {
        let config = AffinityConfig {
            enabled: false,
            ..AffinityConfig::default()
        };
        let tracker = AffinityTracker::new(config);
        for _ in 0..10 {
            tracker.record("job", 1, success(8_000_000, 100));
        }
        assert_eq!(tracker.rank_providers("job", &[0, 1, 2]), vec![0, 1, 2]);
        assert_eq!(tracker.best_provider("job"), None);
    }
}
