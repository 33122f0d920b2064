//! Per-(job, provider) stat records with a rolling sample window

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Number of most-recent fetches that contribute to `recent_speed_bps`
pub(crate) const WINDOW_SIZE: usize = 256;

/// Outcome of a single article fetch attempt against one provider
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Article retrieved and decoded
    Success {
        /// Decoded payload size
        bytes: u64,
        /// Wall time from command to decoded payload
        elapsed: Duration,
    },
    /// Provider reported the article missing (430)
    Missing,
    /// Attempt exceeded the operation deadline
    Timeout,
    /// Any other failure (socket error, refused command, decode error)
    Failed,
}

impl FetchOutcome {
    /// Whether this outcome counts as a successful segment.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    bytes: u64,
    elapsed: Duration,
    success: bool,
}

/// Rolling stat record for one `(job, provider)` pair.
///
/// Counters are cumulative over the record's lifetime; `recent_speed_bps`
/// derives from the last [`WINDOW_SIZE`] fetches only.
#[derive(Debug, Clone)]
pub struct StatRecord {
    /// Articles fetched and decoded successfully
    pub successful_segments: u64,
    /// Articles that failed on this provider for any reason
    pub failed_segments: u64,
    /// Failures that were operation timeouts
    pub timeout_errors: u64,
    /// Failures where the provider reported the article missing
    pub missing_errors: u64,
    /// Total decoded bytes served
    pub total_bytes: u64,
    /// Total wall time spent on successful fetches
    pub total_time_ms: u64,
    /// When this provider last served or failed a fetch for the job
    pub last_used: Option<Instant>,
    /// Unix timestamp (ms) of `last_used`, for persistence
    pub last_used_unix_ms: u64,
    window: VecDeque<Sample>,
    /// Speed carried over from a persisted row, used until live samples
    /// exist for this process lifetime
    seed_speed_bps: Option<f64>,
}

impl Default for StatRecord {
    fn default() -> Self {
        Self {
            successful_segments: 0,
            failed_segments: 0,
            timeout_errors: 0,
            missing_errors: 0,
            total_bytes: 0,
            total_time_ms: 0,
            last_used: None,
            last_used_unix_ms: 0,
            window: VecDeque::with_capacity(WINDOW_SIZE),
            seed_speed_bps: None,
        }
    }
}

impl StatRecord {
    /// Fold one fetch outcome into the record.
    pub fn record(&mut self, outcome: FetchOutcome) {
        let sample = match outcome {
            FetchOutcome::Success { bytes, elapsed } => {
                self.successful_segments += 1;
                self.total_bytes += bytes;
                self.total_time_ms += elapsed.as_millis() as u64;
                Sample {
                    bytes,
                    elapsed,
                    success: true,
                }
            }
            FetchOutcome::Missing => {
                self.failed_segments += 1;
                self.missing_errors += 1;
                Sample {
                    bytes: 0,
                    elapsed: Duration::ZERO,
                    success: false,
                }
            }
            FetchOutcome::Timeout => {
                self.failed_segments += 1;
                self.timeout_errors += 1;
                Sample {
                    bytes: 0,
                    elapsed: Duration::ZERO,
                    success: false,
                }
            }
            FetchOutcome::Failed => {
                self.failed_segments += 1;
                Sample {
                    bytes: 0,
                    elapsed: Duration::ZERO,
                    success: false,
                }
            }
        };

        if self.window.len() == WINDOW_SIZE {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        self.last_used = Some(Instant::now());
        self.last_used_unix_ms = unix_ms_now();
    }

    /// Fraction of attempts that succeeded, over the record's lifetime.
    /// 1.0 when no attempts have been made (an unknown provider is not
    /// penalized).
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_segments + self.failed_segments;
        if total == 0 {
            return 1.0;
        }
        self.successful_segments as f64 / total as f64
    }

    /// Bytes per second over the recent sample window.
    ///
    /// Falls back to the speed carried over from a persisted row until this
    /// process has observed a successful fetch of its own.
    pub fn recent_speed_bps(&self) -> f64 {
        let (bytes, elapsed): (u64, Duration) = self
            .window
            .iter()
            .filter(|s| s.success)
            .fold((0, Duration::ZERO), |(b, t), s| (b + s.bytes, t + s.elapsed));
        let secs = elapsed.as_secs_f64();
        if secs <= 0.0 {
            return self.seed_speed_bps.unwrap_or(0.0);
        }
        bytes as f64 / secs
    }

    /// Fold a persisted row into this record: counters are summed, and for
    /// `recent_speed_bps` the row with the newer `last_used` timestamp wins.
    pub fn merge_persisted(&mut self, snap: &ProviderStatSnapshot) {
        self.successful_segments += snap.successful_segments;
        self.failed_segments += snap.failed_segments;
        self.timeout_errors += snap.timeout_errors;
        self.missing_errors += snap.missing_errors;
        self.total_bytes += snap.total_bytes;
        self.total_time_ms += snap.total_time_ms;
        if snap.last_used_unix_ms > self.last_used_unix_ms {
            self.last_used_unix_ms = snap.last_used_unix_ms;
            self.seed_speed_bps = Some(snap.recent_speed_bps);
        }
    }

    /// How long ago this record was last touched.
    pub fn idle_for(&self) -> Option<Duration> {
        self.last_used.map(|t| t.elapsed())
    }
}

/// Cloned, serializable view of a [`StatRecord`] for reads and persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderStatSnapshot {
    /// Job this row belongs to
    pub job_key: String,
    /// Provider index within the configured provider list
    pub provider_index: usize,
    /// Articles fetched and decoded successfully
    pub successful_segments: u64,
    /// Articles that failed on this provider
    pub failed_segments: u64,
    /// Failures that were operation timeouts
    pub timeout_errors: u64,
    /// Failures where the provider reported the article missing
    pub missing_errors: u64,
    /// Total decoded bytes served
    pub total_bytes: u64,
    /// Total wall time spent on successful fetches
    pub total_time_ms: u64,
    /// Unix timestamp (ms) of the last fetch against this row
    pub last_used_unix_ms: u64,
    /// Bytes per second over the recent sample window
    pub recent_speed_bps: f64,
}

impl ProviderStatSnapshot {
    pub(crate) fn from_record(job_key: &str, provider_index: usize, record: &StatRecord) -> Self {
        Self {
            job_key: job_key.to_string(),
            provider_index,
            successful_segments: record.successful_segments,
            failed_segments: record.failed_segments,
            timeout_errors: record.timeout_errors,
            missing_errors: record.missing_errors,
            total_bytes: record.total_bytes,
            total_time_ms: record.total_time_ms,
            last_used_unix_ms: record.last_used_unix_ms,
            recent_speed_bps: record.recent_speed_bps(),
        }
    }

    /// Fraction of attempts that succeeded.
    pub fn success_rate(&self) -> f64 {
        let total = self.successful_segments + self.failed_segments;
        if total == 0 {
            return 1.0;
        }
        self.successful_segments as f64 / total as f64
    }
}

pub(crate) fn unix_ms_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
