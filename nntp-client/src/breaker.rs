//! Per-provider circuit breaker

use parking_lot::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Consecutive failures before the circuit trips
const DEFAULT_TRIP_THRESHOLD: u32 = 5;

/// How long a tripped circuit stays open before half-opening
const DEFAULT_OPEN_FOR: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct BreakerState {
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    open_for: Duration,
    /// One probe is allowed through while half-open
    probe_outstanding: bool,
}

/// Trips open after a run of consecutive failures, half-opens after a
/// backoff to let a single probe through, and closes again on one success.
///
/// Failures with a dedicated penalty (auth rejection, provider connection
/// limits) trip the circuit immediately for their own backoff via
/// [`CircuitBreaker::trip_for`].
#[derive(Debug)]
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    provider_index: usize,
}

impl CircuitBreaker {
    /// Breaker with default threshold and backoff.
    pub fn new(provider_index: usize) -> Self {
        Self {
            state: Mutex::new(BreakerState {
                consecutive_failures: 0,
                opened_at: None,
                open_for: DEFAULT_OPEN_FOR,
                probe_outstanding: false,
            }),
            threshold: DEFAULT_TRIP_THRESHOLD,
            provider_index,
        }
    }

    /// Whether a request may proceed. While half-open, exactly one caller
    /// gets `true` (the probe); the rest keep seeing the circuit as open
    /// until the probe reports back.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened_at) => {
                if opened_at.elapsed() < state.open_for {
                    false
                } else if state.probe_outstanding {
                    false
                } else {
                    state.probe_outstanding = true;
                    debug!(provider = self.provider_index, "circuit half-open, probing");
                    true
                }
            }
        }
    }

    /// A request succeeded: close the circuit.
    pub fn record_success(&self) {
        let mut state = self.state.lock();
        if state.opened_at.is_some() {
            debug!(provider = self.provider_index, "circuit closed");
        }
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.probe_outstanding = false;
    }

    /// A request failed: count it, tripping the circuit at the threshold.
    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        state.probe_outstanding = false;
        state.consecutive_failures += 1;
        if state.consecutive_failures >= self.threshold && state.opened_at.is_none() {
            state.open_for = DEFAULT_OPEN_FOR;
            state.opened_at = Some(Instant::now());
            debug!(
                provider = self.provider_index,
                failures = state.consecutive_failures,
                "circuit opened"
            );
        } else if state.opened_at.is_some() {
            // Failed probe: re-open for another backoff.
            state.opened_at = Some(Instant::now());
        }
    }

    /// Trip the circuit immediately for a specific backoff (auth failures,
    /// provider connection limits).
    pub fn trip_for(&self, backoff: Duration) {
        let mut state = self.state.lock();
        state.open_for = backoff;
        state.opened_at = Some(Instant::now());
        state.probe_outstanding = false;
        debug!(
            provider = self.provider_index,
            backoff_ms = backoff.as_millis() as u64,
            "circuit tripped"
        );
    }

    /// Whether the circuit is currently refusing requests.
    pub fn is_open(&self) -> bool {
        let state = self.state.lock();
        state
            .opened_at
            .is_some_and(|at| at.elapsed() < state.open_for)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trips_after_threshold() {
        let breaker = CircuitBreaker::new(0);
        for _ in 0..DEFAULT_TRIP_THRESHOLD - 1 {
            breaker.record_failure();
            assert!(breaker.allow());
        }
        breaker.record_failure();
        assert!(!breaker.allow());
        assert!(breaker.is_open());
    }

    #[test]
    fn test_success_resets_count() {
        let breaker = CircuitBreaker::new(0);
        for _ in 0..DEFAULT_TRIP_THRESHOLD - 1 {
            breaker.record_failure();
        }
        breaker.record_success();
        for _ in 0..DEFAULT_TRIP_THRESHOLD - 1 {
            breaker.record_failure();
        }
        assert!(breaker.allow());
    }

    #[test]
    fn test_trip_for_and_recover() {
        let breaker = CircuitBreaker::new(1);
        breaker.trip_for(Duration::from_millis(10));
        assert!(!breaker.allow());
        std::thread::sleep(Duration::from_millis(20));
        // Half-open: first caller probes, second is still refused.
        assert!(breaker.allow());
        assert!(!breaker.allow());
        breaker.record_success();
        assert!(breaker.allow());
    }

    #[test]
    fn test_failed_probe_reopens() {
        let breaker = CircuitBreaker::new(2);
        breaker.trip_for(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(20));
        assert!(breaker.allow());
        breaker.record_failure();
        assert!(!breaker.allow());
    }
}
