//! Article retrieval with retry and provider failover
//!
//! One `fetch` call hides the whole provider dance: candidate ordering by
//! affinity, transient retries with exponential backoff on the same
//! provider, failover across the provider tiers, circuit-breaker upkeep,
//! and stat/bandwidth/event recording for every attempt.

use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use nzbfs_stats::{
    AffinityTracker, BandwidthMeter, FetchEvent, FetchEventSink, FetchOutcome, TracingEventSink,
};

use crate::error::{Error, ErrorKind, Result};
use crate::gate::PlaybackGate;
use crate::pool::ConnectionPool;
use crate::types::{MsgId, ProviderRole, UsageContext, UsageKind};

/// Default per-article deadline, `BODY` command to end of body
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(60);

/// Default transient retries per provider
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff in milliseconds
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff in milliseconds
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default backoff multiplier
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (0.0 to 1.0)
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Fetcher tuning knobs
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    /// Per-article deadline measured from `BODY` to end of body
    pub operation_timeout: Duration,
    /// Transient retries per provider before failing over
    pub max_retries: u32,
    /// Base delay before the first retry
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    pub max_backoff_ms: u64,
    /// Backoff growth factor
    pub backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            operation_timeout: DEFAULT_OPERATION_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
        }
    }
}

/// Retrieves decoded article payloads by message-id.
#[derive(Clone)]
pub struct ArticleFetcher {
    pool: Arc<ConnectionPool>,
    affinity: Arc<AffinityTracker>,
    bandwidth: Arc<BandwidthMeter>,
    gate: Arc<PlaybackGate>,
    events: Arc<dyn FetchEventSink>,
    config: FetcherConfig,
}

impl ArticleFetcher {
    /// Fetcher over `pool` with default affinity tracking, bandwidth
    /// metering, playback gate, and a tracing event sink.
    pub fn new(pool: Arc<ConnectionPool>) -> Self {
        let provider_count = pool.providers().count();
        Self {
            pool,
            affinity: Arc::new(AffinityTracker::default()),
            bandwidth: Arc::new(BandwidthMeter::new(provider_count)),
            gate: Arc::new(PlaybackGate::new()),
            events: Arc::new(TracingEventSink),
            config: FetcherConfig::default(),
        }
    }

    /// Share an affinity tracker (e.g. one preloaded from persistence).
    #[must_use]
    pub fn with_affinity(mut self, affinity: Arc<AffinityTracker>) -> Self {
        self.affinity = affinity;
        self
    }

    /// Share a bandwidth meter.
    #[must_use]
    pub fn with_bandwidth(mut self, bandwidth: Arc<BandwidthMeter>) -> Self {
        self.bandwidth = bandwidth;
        self
    }

    /// Share a playback gate.
    #[must_use]
    pub fn with_gate(mut self, gate: Arc<PlaybackGate>) -> Self {
        self.gate = gate;
        self
    }

    /// Replace the fetch event sink.
    #[must_use]
    pub fn with_event_sink(mut self, events: Arc<dyn FetchEventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the tuning knobs.
    #[must_use]
    pub fn with_config(mut self, config: FetcherConfig) -> Self {
        self.config = config;
        self
    }

    /// The pool this fetcher borrows from.
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// The affinity tracker recording per-job provider performance.
    pub fn affinity(&self) -> &Arc<AffinityTracker> {
        &self.affinity
    }

    /// The bandwidth meter.
    pub fn bandwidth(&self) -> &Arc<BandwidthMeter> {
        &self.bandwidth
    }

    /// The playback gate.
    pub fn gate(&self) -> &Arc<PlaybackGate> {
        &self.gate
    }

    /// Retrieve and decode one article.
    ///
    /// Providers are tried in affinity order: the job's pinned provider
    /// first (when its record qualifies), then `Pool` providers by score,
    /// then `BackupAndStats`, then `BackupOnly`. Transient failures retry
    /// on the same provider with exponential backoff before failing over;
    /// a 430 moves on immediately.
    ///
    /// Fails with [`Error::ArticleNotFound`] when at least one provider
    /// authoritatively reported the article missing and none could serve
    /// it, [`Error::ArticleUnavailable`] otherwise.
    #[instrument(skip(self, ctx, cancel), fields(msg_id = %msg_id))]
    pub async fn fetch(
        &self,
        msg_id: &MsgId,
        ctx: &UsageContext,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let kind = self.gate.classify(ctx);
        let affinity_key = ctx.affinity_key();
        let candidates = self.candidate_order(kind, affinity_key);

        let mut saw_missing = false;
        let mut attempted = 0usize;
        let mut decode_failures = 0usize;
        let mut last_error: Option<Error> = None;

        for provider_index in candidates {
            let Some(breaker) = self.pool.breaker(provider_index) else {
                continue;
            };
            if !breaker.allow() {
                debug!(provider = provider_index, "skipping provider, circuit open");
                continue;
            }
            attempted += 1;

            match self
                .fetch_from_provider(provider_index, msg_id, kind, affinity_key, cancel)
                .await
            {
                Ok(bytes) => {
                    breaker.record_success();
                    return Ok(bytes);
                }
                Err(e) => {
                    match e.kind() {
                        ErrorKind::Cancelled | ErrorKind::Fatal => return Err(e),
                        ErrorKind::ArticleMissing => {
                            // The provider answered; only this article is gone.
                            breaker.record_success();
                            saw_missing = true;
                        }
                        ErrorKind::ArticleRefused => breaker.record_success(),
                        ErrorKind::AuthFailed | ErrorKind::OverLimit => {
                            if let Some(backoff) = e.kind().breaker_backoff() {
                                breaker.trip_for(backoff);
                            }
                        }
                        ErrorKind::Transient => {
                            if matches!(e, Error::Decode(_)) {
                                decode_failures += 1;
                            }
                            breaker.record_failure();
                        }
                    }
                    warn!(provider = provider_index, error = %e, "provider failed, advancing");
                    last_error = Some(e);
                }
            }
        }

        if saw_missing {
            return Err(Error::ArticleNotFound {
                msg_id: msg_id.clone(),
            });
        }
        let all_decode = attempted > 0 && decode_failures == attempted;
        match last_error {
            // Every provider served bytes that would not decode: the
            // posting itself is bad, not the providers.
            Some(e @ Error::Decode(_)) if all_decode => Err(e),
            Some(e) => Err(Error::ArticleUnavailable {
                msg_id: msg_id.clone(),
                reason: e.to_string(),
            }),
            None => Err(Error::ArticleUnavailable {
                msg_id: msg_id.clone(),
                reason: "all providers circuit-open or disabled".to_string(),
            }),
        }
    }

    /// Ordered candidate provider list for one fetch.
    fn candidate_order(&self, kind: UsageKind, affinity_key: Option<&str>) -> Vec<usize> {
        let role_indexes = |role: ProviderRole| -> Vec<usize> {
            self.pool
                .providers()
                .filter(|p| p.role == role)
                .map(|p| p.index)
                .collect()
        };

        let pool_tier = role_indexes(ProviderRole::Pool);
        let mut ordered = match affinity_key {
            Some(key) => self.affinity.rank_providers(key, &pool_tier),
            None => pool_tier,
        };

        // Interactive traffic sticks to the provider that has been serving
        // this job well, when one qualifies.
        if matches!(kind, UsageKind::Streaming | UsageKind::PlaybackVerified)
            && let Some(key) = affinity_key
            && let Some(best) = self.affinity.best_provider(key)
            && let Some(position) = ordered.iter().position(|&i| i == best)
        {
            ordered[..=position].rotate_right(1);
        }

        ordered.extend(role_indexes(ProviderRole::BackupAndStats));
        ordered.extend(role_indexes(ProviderRole::BackupOnly));
        ordered
    }

    /// Try one provider: borrow, `BODY`, decode, with transient retries.
    async fn fetch_from_provider(
        &self,
        provider_index: usize,
        msg_id: &MsgId,
        kind: UsageKind,
        affinity_key: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<Bytes> {
        let mut last_error: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let backoff = retry_delay(&self.config, attempt - 1);
                debug!(
                    provider = provider_index,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "retrying after backoff"
                );
                tokio::select! {
                    () = cancel.cancelled() => return Err(Error::Cancelled),
                    () = sleep(backoff) => {}
                }
            }

            let mut conn = self.pool.borrow(provider_index, kind, cancel).await?;
            let start = Instant::now();

            // Scoped so the BODY future's borrow of the connection ends
            // before the cancellation path touches it.
            let outcome = {
                let body = timeout(self.config.operation_timeout, conn.body(msg_id));
                tokio::pin!(body);
                tokio::select! {
                    () = cancel.cancelled() => None,
                    outcome = &mut body => Some(outcome),
                }
            };
            let Some(outcome) = outcome else {
                // Abort the in-flight BODY by destroying the session.
                conn.mark_broken();
                return Err(Error::Cancelled);
            };
            let error = match outcome {
                Ok(Ok(raw)) => match yenc_codec::decode(&raw) {
                    Ok(decoded) => {
                        let elapsed = start.elapsed();
                        let bytes = decoded.data.len() as u64;
                        self.record(
                            provider_index,
                            msg_id,
                            affinity_key,
                            kind,
                            FetchOutcome::Success { bytes, elapsed },
                            "success",
                        );
                        return Ok(decoded.data);
                    }
                    Err(e) => {
                        // Served garbage: the transfer may have been
                        // corrupted, so the session is suspect too.
                        conn.mark_broken();
                        Error::Decode(e)
                    }
                },
                Ok(Err(e)) => {
                    if e.kind().poisons_connection() {
                        conn.mark_broken();
                    }
                    e
                }
                Err(_elapsed) => {
                    // Abort the in-flight BODY by destroying the session.
                    conn.mark_broken();
                    Error::OperationTimeout {
                        timeout_secs: self.config.operation_timeout.as_secs(),
                    }
                }
            };
            drop(conn);

            let outcome = match error.kind() {
                ErrorKind::ArticleMissing => FetchOutcome::Missing,
                ErrorKind::Transient
                    if matches!(error, Error::OperationTimeout { .. }) =>
                {
                    FetchOutcome::Timeout
                }
                _ => FetchOutcome::Failed,
            };
            self.record(
                provider_index,
                msg_id,
                affinity_key,
                kind,
                outcome,
                error.outcome_label(),
            );

            if !error.kind().retry_same_provider() {
                return Err(error);
            }
            last_error = Some(error);
        }

        Err(last_error.unwrap_or(Error::ArticleUnavailable {
            msg_id: msg_id.clone(),
            reason: "retries exhausted".to_string(),
        }))
    }

    /// Record one attempt into affinity, bandwidth, and the event sink.
    fn record(
        &self,
        provider_index: usize,
        msg_id: &MsgId,
        affinity_key: Option<&str>,
        kind: UsageKind,
        outcome: FetchOutcome,
        label: &str,
    ) {
        if let Some(key) = affinity_key {
            self.affinity.record(key, provider_index, outcome);
        }
        let (bytes, elapsed_ms) = match outcome {
            FetchOutcome::Success { bytes, elapsed } => (bytes, elapsed.as_millis() as u64),
            _ => (0, 0),
        };
        if bytes > 0 {
            self.bandwidth.record(provider_index, bytes);
        }
        self.events.on_fetch(&FetchEvent {
            provider_index,
            msg_id: msg_id.to_string(),
            outcome: label.to_string(),
            bytes,
            elapsed_ms,
            usage: kind,
            job_key: affinity_key.map(str::to_string),
        });
    }

}

/// Delay before retry number `attempt` against the same provider:
/// geometric growth from the configured base, capped at the ceiling, then
/// scaled by a random factor in `[1 - jitter, 1 + jitter]` so retries from
/// concurrent streams do not land in lockstep.
#[allow(
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss
)]
fn retry_delay(config: &FetcherConfig, attempt: u32) -> Duration {
    let ceiling = config.max_backoff_ms as f64;
    let grown =
        config.initial_backoff_ms as f64 * config.backoff_multiplier.powi(attempt as i32);
    let mut delay_ms = grown.min(ceiling);
    if config.jitter_factor > 0.0 {
        let nudge = 1.0 + config.jitter_factor * (2.0 * rand::random::<f64>() - 1.0);
        delay_ms = (delay_ms * nudge).clamp(0.0, ceiling);
    }
    Duration::from_millis(delay_ms as u64)
}

impl std::fmt::Debug for ArticleFetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArticleFetcher")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
