//! Outbound contracts: stat persistence and per-fetch telemetry events

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::UsageKind;
use crate::affinity::AffinityTracker;
use crate::record::ProviderStatSnapshot;

/// Error delivering records to an external sink
#[derive(Debug, Error)]
pub enum SinkError {
    /// The sink cannot currently accept records
    #[error("stats sink unavailable: {reason}")]
    Unavailable {
        /// Why delivery failed
        reason: String,
    },

    /// IO error while delivering
    #[error("sink IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl SinkError {
    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

/// Destination for persisted stat rows.
///
/// Implementations must accept idempotent upserts; the core delivers each
/// dirty row at least once.
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Upsert a batch of row snapshots.
    async fn upsert(&self, rows: Vec<ProviderStatSnapshot>) -> Result<(), SinkError>;
}

/// A sink that discards everything (the default when persistence is not
/// wired up).
#[derive(Debug, Default, Clone, Copy)]
pub struct NullStatsSink;

#[async_trait]
impl StatsSink for NullStatsSink {
    async fn upsert(&self, _rows: Vec<ProviderStatSnapshot>) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Structured record of one fetch attempt, emitted for every attempt
/// regardless of outcome
#[derive(Debug, Clone, Serialize)]
pub struct FetchEvent {
    /// Provider the attempt ran against
    pub provider_index: usize,
    /// Article that was requested
    pub msg_id: String,
    /// Outcome label (`success`, `missing`, `refused`, `timeout`, ...)
    pub outcome: String,
    /// Decoded payload bytes (0 on failure)
    pub bytes: u64,
    /// Wall time of the attempt
    pub elapsed_ms: u64,
    /// Traffic class of the requesting context
    pub usage: UsageKind,
    /// Job the request belonged to, when known
    pub job_key: Option<String>,
}

/// Receiver for [`FetchEvent`]s
pub trait FetchEventSink: Send + Sync {
    /// Observe one fetch attempt. Must not block.
    fn on_fetch(&self, event: &FetchEvent);
}

/// Default event sink: emits each event as a `tracing` debug record.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEventSink;

impl FetchEventSink for TracingEventSink {
    fn on_fetch(&self, event: &FetchEvent) {
        debug!(
            provider = event.provider_index,
            msg_id = %event.msg_id,
            outcome = %event.outcome,
            bytes = event.bytes,
            elapsed_ms = event.elapsed_ms,
            usage = event.usage.as_str(),
            job_key = event.job_key.as_deref().unwrap_or(""),
            "fetch attempt"
        );
    }
}

/// Spawn the periodic flush task that drains dirty affinity rows into the
/// sink. Delivery is at-least-once: a failed upsert re-marks its rows and
/// they ride along with the next interval.
///
/// The task performs one final flush when `cancel` fires, then exits.
pub fn spawn_stats_flush(
    tracker: Arc<AffinityTracker>,
    sink: Arc<dyn StatsSink>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    flush_once(&tracker, sink.as_ref()).await;
                    return;
                }
                () = tokio::time::sleep(interval) => {
                    flush_once(&tracker, sink.as_ref()).await;
                }
            }
        }
    })
}

async fn flush_once(tracker: &AffinityTracker, sink: &dyn StatsSink) {
    let rows = tracker.drain_dirty();
    if rows.is_empty() {
        return;
    }
    let count = rows.len();
    if let Err(e) = sink.upsert(rows.clone()).await {
        warn!(rows = count, error = %e, "stats flush failed; will retry");
        tracker.mark_dirty(&rows);
    } else {
        debug!(rows = count, "flushed stat rows");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::FetchOutcome;
    use parking_lot::Mutex;

    struct CollectingSink {
        batches: Mutex<Vec<Vec<ProviderStatSnapshot>>>,
        fail_first: Mutex<bool>,
    }

    #[async_trait]
    impl StatsSink for CollectingSink {
        async fn upsert(&self, rows: Vec<ProviderStatSnapshot>) -> Result<(), SinkError> {
            let mut fail = self.fail_first.lock();
            if *fail {
                *fail = false;
                return Err(SinkError::unavailable("first delivery rejected"));
            }
            self.batches.lock().push(rows);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_retries_failed_batches() {
        let tracker = Arc::new(AffinityTracker::default());
        let sink = Arc::new(CollectingSink {
            batches: Mutex::new(Vec::new()),
            fail_first: Mutex::new(true),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_stats_flush(
            tracker.clone(),
            sink.clone(),
            Duration::from_secs(5),
            cancel.clone(),
        );

        tracker.record(
            "job",
            0,
            FetchOutcome::Success {
                bytes: 100,
                elapsed: Duration::from_millis(10),
            },
        );

        // First interval fails, second succeeds with the same row.
        tokio::time::sleep(Duration::from_secs(11)).await;
        cancel.cancel();
        handle.await.unwrap();

        let batches = sink.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].job_key, "job");
    }

    #[tokio::test]
    async fn test_cancel_performs_final_flush() {
        let tracker = Arc::new(AffinityTracker::default());
        let sink = Arc::new(CollectingSink {
            batches: Mutex::new(Vec::new()),
            fail_first: Mutex::new(false),
        });
        let cancel = CancellationToken::new();
        let handle = spawn_stats_flush(
            tracker.clone(),
            sink.clone(),
            Duration::from_secs(3600),
            cancel.clone(),
        );

        tracker.record(
            "job",
            1,
            FetchOutcome::Success {
                bytes: 5,
                elapsed: Duration::from_millis(1),
            },
        );
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(sink.batches.lock().len(), 1);
    }
}
