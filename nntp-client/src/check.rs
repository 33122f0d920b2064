//! Segment presence sweeps for the external health-check subsystem

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::error::{Error, ErrorKind, Result};
use crate::fetcher::ArticleFetcher;
use crate::types::{MsgId, ProviderRole, UsageKind};

/// Result of a segment presence sweep
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// Every segment was found on at least one provider
    AllPresent,
    /// Sweep stopped at the first segment no provider carries
    Missing {
        /// The absent segment
        msg_id: MsgId,
    },
}

impl ArticleFetcher {
    /// Check that every segment exists on at least one provider, with up to
    /// `concurrency` probes in flight.
    ///
    /// Resolves with the first missing segment, or [`CheckOutcome::AllPresent`]
    /// once every id has been confirmed. `use_head` switches the probe from
    /// `STAT` to `HEAD`, which forces providers to actually produce the
    /// headers instead of answering from their index.
    ///
    /// Probes run as health-check traffic, so they queue behind the
    /// health-check admission budget and cannot crowd out playback.
    #[instrument(skip(self, segment_ids, cancel), fields(segments = segment_ids.len()))]
    pub async fn check_segments(
        &self,
        segment_ids: &[MsgId],
        concurrency: usize,
        use_head: bool,
        cancel: &CancellationToken,
    ) -> Result<CheckOutcome> {
        let concurrency = concurrency.max(1);
        let mut probes = futures::stream::iter(segment_ids.iter().map(|msg_id| {
            let msg_id = msg_id.clone();
            async move {
                let present = self.probe(&msg_id, use_head, cancel).await?;
                Ok::<(MsgId, bool), Error>((msg_id, present))
            }
        }))
        .buffer_unordered(concurrency);

        while let Some(result) = probes.next().await {
            let (msg_id, present) = result?;
            if !present {
                debug!(%msg_id, "segment missing on all providers");
                return Ok(CheckOutcome::Missing { msg_id });
            }
        }
        Ok(CheckOutcome::AllPresent)
    }

    /// Ask providers whether they carry one article. Pool providers first,
    /// then the stat-participating backups; a `true` from anyone settles
    /// it.
    async fn probe(
        &self,
        msg_id: &MsgId,
        use_head: bool,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let candidates: Vec<usize> = self
            .pool()
            .providers()
            .filter(|p| matches!(p.role, ProviderRole::Pool | ProviderRole::BackupAndStats))
            .map(|p| p.index)
            .collect();

        let mut last_error: Option<Error> = None;
        for provider_index in candidates {
            if self
                .pool()
                .breaker(provider_index)
                .is_none_or(|b| !b.allow())
            {
                continue;
            }
            let mut conn = self
                .pool()
                .borrow(provider_index, UsageKind::HealthCheck, cancel)
                .await?;
            let outcome = if use_head {
                conn.head(msg_id).await
            } else {
                conn.stat(msg_id).await
            };
            match outcome {
                Ok(true) => {
                    self.breaker_ok(provider_index);
                    return Ok(true);
                }
                Ok(false) => {
                    self.breaker_ok(provider_index);
                }
                Err(e) if e.kind() == ErrorKind::Cancelled => return Err(e),
                Err(e) => {
                    if e.kind().poisons_connection() {
                        conn.mark_broken();
                    }
                    if let Some(breaker) = self.pool().breaker(provider_index) {
                        breaker.record_failure();
                    }
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            // Every provider answered and none carries the article.
            None => Ok(false),
            Some(e) => Err(e),
        }
    }

    fn breaker_ok(&self, provider_index: usize) {
        if let Some(breaker) = self.pool().breaker(provider_index) {
            breaker.record_success();
        }
    }
}
