//! Out-of-order segment prefetching with in-order delivery
//!
//! The reader walks an ordered segment list, keeping up to a window of
//! fetches in flight. Articles complete in whatever order the providers
//! serve them; delivery order is restored at the `read` boundary. A
//! per-stream semaphore bounds how many fetches may hold pool connections
//! at once, and every in-flight task can be aborted while it is still
//! waiting on the pool.

use async_trait::async_trait;
use bytes::Bytes;
use nntp_client::{ArticleFetcher, UsageContext};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::descriptor::SegmentDescriptor;
use crate::error::{Error, Result};
use crate::transform::ByteStream;

/// Prefetch window multiplier over the connection budget
const WINDOW_FACTOR: usize = 5;

/// Reads the decoded concatenation of an ordered segment list.
pub struct SegmentReader {
    fetcher: Arc<ArticleFetcher>,
    ctx: UsageContext,
    segments: Arc<Vec<SegmentDescriptor>>,
    /// Byte offset of each segment within the concatenation, one entry per
    /// segment plus the total; `None` when any size hint is missing
    offsets: Option<Arc<Vec<u64>>>,
    cancel: CancellationToken,
    budget: Arc<Semaphore>,
    prefetch_window: usize,

    /// Index of the segment the next emitted byte comes from
    next_to_emit: usize,
    /// Next segment index the top-up loop considers fetching
    next_to_fetch: usize,
    /// Payload currently being emitted and how much of it is consumed
    current: Option<(Bytes, usize)>,
    /// Bytes to discard before emitting, set by mid-segment seeks
    skip: u64,
    /// Completed fetches not yet consumed
    ready: HashMap<usize, Result<Bytes>>,
    /// In-flight fetches, abortable individually
    pending: HashMap<usize, AbortHandle>,
    tasks: JoinSet<(usize, Result<Bytes>)>,
}

impl SegmentReader {
    /// Reader over `segments`, fetching through `fetcher` as `ctx`.
    ///
    /// `budget` caps this stream's concurrent fetches; the prefetch window
    /// is five times the budget, clamped to `window_cap` and the segment
    /// count. Nothing is fetched until the first read.
    pub fn new(
        fetcher: Arc<ArticleFetcher>,
        ctx: UsageContext,
        segments: Vec<SegmentDescriptor>,
        budget: Arc<Semaphore>,
        budget_size: usize,
        window_cap: usize,
        cancel: CancellationToken,
    ) -> Self {
        let offsets = segments
            .iter()
            .try_fold(vec![0u64], |mut acc, segment| {
                let size = segment.size_hint?;
                acc.push(acc.last().copied().unwrap_or(0) + size);
                Some(acc)
            })
            .map(Arc::new);

        let prefetch_window = (budget_size.max(1) * WINDOW_FACTOR)
            .min(window_cap.max(1))
            .min(segments.len().max(1));

        Self {
            fetcher,
            ctx,
            segments: Arc::new(segments),
            offsets,
            cancel,
            budget,
            prefetch_window,
            next_to_emit: 0,
            next_to_fetch: 0,
            current: None,
            skip: 0,
            ready: HashMap::new(),
            pending: HashMap::new(),
            tasks: JoinSet::new(),
        }
    }

    /// Segment index and intra-segment offset for a byte offset.
    fn locate(&self, position: u64) -> Result<(usize, u64)> {
        let offsets = self
            .offsets
            .as_ref()
            .ok_or_else(|| Error::not_supported("stream has no exact segment sizes"))?;
        let total = *offsets.last().unwrap_or(&0);
        if position >= total {
            // Position exactly at the end parks the reader past the last
            // segment; anything further is the caller's mistake.
            return Ok((self.segments.len(), 0));
        }
        let index = match offsets.binary_search(&position) {
            Ok(i) => i,
            Err(i) => i - 1,
        };
        Ok((index, position - offsets[index]))
    }

    /// Launch fetches until the window is full.
    fn top_up(&mut self) {
        while self.pending.len() + self.ready.len() < self.prefetch_window
            && self.next_to_fetch < self.segments.len()
        {
            let index = self.next_to_fetch;
            self.next_to_fetch += 1;
            if self.ready.contains_key(&index) || self.pending.contains_key(&index) {
                continue;
            }
            let fetcher = Arc::clone(&self.fetcher);
            let ctx = self.ctx.clone();
            let segments = Arc::clone(&self.segments);
            let budget = Arc::clone(&self.budget);
            let cancel = self.cancel.clone();
            let handle = self.tasks.spawn(async move {
                // Hold a budget slot for the whole fetch; an abort while
                // waiting here is what makes prefetches cancellable before
                // they ever touch the pool.
                let _slot = match budget.acquire_owned().await {
                    Ok(slot) => slot,
                    Err(_) => return (index, Err(Error::Cancelled)),
                };
                let msg_id = &segments[index].msg_id;
                trace!(index, %msg_id, "prefetching segment");
                let outcome = fetcher
                    .fetch(msg_id, &ctx, &cancel)
                    .await
                    .map_err(Error::from);
                (index, outcome)
            });
            self.pending.insert(index, handle);
        }
    }

    /// Wait until the next segment to emit is ready, surfacing its fetch
    /// error only when the reader actually reaches it.
    async fn await_next(&mut self) -> Result<Bytes> {
        loop {
            if let Some(outcome) = self.ready.remove(&self.next_to_emit) {
                return outcome;
            }
            if !self.pending.contains_key(&self.next_to_emit) {
                // Not in flight (fresh reader or just seeked): make sure it
                // gets fetched on the next top-up round.
                self.next_to_fetch = self.next_to_fetch.min(self.next_to_emit);
                self.top_up();
            }
            let joined = tokio::select! {
                () = self.cancel.cancelled() => return Err(Error::Cancelled),
                joined = self.tasks.join_next() => joined,
            };
            match joined {
                Some(Ok((index, outcome))) => {
                    self.pending.remove(&index);
                    // Results from before a backward seek may still arrive;
                    // keep them only if the window can still use them.
                    if index >= self.next_to_emit
                        && index < self.next_to_emit + self.prefetch_window
                    {
                        self.ready.insert(index, outcome);
                    }
                }
                Some(Err(join_error)) => {
                    if join_error.is_cancelled() {
                        continue;
                    }
                    return Err(Error::unavailable(format!(
                        "prefetch task failed: {join_error}"
                    )));
                }
                None => {
                    // No tasks at all; the top-up above must have found
                    // nothing to do, which means the list is exhausted.
                    return Err(Error::unavailable(
                        "prefetch underrun past end of segment list",
                    ));
                }
            }
        }
    }

    /// Cancel and forget everything in flight outside `[from, from + window)`.
    fn prune_window(&mut self, from: usize) {
        let window_end = from + self.prefetch_window;
        self.pending.retain(|&index, handle| {
            let keep = index >= from && index < window_end;
            if !keep {
                handle.abort();
            }
            keep
        });
        self.ready.retain(|&index, _| index >= from && index < window_end);
    }
}

#[async_trait]
impl ByteStream for SegmentReader {
    async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        loop {
            if let Some((bytes, consumed)) = &mut self.current {
                let remaining = bytes.len() - *consumed;
                if remaining == 0 {
                    self.current = None;
                    continue;
                }
                // Discard bytes a mid-segment seek asked to skip.
                if self.skip > 0 {
                    let discard = (self.skip).min(remaining as u64) as usize;
                    *consumed += discard;
                    self.skip -= discard as u64;
                    continue;
                }
                let n = dst.len().min(remaining);
                dst[..n].copy_from_slice(&bytes[*consumed..*consumed + n]);
                *consumed += n;
                if *consumed == bytes.len() {
                    self.current = None;
                }
                self.top_up();
                return Ok(n);
            }

            if self.next_to_emit >= self.segments.len() {
                return Ok(0);
            }
            self.top_up();
            let bytes = self.await_next().await?;
            debug!(
                index = self.next_to_emit,
                bytes = bytes.len(),
                "segment ready for emission"
            );
            self.current = Some((bytes, 0));
            self.next_to_emit += 1;
        }
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        // Rewinding to the start needs no size metadata.
        let (index, intra) = if position == 0 {
            (0, 0)
        } else {
            self.locate(position)?
        };
        trace!(position, index, intra, "segment reader seek");

        self.current = None;
        self.skip = intra;
        self.next_to_emit = index;
        self.next_to_fetch = index;
        self.prune_window(index);
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        self.offsets
            .as_ref()
            .map(|offsets| *offsets.last().unwrap_or(&0))
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
        self.pending.clear();
        self.ready.clear();
        self.current = None;
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        // JoinSet aborts everything it still owns; the cancel token stops
        // fetches that already borrowed a connection.
        self.cancel.cancel();
    }
}
