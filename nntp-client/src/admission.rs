//! Usage-class admission control
//!
//! Interactive playback must never starve behind background traffic, so
//! every borrow first clears a class-level gate before competing for a
//! provider slot. Each class has its own counting semaphore; verified
//! playback additionally owns a reserved half of the streaming budget that
//! unverified streams cannot touch.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::types::UsageKind;

/// Sizes of the class gates, in connections
#[derive(Debug, Clone, Copy)]
pub struct AdmissionLimits {
    /// Total interactive streaming budget (verified + unverified)
    pub streaming: usize,
    /// Background queue/import budget
    pub queue: usize,
    /// Health-check sweep budget
    pub healthcheck: usize,
}

impl Default for AdmissionLimits {
    fn default() -> Self {
        Self {
            streaming: 40,
            queue: 20,
            healthcheck: 10,
        }
    }
}

/// A held class slot; dropping it releases the slot.
#[derive(Debug)]
pub struct ClassPermit {
    _permit: OwnedSemaphorePermit,
}

/// Class-level gate in front of the connection pool.
///
/// Waiters within a class are FIFO (tokio semaphores queue fairly), and a
/// cancelled waiter leaves the queue without consuming anything.
#[derive(Debug)]
pub struct AdmissionController {
    /// Streaming slots any interactive request may take
    streaming_shared: Arc<Semaphore>,
    /// Streaming slots only verified playback may take
    streaming_reserved: Arc<Semaphore>,
    queue: Arc<Semaphore>,
    healthcheck: Arc<Semaphore>,
    limits: AdmissionLimits,
}

impl AdmissionController {
    /// Build the gates. Half of the streaming budget (rounded down, at
    /// least one slot when the budget allows) is reserved for verified
    /// playback.
    pub fn new(limits: AdmissionLimits) -> Self {
        let reserved = if limits.streaming >= 2 {
            limits.streaming / 2
        } else {
            0
        };
        let shared = limits.streaming - reserved;
        Self {
            streaming_shared: Arc::new(Semaphore::new(shared)),
            streaming_reserved: Arc::new(Semaphore::new(reserved)),
            queue: Arc::new(Semaphore::new(limits.queue)),
            healthcheck: Arc::new(Semaphore::new(limits.healthcheck)),
            limits,
        }
    }

    /// Acquire a slot for `kind`, waiting FIFO within the class.
    ///
    /// Verified playback drains the reserved lane first and falls back to
    /// racing for a shared slot, so it sees strictly more capacity than
    /// unverified streaming.
    pub async fn acquire(&self, kind: UsageKind, cancel: &CancellationToken) -> Result<ClassPermit> {
        let acquire = async {
            let permit = match kind {
                UsageKind::Streaming => Arc::clone(&self.streaming_shared).acquire_owned().await,
                UsageKind::PlaybackVerified => {
                    match Arc::clone(&self.streaming_reserved).try_acquire_owned() {
                        Ok(permit) => Ok(permit),
                        Err(_) => {
                            let reserved = Arc::clone(&self.streaming_reserved);
                            let shared = Arc::clone(&self.streaming_shared);
                            tokio::select! {
                                permit = reserved.acquire_owned() => permit,
                                permit = shared.acquire_owned() => permit,
                            }
                        }
                    }
                }
                UsageKind::Queue => Arc::clone(&self.queue).acquire_owned().await,
                UsageKind::HealthCheck => Arc::clone(&self.healthcheck).acquire_owned().await,
            };
            permit.map_err(|_| Error::PoolClosed)
        };

        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            permit = acquire => Ok(ClassPermit { _permit: permit? }),
        }
    }

    /// Configured limits.
    pub fn limits(&self) -> AdmissionLimits {
        self.limits
    }

    /// Currently free slots for a class (reserved + shared for verified
    /// playback). Test and telemetry aid; racy by nature.
    pub fn available(&self, kind: UsageKind) -> usize {
        match kind {
            UsageKind::Streaming => self.streaming_shared.available_permits(),
            UsageKind::PlaybackVerified => {
                self.streaming_reserved.available_permits()
                    + self.streaming_shared.available_permits()
            }
            UsageKind::Queue => self.queue.available_permits(),
            UsageKind::HealthCheck => self.healthcheck.available_permits(),
        }
    }
}
