//! Streaming-monitor gate
//!
//! The external playback monitor watches which streams a viewer is really
//! playing (as opposed to a file browser probing headers) and registers
//! their job keys here. Fetches for registered jobs are upgraded from
//! `Streaming` to `PlaybackVerified`, which buys them the reserved
//! admission lane and first claim on the job's preferred provider.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::types::{UsageContext, UsageKind};

/// How long a verification holds without being refreshed
const DEFAULT_VERIFICATION_TTL: Duration = Duration::from_secs(5 * 60);

/// Registry of verified playback sessions, keyed by job.
#[derive(Debug)]
pub struct PlaybackGate {
    verified: DashMap<String, Instant>,
    ttl: Duration,
}

impl PlaybackGate {
    /// Gate with the default verification TTL (5 minutes).
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_VERIFICATION_TTL)
    }

    /// Gate with a custom TTL.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            verified: DashMap::new(),
            ttl,
        }
    }

    /// Mark a job as verified playing. Refreshes the TTL when already
    /// registered.
    pub fn verify(&self, job_key: impl Into<String>) {
        let job_key = job_key.into();
        debug!(job_key = %job_key, "playback verified");
        self.verified.insert(job_key, Instant::now());
    }

    /// Remove a job's verification (playback stopped).
    pub fn release(&self, job_key: &str) {
        self.verified.remove(job_key);
    }

    /// Whether a job currently holds a live verification.
    pub fn is_verified(&self, job_key: &str) -> bool {
        let live = {
            let Some(entry) = self.verified.get(job_key) else {
                return false;
            };
            entry.elapsed() < self.ttl
        };
        if !live {
            self.verified.remove(job_key);
        }
        live
    }

    /// Effective traffic class for a request: streaming requests whose job
    /// is verified playing collapse to `PlaybackVerified`; everything else
    /// passes through unchanged.
    pub fn classify(&self, ctx: &UsageContext) -> UsageKind {
        if ctx.kind == UsageKind::Streaming
            && ctx.job_key.as_deref().is_some_and(|job| self.is_verified(job))
        {
            UsageKind::PlaybackVerified
        } else {
            ctx.kind
        }
    }

    /// Number of currently verified sessions (expired entries included
    /// until next touch).
    pub fn verified_count(&self) -> usize {
        self.verified.len()
    }
}

impl Default for PlaybackGate {
    fn default() -> Self {
        Self::new()
    }
}
