//! Provider performance tracking for the nzbfs data plane
//!
//! Every article fetch produces a result observation: which provider served
//! it, how long it took, how many bytes came back, and how it failed if it
//! failed. This crate aggregates those observations three ways:
//!
//! - [`AffinityTracker`] keeps a rolling window per `(job, provider)` pair
//!   and ranks providers for candidate ordering, so a job keeps going back
//!   to whichever provider has been serving it fastest and most reliably.
//! - [`BandwidthMeter`] accumulates transferred byte counts per provider in
//!   per-second buckets for throughput reads.
//! - [`StatsSink`] / [`FetchEventSink`] are the injection points through
//!   which snapshots and per-fetch events leave the core (persistence and
//!   telemetry are external collaborators).

mod affinity;
mod bandwidth;
mod record;
mod sink;

pub use affinity::{AffinityConfig, AffinityTracker};
pub use bandwidth::BandwidthMeter;
pub use record::{FetchOutcome, ProviderStatSnapshot, StatRecord};
pub use sink::{
    FetchEvent, FetchEventSink, NullStatsSink, SinkError, StatsSink, TracingEventSink,
    spawn_stats_flush,
};

use serde::{Deserialize, Serialize};

/// Traffic class a fetch belongs to.
///
/// Admission control interprets these; here they only annotate observations
/// and events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsageKind {
    /// Interactive playback read, not yet confirmed by the playback monitor
    Streaming,
    /// Interactive playback read from a session the monitor has verified
    PlaybackVerified,
    /// Background queue/import traffic
    Queue,
    /// Health-check sweep traffic
    HealthCheck,
}

impl UsageKind {
    /// Stable lowercase label used in events and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Streaming => "streaming",
            Self::PlaybackVerified => "playback_verified",
            Self::Queue => "queue",
            Self::HealthCheck => "healthcheck",
        }
    }
}
