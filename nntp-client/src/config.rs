//! Client configuration
//!
//! The outer application owns configuration persistence; this is the
//! validated, strongly typed slice of it the data plane reads. Field names
//! deserialize from the flat kebab-case keys the configuration store uses.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::admission::AdmissionLimits;
use crate::error::{Error, Result};
use crate::pool::PoolConfig;
use crate::types::Provider;

fn default_connections_per_stream() -> usize {
    20
}

fn default_total_streaming_connections() -> usize {
    40
}

fn default_max_queue_connections() -> usize {
    20
}

fn default_repair_connections() -> usize {
    10
}

fn default_stream_buffer_size() -> usize {
    100
}

fn default_operation_timeout_secs() -> u64 {
    60
}

fn default_affinity_enabled() -> bool {
    true
}

fn default_exploration_ratio() -> u64 {
    32
}

/// Validated client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClientConfig {
    /// Configured providers, index order
    pub providers: Vec<Provider>,

    /// Per-stream prefetch parallelism
    #[serde(default = "default_connections_per_stream")]
    pub connections_per_stream: usize,

    /// Global streaming class budget
    #[serde(default = "default_total_streaming_connections")]
    pub total_streaming_connections: usize,

    /// Global queue class budget
    #[serde(default = "default_max_queue_connections")]
    pub max_queue_connections: usize,

    /// Global health-check class budget
    #[serde(default = "default_repair_connections")]
    pub repair_connections: usize,

    /// Prefetch window cap, in segments
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// Per-article deadline in seconds
    #[serde(default = "default_operation_timeout_secs")]
    pub operation_timeout_secs: u64,

    /// Toggle provider affinity ordering
    #[serde(default = "default_affinity_enabled")]
    pub provider_affinity_enable: bool,

    /// 1-in-N exploration ratio for affinity ordering
    #[serde(default = "default_exploration_ratio")]
    pub provider_affinity_exploration_ratio: u64,
}

impl ClientConfig {
    /// Minimal configuration over a provider list, everything else default.
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers,
            connections_per_stream: default_connections_per_stream(),
            total_streaming_connections: default_total_streaming_connections(),
            max_queue_connections: default_max_queue_connections(),
            repair_connections: default_repair_connections(),
            stream_buffer_size: default_stream_buffer_size(),
            operation_timeout_secs: default_operation_timeout_secs(),
            provider_affinity_enable: default_affinity_enabled(),
            provider_affinity_exploration_ratio: default_exploration_ratio(),
        }
    }

    /// Validate invariants that only hold across fields.
    ///
    /// Called at construction time; a running system never sees an invalid
    /// configuration.
    pub fn validate(&self) -> Result<()> {
        if !self.providers.iter().any(Provider::is_usable) {
            return Err(Error::config("no usable providers configured"));
        }
        for (position, provider) in self.providers.iter().enumerate() {
            if provider.index != position {
                return Err(Error::config(format!(
                    "provider {} listed at position {position}",
                    provider.index
                )));
            }
            if provider.host.is_empty() {
                return Err(Error::config(format!("provider {position} has no host")));
            }
            if provider.is_usable() && provider.max_connections == 0 {
                return Err(Error::config(format!(
                    "provider {} has max_connections = 0",
                    provider.host
                )));
            }
            if provider.username.is_some() != provider.password.is_some() {
                return Err(Error::config(format!(
                    "provider {} has partial credentials",
                    provider.host
                )));
            }
        }
        if self.connections_per_stream == 0 {
            return Err(Error::config("connections-per-stream must be at least 1"));
        }
        if self.total_streaming_connections == 0 {
            return Err(Error::config(
                "total-streaming-connections must be at least 1",
            ));
        }
        Ok(())
    }

    /// Admission limits derived from the class budgets.
    pub fn admission_limits(&self) -> AdmissionLimits {
        AdmissionLimits {
            streaming: self.total_streaming_connections,
            queue: self.max_queue_connections,
            healthcheck: self.repair_connections,
        }
    }

    /// Pool tuning derived from this configuration.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::default()
    }

    /// The per-article deadline.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    /// Affinity tuning derived from this configuration.
    pub fn affinity_config(&self) -> nzbfs_stats::AffinityConfig {
        nzbfs_stats::AffinityConfig {
            enabled: self.provider_affinity_enable,
            exploration_ratio: self.provider_affinity_exploration_ratio,
            ..nzbfs_stats::AffinityConfig::default()
        }
    }
}
