//! Core identifier and configuration record types

use serde::{Deserialize, Serialize};
use std::fmt;

pub use nzbfs_stats::UsageKind;

/// A Usenet article identifier (`<unique@host>`), globally unique per post.
///
/// Stored with the angle brackets, the form the wire protocol wants.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MsgId(String);

impl MsgId {
    /// Wrap a message-id, adding angle brackets when the source (an NZB
    /// index, typically) stripped them.
    pub fn new(raw: impl Into<String>) -> Self {
        let raw = raw.into();
        if raw.starts_with('<') && raw.ends_with('>') {
            Self(raw)
        } else {
            Self(format!("<{raw}>"))
        }
    }

    /// The wire form, angle brackets included.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for MsgId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl From<&str> for MsgId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

impl From<String> for MsgId {
    fn from(raw: String) -> Self {
        Self::new(raw)
    }
}

/// How a provider participates in traffic distribution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderRole {
    /// Load-shares normal traffic
    Pool,
    /// Used on failure, and included in health-check sweeps
    BackupAndStats,
    /// Used only when every earlier tier is exhausted
    BackupOnly,
    /// Configured but never used
    Disabled,
}

/// One configured NNTP provider
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Provider {
    /// Stable index within the configured provider list
    pub index: usize,
    /// Server hostname
    pub host: String,
    /// Server port (typically 119, or 563 for TLS)
    pub port: u16,
    /// Negotiate TLS at connect time
    #[serde(default)]
    pub tls: bool,
    /// AUTHINFO username, when the provider requires authentication
    #[serde(default)]
    pub username: Option<String>,
    /// AUTHINFO password
    #[serde(default)]
    pub password: Option<String>,
    /// Maximum simultaneous connections the provider allows
    pub max_connections: usize,
    /// Traffic role
    pub role: ProviderRole,
}

impl Provider {
    /// `host:port` for dialing and log lines.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Whether this provider should ever be dialed.
    pub fn is_usable(&self) -> bool {
        self.role != ProviderRole::Disabled
    }
}

// Credentials stay out of Debug output.
impl fmt::Debug for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Provider")
            .field("index", &self.index)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("tls", &self.tls)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("max_connections", &self.max_connections)
            .field("role", &self.role)
            .finish()
    }
}

/// Per-request traffic context, consulted by admission control and
/// provider affinity. Flows with every fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageContext {
    /// Traffic class
    pub kind: UsageKind,
    /// Job the request belongs to (typically the release name)
    pub job_key: Option<String>,
    /// Key scoping provider performance memory; defaults to `job_key`
    pub affinity_key: Option<String>,
}

impl UsageContext {
    /// Interactive playback traffic for a job.
    pub fn streaming(job_key: impl Into<String>) -> Self {
        Self {
            kind: UsageKind::Streaming,
            job_key: Some(job_key.into()),
            affinity_key: None,
        }
    }

    /// Background queue/import traffic.
    pub fn queue() -> Self {
        Self {
            kind: UsageKind::Queue,
            job_key: None,
            affinity_key: None,
        }
    }

    /// Health-check sweep traffic.
    pub fn healthcheck() -> Self {
        Self {
            kind: UsageKind::HealthCheck,
            job_key: None,
            affinity_key: None,
        }
    }

    /// Attach a job key.
    #[must_use]
    pub fn with_job_key(mut self, job_key: impl Into<String>) -> Self {
        self.job_key = Some(job_key.into());
        self
    }

    /// Override the affinity scope.
    #[must_use]
    pub fn with_affinity_key(mut self, affinity_key: impl Into<String>) -> Self {
        self.affinity_key = Some(affinity_key.into());
        self
    }

    /// The key that scopes provider performance memory for this request.
    pub fn affinity_key(&self) -> Option<&str> {
        self.affinity_key.as_deref().or(self.job_key.as_deref())
    }
}
