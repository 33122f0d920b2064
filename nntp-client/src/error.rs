//! Error types and the semantic error classification that drives retry,
//! failover, and circuit-breaking policy

use thiserror::Error;

use crate::types::MsgId;

/// Error types for NNTP client operations
#[derive(Debug, Error)]
pub enum Error {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to connect to a provider
    #[error("connection failed to {host}:{port}")]
    ConnectionFailed {
        /// Hostname that failed to connect
        host: String,
        /// Port that failed to connect
        port: u16,
    },

    /// Connect attempt exceeded the dial timeout
    #[error("connection timed out after {timeout_secs}s to {host}:{port}")]
    ConnectTimeout {
        /// Hostname that timed out
        host: String,
        /// Port that timed out
        port: u16,
        /// The dial timeout in seconds
        timeout_secs: u64,
    },

    /// Provider hostname is not a valid TLS server name
    #[error("invalid TLS server name: {host}")]
    InvalidServerName {
        /// The offending hostname
        host: String,
    },

    /// An article operation exceeded the operation deadline
    #[error("operation timed out after {timeout_secs}s")]
    OperationTimeout {
        /// The operation timeout in seconds
        timeout_secs: u64,
    },

    /// The server replied with something the protocol does not allow here
    #[error("unexpected response (wanted {expected}): {line}")]
    UnexpectedResponse {
        /// The status code the caller was waiting for
        expected: u16,
        /// The status code received
        code: u16,
        /// The full response line
        line: String,
    },

    /// Authentication was rejected (481/482)
    #[error("authentication rejected by provider ({code})")]
    AuthRejected {
        /// The rejection status code
        code: u16,
    },

    /// The provider rejected the connection for concurrency reasons
    #[error("provider connection limit reached: {line}")]
    ConnectionLimit {
        /// The full response line
        line: String,
    },

    /// The provider does not carry the article (430)
    #[error("article {msg_id} not on provider")]
    ArticleMissing {
        /// The requested article
        msg_id: MsgId,
    },

    /// The provider refused the command (4xx/5xx other than 430)
    #[error("provider refused {msg_id} ({code})")]
    ArticleRefused {
        /// The requested article
        msg_id: MsgId,
        /// The refusal status code
        code: u16,
    },

    /// Every provider reported the article missing
    #[error("article {msg_id} not found on any provider")]
    ArticleNotFound {
        /// The requested article
        msg_id: MsgId,
    },

    /// No provider answered authoritatively within budget
    #[error("article {msg_id} unavailable: {reason}")]
    ArticleUnavailable {
        /// The requested article
        msg_id: MsgId,
        /// Short description of the last failure
        reason: String,
    },

    /// yEnc decoding failed (consistently across providers when surfaced
    /// from the fetcher)
    #[error("decode error: {0}")]
    Decode(#[from] yenc_codec::Error),

    /// The pool is shut down
    #[error("connection pool closed")]
    PoolClosed,

    /// No connection became available within the pool wait budget
    #[error("no connection available within {timeout_secs}s")]
    PoolTimeout {
        /// The wait budget in seconds
        timeout_secs: u64,
    },

    /// The provider's circuit breaker is open
    #[error("provider {provider_index} unavailable (circuit open)")]
    ProviderUnavailable {
        /// Index of the unavailable provider
        provider_index: usize,
    },

    /// Cooperative cancellation
    #[error("operation cancelled")]
    Cancelled,

    /// Invalid configuration, reported at construction time only
    #[error("configuration error: {reason}")]
    Config {
        /// What is wrong with the configuration
        reason: String,
    },
}

/// Result type alias for NNTP client operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a configuration error
    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }
}

/// Semantic classification of a failure, driving policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// 430: skip this provider for the article, count toward "truly missing"
    ArticleMissing,
    /// Other 4xx/5xx: skip this provider, does not count toward missing
    ArticleRefused,
    /// Socket/timeout/decode failure: drop the connection, retry with
    /// backoff, then fail over
    Transient,
    /// 481/482: circuit-break the provider for the auth backoff
    AuthFailed,
    /// Provider-imposed concurrency rejection: short circuit-break
    OverLimit,
    /// Caller-initiated: propagate immediately, no retry
    Cancelled,
    /// Invariant violation or unrecoverable state: propagate and log
    Fatal,
}

impl ErrorKind {
    /// Whether the same provider may be retried after this failure.
    pub fn retry_same_provider(&self) -> bool {
        matches!(self, Self::Transient)
    }

    /// Whether the connection that produced this failure must be destroyed
    /// rather than returned to the pool.
    pub fn poisons_connection(&self) -> bool {
        matches!(self, Self::Transient | Self::AuthFailed | Self::Fatal)
    }

    /// Circuit-breaker backoff this failure imposes on the provider, if any.
    pub fn breaker_backoff(&self) -> Option<std::time::Duration> {
        match self {
            Self::AuthFailed => Some(std::time::Duration::from_secs(60)),
            Self::OverLimit => Some(std::time::Duration::from_secs(5)),
            _ => None,
        }
    }
}

impl Error {
    /// Classify this error for retry/failover policy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ArticleMissing { .. } | Self::ArticleNotFound { .. } => ErrorKind::ArticleMissing,
            Self::ArticleRefused { .. } => ErrorKind::ArticleRefused,
            Self::AuthRejected { .. } => ErrorKind::AuthFailed,
            Self::ConnectionLimit { .. } => ErrorKind::OverLimit,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Io(_)
            | Self::ConnectionFailed { .. }
            | Self::ConnectTimeout { .. }
            | Self::OperationTimeout { .. }
            | Self::UnexpectedResponse { .. }
            | Self::Decode(_)
            | Self::PoolTimeout { .. }
            | Self::ProviderUnavailable { .. }
            | Self::ArticleUnavailable { .. } => ErrorKind::Transient,
            Self::InvalidServerName { .. } | Self::PoolClosed | Self::Config { .. } => {
                ErrorKind::Fatal
            }
        }
    }

    /// Stable label for telemetry events.
    pub fn outcome_label(&self) -> &'static str {
        match self.kind() {
            ErrorKind::ArticleMissing => "missing",
            ErrorKind::ArticleRefused => "refused",
            ErrorKind::Transient => match self {
                Self::OperationTimeout { .. } | Self::ConnectTimeout { .. } => "timeout",
                Self::Decode(_) => "decode_failed",
                _ => "transient",
            },
            ErrorKind::AuthFailed => "auth_failed",
            ErrorKind::OverLimit => "over_limit",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Fatal => "fatal",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_policy_table() {
        let missing = Error::ArticleMissing {
            msg_id: MsgId::new("a@b"),
        };
        assert_eq!(missing.kind(), ErrorKind::ArticleMissing);
        assert!(!missing.kind().retry_same_provider());
        assert!(!missing.kind().poisons_connection());

        let timeout = Error::OperationTimeout { timeout_secs: 60 };
        assert_eq!(timeout.kind(), ErrorKind::Transient);
        assert!(timeout.kind().retry_same_provider());
        assert!(timeout.kind().poisons_connection());

        let auth = Error::AuthRejected { code: 481 };
        assert_eq!(auth.kind(), ErrorKind::AuthFailed);
        assert_eq!(
            auth.kind().breaker_backoff(),
            Some(std::time::Duration::from_secs(60))
        );

        let limit = Error::ConnectionLimit {
            line: "502 too many connections".to_string(),
        };
        assert_eq!(limit.kind(), ErrorKind::OverLimit);
        assert_eq!(
            limit.kind().breaker_backoff(),
            Some(std::time::Duration::from_secs(5))
        );

        assert_eq!(Error::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(Error::PoolClosed.kind(), ErrorKind::Fatal);
    }

    #[test]
    fn test_outcome_labels() {
        assert_eq!(
            Error::OperationTimeout { timeout_secs: 1 }.outcome_label(),
            "timeout"
        );
        assert_eq!(
            Error::Decode(yenc_codec::Error::malformed("x")).outcome_label(),
            "decode_failed"
        );
        assert_eq!(Error::Cancelled.outcome_label(), "cancelled");
    }
}
