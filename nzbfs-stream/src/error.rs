//! Error surface of the streaming layer
//!
//! Provider failover, retries, and circuit breaking all happen below this
//! crate; what reaches a stream's caller is only the aggregated outcome.

use thiserror::Error;

/// Error types surfaced by file streams
#[derive(Debug, Error)]
pub enum Error {
    /// Every provider agrees the backing article is absent. Terminal for
    /// the affected read; the caller may mark the file corrupt.
    #[error("article not found: {msg_id}")]
    NotFound {
        /// The absent article
        msg_id: String,
    },

    /// No provider could serve the read within budget. Retryable.
    #[error("content unavailable: {reason}")]
    Unavailable {
        /// What went wrong, for logs
        reason: String,
    },

    /// The article payload would not decode, consistently across providers
    #[error("decode error: {0}")]
    Decode(#[from] yenc_codec::Error),

    /// Cooperative cancellation
    #[error("stream cancelled")]
    Cancelled,

    /// The operation needs metadata this descriptor does not carry
    #[error("not supported: {reason}")]
    NotSupported {
        /// What is missing
        reason: String,
    },

    /// Seek target outside `[0, length]`
    #[error("seek to {position} outside stream of length {length}")]
    InvalidSeek {
        /// Requested absolute position
        position: u64,
        /// Stream length
        length: u64,
    },

    /// The descriptor violates its invariants; construction-time only
    #[error("invalid file descriptor: {reason}")]
    InvalidDescriptor {
        /// The violated invariant
        reason: String,
    },
}

/// Result type alias for streaming operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a not-supported error
    pub fn not_supported(reason: impl Into<String>) -> Self {
        Self::NotSupported {
            reason: reason.into(),
        }
    }

    /// Create an invalid-descriptor error
    pub fn invalid_descriptor(reason: impl Into<String>) -> Self {
        Self::InvalidDescriptor {
            reason: reason.into(),
        }
    }

    /// Create an unavailable error
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self::Unavailable {
            reason: reason.into(),
        }
    }
}

impl From<nntp_client::Error> for Error {
    fn from(e: nntp_client::Error) -> Self {
        match e {
            nntp_client::Error::ArticleNotFound { msg_id } => Self::NotFound {
                msg_id: msg_id.to_string(),
            },
            nntp_client::Error::Decode(inner) => Self::Decode(inner),
            nntp_client::Error::Cancelled => Self::Cancelled,
            other => Self::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nntp_client::MsgId;

    #[test]
    fn test_aggregated_outcomes_map_onto_stream_errors() {
        let e: Error = nntp_client::Error::ArticleNotFound {
            msg_id: MsgId::new("a@b"),
        }
        .into();
        assert!(matches!(e, Error::NotFound { .. }));

        let e: Error = nntp_client::Error::Cancelled.into();
        assert!(matches!(e, Error::Cancelled));

        let e: Error = nntp_client::Error::PoolTimeout { timeout_secs: 30 }.into();
        assert!(matches!(e, Error::Unavailable { .. }));

        let e: Error = nntp_client::Error::Decode(yenc_codec::Error::malformed("bad")).into();
        assert!(matches!(e, Error::Decode(_)));
    }
}
