//! Error types for yEnc encoding and decoding

use thiserror::Error;

/// Error types for yEnc operations
#[derive(Debug, Error)]
pub enum Error {
    /// The article body is not valid yEnc
    #[error("malformed yEnc data: {reason}")]
    Malformed {
        /// What the parser choked on
        reason: String,
    },

    /// The decoded payload failed CRC-32 validation
    #[error("CRC-32 mismatch: trailer declares {expected:08x}, computed {actual:08x}")]
    CrcMismatch {
        /// CRC declared by the `=yend` trailer
        expected: u32,
        /// CRC computed over the decoded payload
        actual: u32,
    },

    /// The decoded payload size does not match the declared size
    #[error("size mismatch: declared {expected} bytes, decoded {actual} bytes")]
    SizeMismatch {
        /// Size declared by the header or part line
        expected: u64,
        /// Number of bytes actually decoded
        actual: u64,
    },
}

/// Result type alias for yEnc operations
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create a malformed-data error
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::Malformed {
            reason: reason.into(),
        }
    }
}
