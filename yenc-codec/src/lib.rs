//! yEnc encoding and decoding for Usenet binary articles
//!
//! yEnc transmits binary data over NNTP by shifting every byte by 42 and
//! escaping the handful of characters that would break the text transport.
//! An article body consists of a `=ybegin` header line, an optional `=ypart`
//! line for multi-part postings, the encoded payload, and a `=yend` trailer
//! carrying size and CRC-32 information.
//!
//! This crate decodes one article body at a time into a single contiguous
//! payload buffer, and provides the matching encoder used by test fixtures.
//! Dot-unstuffing is a transport concern and must already have happened:
//! callers hand in the body exactly as the NNTP layer reassembled it.

mod decode;
mod encode;
mod error;
mod header;

pub use decode::{Decoded, decode};
pub use encode::{EncodeOptions, encode};
pub use error::{Error, Result};
pub use header::{YencHeader, YencPart, YencTrailer};

/// Offset added to every payload byte on the wire
pub const YENC_SHIFT: u8 = 42;

/// Additional offset applied to escaped bytes
pub const ESCAPE_SHIFT: u8 = 64;

/// The escape character introducing a shifted literal
pub const ESCAPE: u8 = b'=';

/// Default encoded line length used by the encoder
pub const DEFAULT_LINE_LENGTH: usize = 128;
