//! Composable byte-stream transforms
//!
//! Every layer of the chain exposes the same async read/seek contract, so
//! transforms stack in the one fixed order the data model allows: raw
//! segment bytes → XOR de-obfuscation → AES-CTR decryption → byte-range
//! slice → multipart concatenation.

mod aes_ctr;
mod multipart;
mod slice;
mod xor;

pub use aes_ctr::AesCtrStream;
pub use multipart::MultipartStream;
pub use slice::SliceStream;
pub use xor::XorStream;

use async_trait::async_trait;

use crate::error::Result;

/// A positioned, optionally seekable source of bytes.
///
/// `read` returns 0 only at end of stream and may return short counts.
/// `seek` takes an absolute offset in this stream's own coordinates; a
/// stream without exact size metadata refuses with `NotSupported`.
/// `close` cancels any outstanding work owned by the stream and does not
/// return until none is left.
#[async_trait]
pub trait ByteStream: Send {
    /// Read up to `dst.len()` bytes at the current position.
    async fn read(&mut self, dst: &mut [u8]) -> Result<usize>;

    /// Reposition to `position` bytes from the start.
    async fn seek(&mut self, position: u64) -> Result<()>;

    /// Total size, when known.
    fn len(&self) -> Option<u64>;

    /// Cancel outstanding work and release resources.
    async fn close(&mut self);
}

/// Type-erased stream, the unit the chain composes over
pub type BoxedByteStream = Box<dyn ByteStream>;
