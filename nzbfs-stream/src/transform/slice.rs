//! Byte-range slicing

use async_trait::async_trait;

use super::{BoxedByteStream, ByteStream};
use crate::descriptor::ByteRange;
use crate::error::Result;

/// Exposes `range` of the inner stream as a stream of its own: logical
/// offset 0 maps to `range.start`, end of stream is `range.end`.
///
/// The inner stream is positioned lazily on the first read, so building a
/// slice reserves nothing.
pub struct SliceStream {
    inner: BoxedByteStream,
    range: ByteRange,
    position: u64,
    positioned: bool,
}

impl SliceStream {
    /// Expose `range` of `inner`.
    pub fn new(inner: BoxedByteStream, range: ByteRange) -> Self {
        Self {
            inner,
            range,
            position: 0,
            positioned: false,
        }
    }
}

#[async_trait]
impl ByteStream for SliceStream {
    async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if !self.positioned {
            self.inner.seek(self.range.start + self.position).await?;
            self.positioned = true;
        }
        let remaining = self.range.len() - self.position;
        if remaining == 0 {
            return Ok(0);
        }
        let want = dst.len().min(remaining as usize);
        let n = self.inner.read(&mut dst[..want]).await?;
        self.position += n as u64;
        Ok(n)
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        self.inner.seek(self.range.start + position).await?;
        self.position = position.min(self.range.len());
        self.positioned = true;
        Ok(())
    }

    fn len(&self) -> Option<u64> {
        Some(self.range.len())
    }

    async fn close(&mut self) {
        self.inner.close().await;
    }
}
