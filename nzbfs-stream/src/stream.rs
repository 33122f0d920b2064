//! Seekable file streams over article storage

use nntp_client::{ArticleFetcher, UsageContext};
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::descriptor::FileDescriptor;
use crate::error::{Error, Result};
use crate::transform::{ByteStream, MultipartStream};

/// Default per-stream prefetch parallelism
const DEFAULT_CONNECTIONS_PER_STREAM: usize = 20;

/// Default prefetch window cap, in segments
const DEFAULT_WINDOW_CAP: usize = 100;

/// Per-stream tuning
#[derive(Debug, Clone)]
pub struct StreamOptions {
    /// How many fetches this stream may run in parallel
    pub connections_per_stream: usize,
    /// Hard cap on segments buffered or in flight ahead of the reader
    pub prefetch_window_cap: usize,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            connections_per_stream: DEFAULT_CONNECTIONS_PER_STREAM,
            prefetch_window_cap: DEFAULT_WINDOW_CAP,
        }
    }
}

impl From<&nntp_client::ClientConfig> for StreamOptions {
    fn from(config: &nntp_client::ClientConfig) -> Self {
        Self {
            connections_per_stream: config.connections_per_stream,
            prefetch_window_cap: config.stream_buffer_size,
        }
    }
}

/// Open a seekable stream over `descriptor`.
///
/// Validates the descriptor and builds the transform chain, reserving no
/// connections and fetching nothing until the first read. Idempotent:
/// opening the same descriptor twice yields two independent streams
/// sharing only the pool.
pub fn open_stream(
    fetcher: Arc<ArticleFetcher>,
    descriptor: FileDescriptor,
    ctx: UsageContext,
    options: StreamOptions,
) -> Result<FileStream> {
    descriptor.validate()?;
    let length = descriptor.len();
    let seekable = descriptor.is_seekable();
    let connections = options.connections_per_stream.max(1);
    let cancel = CancellationToken::new();

    let inner = MultipartStream::new(
        fetcher,
        ctx,
        Arc::new(descriptor),
        Arc::new(Semaphore::new(connections)),
        connections,
        options.prefetch_window_cap,
        cancel.clone(),
    );

    debug!(length, seekable, connections, "stream opened");
    Ok(FileStream {
        inner,
        length,
        seekable,
        position: 0,
        cancel,
        closed: false,
    })
}

/// A seekable, read-only byte stream over a file that physically lives in
/// Usenet article storage.
///
/// Reads materialize bytes on demand through the prefetching segment
/// reader; seeks cost one segment round-trip. The stream owns its prefetch
/// tasks: [`FileStream::close`] (or drop) cancels them all, and `close`
/// does not return until none are left.
pub struct FileStream {
    inner: MultipartStream,
    length: u64,
    seekable: bool,
    position: u64,
    cancel: CancellationToken,
    closed: bool,
}

impl FileStream {
    /// Logical file length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Current read position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Whether seeks are supported (exact size metadata present).
    pub fn is_seekable(&self) -> bool {
        self.seekable
    }

    /// Read up to `dst.len()` bytes at the current position.
    ///
    /// Returns 0 only at end of file; short reads are normal. Transient
    /// provider trouble is absorbed below; an error here is the aggregated
    /// outcome (`NotFound`, `Unavailable`, `Decode`, `Cancelled`).
    pub async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        let n = self.inner.read(dst).await?;
        self.position += n as u64;
        Ok(n)
    }

    /// Reposition the stream.
    ///
    /// Any offset in `[0, length]` is valid; seeking to `length` parks the
    /// reader at end of file. Offsets past the end fail with
    /// [`Error::InvalidSeek`], and streams without exact size metadata
    /// fail with [`Error::NotSupported`].
    #[instrument(skip(self), fields(length = self.length))]
    pub async fn seek(&mut self, target: SeekFrom) -> Result<u64> {
        if self.closed {
            return Err(Error::Cancelled);
        }
        let position = self.resolve(target)?;
        // Rewinding to the start never needs size metadata.
        if !self.seekable && position != self.position && position != 0 {
            return Err(Error::not_supported(
                "stream lacks exact size metadata for seeking",
            ));
        }
        self.inner.seek(position).await?;
        self.position = position;
        Ok(position)
    }

    fn resolve(&self, target: SeekFrom) -> Result<u64> {
        let position = match target {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => checked_add_signed(self.length, delta),
            SeekFrom::Current(delta) => checked_add_signed(self.position, delta),
        };
        match position {
            Some(p) if p <= self.length => Ok(p),
            Some(p) => Err(Error::InvalidSeek {
                position: p,
                length: self.length,
            }),
            None => Err(Error::InvalidSeek {
                position: u64::MAX,
                length: self.length,
            }),
        }
    }

    /// Cancel all outstanding prefetches and release every resource.
    ///
    /// When this returns, no task owned by the stream is still running and
    /// every borrowed connection has been given back (aborted fetches
    /// destroy theirs). Idempotent.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel.cancel();
        self.inner.close().await;
        debug!("stream closed");
    }
}

impl Drop for FileStream {
    fn drop(&mut self) {
        // Best-effort cancellation for streams dropped without close():
        // the token stops in-flight fetches, and each part reader's
        // JoinSet aborts its tasks on drop.
        self.cancel.cancel();
    }
}

fn checked_add_signed(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checked_add_signed() {
        assert_eq!(checked_add_signed(100, -1), Some(99));
        assert_eq!(checked_add_signed(100, 1), Some(101));
        assert_eq!(checked_add_signed(0, -1), None);
        assert_eq!(checked_add_signed(u64::MAX, 1), None);
    }
}
