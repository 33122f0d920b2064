//! Multipart concatenation
//!
//! A logical file can span several container volumes, each mapped by a
//! [`FilePart`] onto its own segment run. This stream stitches the parts
//! together: reads walk the part containing the current offset, and
//! crossing a part boundary tears down the finished part's reader so its
//! prefetch budget goes to the next one.

use async_trait::async_trait;
use nntp_client::{ArticleFetcher, UsageContext};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::{AesCtrStream, BoxedByteStream, ByteStream, SliceStream, XorStream};
use crate::descriptor::{FileDescriptor, FilePart};
use crate::error::{Error, Result};
use crate::prefetch::SegmentReader;

/// Concatenates a descriptor's parts into one logical byte stream,
/// applying the per-part transform chain (XOR, then AES-CTR, then the
/// byte-range slice) on the way through.
pub struct MultipartStream {
    fetcher: Arc<ArticleFetcher>,
    ctx: UsageContext,
    descriptor: Arc<FileDescriptor>,
    budget: Arc<Semaphore>,
    budget_size: usize,
    window_cap: usize,
    cancel: CancellationToken,
    position: u64,
    active: Option<(usize, BoxedByteStream)>,
}

impl MultipartStream {
    /// Stream over a validated descriptor. Nothing is fetched until the
    /// first read.
    pub fn new(
        fetcher: Arc<ArticleFetcher>,
        ctx: UsageContext,
        descriptor: Arc<FileDescriptor>,
        budget: Arc<Semaphore>,
        budget_size: usize,
        window_cap: usize,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fetcher,
            ctx,
            descriptor,
            budget,
            budget_size,
            window_cap,
            cancel,
            position: 0,
            active: None,
        }
    }

    /// Index of the part containing `position`.
    fn locate_part(&self, position: u64) -> usize {
        self.descriptor
            .parts
            .partition_point(|part| part.file_byte_range.end <= position)
    }

    /// Build the transform chain for one part.
    fn build_part(&self, part: &FilePart) -> BoxedByteStream {
        let reader = SegmentReader::new(
            Arc::clone(&self.fetcher),
            self.ctx.clone(),
            part.segments.clone(),
            Arc::clone(&self.budget),
            self.budget_size,
            self.window_cap,
            self.cancel.child_token(),
        );
        let mut chain: BoxedByteStream = Box::new(reader);
        if let Some(key) = self.descriptor.xor_key {
            chain = Box::new(XorStream::new(chain, key));
        }
        if let Some(aes) = &self.descriptor.aes {
            chain = Box::new(AesCtrStream::new(chain, aes));
        }
        Box::new(SliceStream::new(chain, part.segment_byte_range))
    }

    /// Make sure the reader for the part containing `position` is open and
    /// positioned.
    async fn activate(&mut self, part_index: usize, intra: u64) -> Result<()> {
        let same_part = self.active.as_ref().is_some_and(|(i, _)| *i == part_index);
        if !same_part {
            if let Some((old_index, mut old)) = self.active.take() {
                debug!(old_index, part_index, "switching parts");
                old.close().await;
            }
            let part = &self.descriptor.parts[part_index];
            let mut chain = self.build_part(part);
            if intra > 0 {
                chain.seek(intra).await?;
            }
            self.active = Some((part_index, chain));
        }
        Ok(())
    }
}

#[async_trait]
impl ByteStream for MultipartStream {
    async fn read(&mut self, dst: &mut [u8]) -> Result<usize> {
        let length = self.descriptor.len();
        if self.position >= length || dst.is_empty() {
            return Ok(0);
        }
        let part_index = self.locate_part(self.position);
        let part_start = self.descriptor.parts[part_index].file_byte_range.start;
        self.activate(part_index, self.position - part_start).await?;

        let part_end = self.descriptor.parts[part_index].file_byte_range.end;
        let until_boundary = (part_end - self.position) as usize;
        let want = dst.len().min(until_boundary);

        let Some((_, stream)) = self.active.as_mut() else {
            return Err(Error::unavailable("no active part reader"));
        };
        let n = stream.read(&mut dst[..want]).await?;
        if n == 0 {
            // The part's segments ran out before its declared range: the
            // descriptor promised bytes the articles do not carry.
            return Err(Error::unavailable(format!(
                "part {part_index} exhausted {until_boundary} bytes early"
            )));
        }
        self.position += n as u64;
        if self.position == part_end {
            trace!(part_index, "part boundary reached");
        }
        Ok(n)
    }

    async fn seek(&mut self, position: u64) -> Result<()> {
        let length = self.descriptor.len();
        if position > length {
            return Err(Error::InvalidSeek { position, length });
        }
        self.position = position;
        if position == length {
            // Parked at EOF; drop the active reader so its prefetches stop.
            if let Some((_, mut old)) = self.active.take() {
                old.close().await;
            }
            return Ok(());
        }

        let part_index = self.locate_part(position);
        let part_start = self.descriptor.parts[part_index].file_byte_range.start;
        match self.active.as_mut() {
            Some((active_index, stream)) if *active_index == part_index => {
                stream.seek(position - part_start).await
            }
            _ => {
                // Different part: tear down now to release the prefetch
                // budget, reopen lazily on the next read.
                if let Some((_, mut old)) = self.active.take() {
                    old.close().await;
                }
                Ok(())
            }
        }
    }

    fn len(&self) -> Option<u64> {
        Some(self.descriptor.len())
    }

    async fn close(&mut self) {
        self.cancel.cancel();
        if let Some((_, mut stream)) = self.active.take() {
            stream.close().await;
        }
    }
}
