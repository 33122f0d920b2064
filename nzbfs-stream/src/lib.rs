//! Seekable byte streams over Usenet article storage
//!
//! The top layer of the nzbfs data plane. A [`FileDescriptor`] carries an
//! ordered list of article segments plus the byte-range arithmetic and
//! optional XOR/AES transforms that map them onto a logical file.
//! [`open_stream`] turns one into a [`FileStream`]: a seekable, read-only byte
//! stream that materializes content on demand by fetching articles through
//! the pooled NNTP client, decoding them, and reassembling bytes in order
//! while prefetching well ahead of the reader.
//!
//! # Example
//!
//! ```no_run
//! use nzbfs_stream::{FileDescriptor, SegmentDescriptor, StreamOptions, open_stream};
//! use nntp_client::{ArticleFetcher, MsgId, UsageContext};
//! use std::io::SeekFrom;
//! use std::sync::Arc;
//!
//! # async fn example(fetcher: Arc<ArticleFetcher>) -> Result<(), Box<dyn std::error::Error>> {
//! let descriptor = FileDescriptor::flat(vec![
//!     SegmentDescriptor::sized(MsgId::new("part1@post"), 0, 700_000),
//!     SegmentDescriptor::sized(MsgId::new("part2@post"), 1, 700_000),
//! ])?;
//!
//! let mut stream = open_stream(
//!     fetcher,
//!     descriptor,
//!     UsageContext::streaming("some.release"),
//!     StreamOptions::default(),
//! )?;
//!
//! stream.seek(SeekFrom::Start(1_000_000)).await?;
//! let mut buf = vec![0u8; 64 * 1024];
//! let n = stream.read(&mut buf).await?;
//! println!("read {n} bytes at offset 1000000");
//! stream.close().await;
//! # Ok(())
//! # }
//! ```

mod descriptor;
mod error;
mod prefetch;
mod stream;
mod transform;

pub use descriptor::{AesParams, ByteRange, FileDescriptor, FilePart, SegmentDescriptor};
pub use error::{Error, Result};
pub use prefetch::SegmentReader;
pub use stream::{FileStream, StreamOptions, open_stream};
pub use transform::{
    AesCtrStream, BoxedByteStream, ByteStream, MultipartStream, SliceStream, XorStream,
};
