//! File descriptors: how a logical file maps onto Usenet articles
//!
//! A descriptor is assembled by the import pipeline (outside this core)
//! and is immutable afterwards. It lists the articles whose decoded
//! payloads tile the file, the byte-range arithmetic for multipart
//! containers, and the optional de-obfuscation/decryption parameters.

use nntp_client::MsgId;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Error, Result};

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteRange {
    /// First byte, inclusive
    pub start: u64,
    /// One past the last byte
    pub end: u64,
}

impl ByteRange {
    /// Construct a range, validating `start <= end`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if start > end {
            return Err(Error::invalid_descriptor(format!(
                "inverted byte range {start}..{end}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Number of bytes covered.
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    /// Whether the range covers zero bytes.
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether `offset` falls inside the range.
    pub fn contains(&self, offset: u64) -> bool {
        offset >= self.start && offset < self.end
    }
}

/// One article carrying one chunk of content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    /// The article
    pub msg_id: MsgId,
    /// Decoded payload size, when the index carried it. Required for
    /// seekable streams.
    pub size_hint: Option<u64>,
    /// Position within the part's segment sequence
    pub ordinal: usize,
}

impl SegmentDescriptor {
    /// Segment with a known decoded size.
    pub fn sized(msg_id: impl Into<MsgId>, ordinal: usize, size: u64) -> Self {
        Self {
            msg_id: msg_id.into(),
            size_hint: Some(size),
            ordinal,
        }
    }
}

/// AES-256-CTR decryption parameters
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AesParams {
    /// 256-bit key
    pub key: [u8; 32],
    /// Initial counter block
    pub iv: [u8; 16],
}

// Key material stays out of Debug output.
impl fmt::Debug for AesParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesParams")
            .field("key", &"<redacted>")
            .field("iv", &"<redacted>")
            .finish()
    }
}

/// One file part: a run of segments plus the range arithmetic mapping it
/// into the logical file.
///
/// The concatenation of the part's decoded segments, sliced to
/// `segment_byte_range`, contributes the bytes `file_byte_range` of the
/// file. For a stored RAR volume that slice typically cuts the volume
/// header and trailer off (`32 .. size - 8`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePart {
    /// Segments, emit order
    pub segments: Vec<SegmentDescriptor>,
    /// Slice of the decoded segment concatenation
    pub segment_byte_range: ByteRange,
    /// Where the slice lands in the logical file
    pub file_byte_range: ByteRange,
}

/// Complete recipe for materializing one file's byte stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// File parts, file order
    pub parts: Vec<FilePart>,
    /// Repeating-XOR de-obfuscation key, applied to raw segment bytes
    pub xor_key: Option<[u8; 4]>,
    /// AES-256-CTR decryption, applied after XOR
    pub aes: Option<AesParams>,
}

impl FileDescriptor {
    /// Descriptor over a plain run of segments: one part, no slicing, no
    /// transforms. Every segment needs a size hint.
    pub fn flat(segments: Vec<SegmentDescriptor>) -> Result<Self> {
        let mut total = 0u64;
        for segment in &segments {
            let size = segment.size_hint.ok_or_else(|| {
                Error::invalid_descriptor("flat descriptor requires segment sizes")
            })?;
            total += size;
        }
        let range = ByteRange::new(0, total)?;
        let descriptor = Self {
            parts: vec![FilePart {
                segments,
                segment_byte_range: range,
                file_byte_range: range,
            }],
            xor_key: None,
            aes: None,
        };
        descriptor.validate()?;
        Ok(descriptor)
    }

    /// Attach a repeating-XOR de-obfuscation key.
    #[must_use]
    pub fn with_xor_key(mut self, key: [u8; 4]) -> Self {
        self.xor_key = Some(key);
        self
    }

    /// Attach AES-256-CTR decryption parameters.
    #[must_use]
    pub fn with_aes(mut self, key: [u8; 32], iv: [u8; 16]) -> Self {
        self.aes = Some(AesParams { key, iv });
        self
    }

    /// Check every descriptor invariant.
    ///
    /// Called once at stream construction; a stream never runs over an
    /// invalid descriptor.
    pub fn validate(&self) -> Result<()> {
        if self.parts.is_empty() {
            return Err(Error::invalid_descriptor("descriptor has no parts"));
        }
        let mut expected_start = 0u64;
        for (index, part) in self.parts.iter().enumerate() {
            if part.segments.is_empty() {
                return Err(Error::invalid_descriptor(format!(
                    "part {index} has no segments"
                )));
            }
            for segment in &part.segments {
                if segment.size_hint == Some(0) {
                    return Err(Error::invalid_descriptor(format!(
                        "zero-size segment {}",
                        segment.msg_id
                    )));
                }
            }
            if part.segment_byte_range.len() != part.file_byte_range.len() {
                return Err(Error::invalid_descriptor(format!(
                    "part {index}: segment range covers {} bytes but file range covers {}",
                    part.segment_byte_range.len(),
                    part.file_byte_range.len()
                )));
            }
            if part.file_byte_range.is_empty() {
                return Err(Error::invalid_descriptor(format!("part {index} is empty")));
            }
            if part.file_byte_range.start != expected_start {
                return Err(Error::invalid_descriptor(format!(
                    "part {index} starts at {} but the file is contiguous up to {expected_start}",
                    part.file_byte_range.start
                )));
            }
            if let Some(total) = part.declared_segment_total()
                && part.segment_byte_range.end > total
            {
                return Err(Error::invalid_descriptor(format!(
                    "part {index}: segment range ends at {} but segments only carry {total} bytes",
                    part.segment_byte_range.end
                )));
            }
            expected_start = part.file_byte_range.end;
        }
        Ok(())
    }

    /// Logical file length: the parts tile `[0, len)`.
    pub fn len(&self) -> u64 {
        self.parts.last().map_or(0, |part| part.file_byte_range.end)
    }

    /// Whether the descriptor describes zero bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A stream is seekable iff every part carries exact byte-range
    /// metadata and every segment has a size hint.
    pub fn is_seekable(&self) -> bool {
        self.parts
            .iter()
            .all(|part| part.segments.iter().all(|s| s.size_hint.is_some()))
    }
}

impl FilePart {
    /// Sum of segment size hints, `None` when any hint is absent.
    pub fn declared_segment_total(&self) -> Option<u64> {
        self.segments
            .iter()
            .map(|s| s.size_hint)
            .try_fold(0u64, |acc, size| size.map(|s| acc + s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(ordinal: usize, size: u64) -> SegmentDescriptor {
        SegmentDescriptor::sized(
            MsgId::new(format!("seg{ordinal}@test")),
            ordinal,
            size,
        )
    }

    #[test]
    fn test_flat_descriptor() {
        let descriptor =
            FileDescriptor::flat(vec![segment(0, 1000), segment(1, 1000), segment(2, 500)])
                .unwrap();
        assert_eq!(descriptor.len(), 2500);
        assert!(descriptor.is_seekable());
        assert_eq!(descriptor.parts.len(), 1);
    }

    #[test]
    fn test_flat_requires_sizes() {
        let mut unsized_segment = segment(0, 10);
        unsized_segment.size_hint = None;
        assert!(FileDescriptor::flat(vec![unsized_segment]).is_err());
    }

    #[test]
    fn test_rejects_zero_size_segment() {
        let part = FilePart {
            segments: vec![segment(0, 0)],
            segment_byte_range: ByteRange { start: 0, end: 0 },
            file_byte_range: ByteRange { start: 0, end: 0 },
        };
        let descriptor = FileDescriptor {
            parts: vec![part],
            xor_key: None,
            aes: None,
        };
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_rejects_non_contiguous_parts() {
        let make_part = |file_start: u64, file_end: u64| FilePart {
            segments: vec![segment(0, file_end - file_start)],
            segment_byte_range: ByteRange {
                start: 0,
                end: file_end - file_start,
            },
            file_byte_range: ByteRange {
                start: file_start,
                end: file_end,
            },
        };
        let descriptor = FileDescriptor {
            parts: vec![make_part(0, 100), make_part(150, 200)],
            xor_key: None,
            aes: None,
        };
        assert!(descriptor.validate().is_err());

        let contiguous = FileDescriptor {
            parts: vec![make_part(0, 100), make_part(100, 200)],
            xor_key: None,
            aes: None,
        };
        contiguous.validate().unwrap();
        assert_eq!(contiguous.len(), 200);
    }

    #[test]
    fn test_rejects_mismatched_range_lengths() {
        let part = FilePart {
            segments: vec![segment(0, 100)],
            segment_byte_range: ByteRange { start: 0, end: 100 },
            file_byte_range: ByteRange { start: 0, end: 50 },
        };
        let descriptor = FileDescriptor {
            parts: vec![part],
            xor_key: None,
            aes: None,
        };
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn test_seekability_needs_every_size() {
        let mut descriptor =
            FileDescriptor::flat(vec![segment(0, 1000), segment(1, 1000)]).unwrap();
        assert!(descriptor.is_seekable());
        descriptor.parts[0].segments[1].size_hint = None;
        assert!(!descriptor.is_seekable());
    }

    #[test]
    fn test_rejects_segment_range_past_declared_total() {
        let part = FilePart {
            segments: vec![segment(0, 100)],
            segment_byte_range: ByteRange { start: 32, end: 132 },
            file_byte_range: ByteRange { start: 0, end: 100 },
        };
        let descriptor = FileDescriptor {
            parts: vec![part],
            xor_key: None,
            aes: None,
        };
        assert!(descriptor.validate().is_err());
    }
}
