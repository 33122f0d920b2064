//! yEnc article body encoding
//!
//! The encoder exists for the mock article server and the round-trip
//! property tests; production traffic is decode-only.

use crate::{DEFAULT_LINE_LENGTH, ESCAPE, ESCAPE_SHIFT, YENC_SHIFT};

/// Multi-part placement of an encoded payload within its file
#[derive(Debug, Clone, Copy)]
struct PartSpec {
    part: u32,
    total: u32,
    /// 1-based inclusive
    begin: u64,
    /// 1-based inclusive
    end: u64,
}

/// Options controlling [`encode`]
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    name: String,
    line_length: usize,
    part: Option<PartSpec>,
    with_crc: bool,
    file_size: Option<u64>,
}

impl EncodeOptions {
    /// Encode as a single-part posting of `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            line_length: DEFAULT_LINE_LENGTH,
            part: None,
            with_crc: true,
            file_size: None,
        }
    }

    /// Encode as part `part` of `total`, occupying file bytes
    /// `begin..=end` (1-based inclusive, yEnc convention).
    #[must_use]
    pub fn part(mut self, part: u32, total: u32, begin: u64, end: u64) -> Self {
        self.part = Some(PartSpec {
            part,
            total,
            begin,
            end,
        });
        self
    }

    /// Override the encoded line length (default 128).
    #[must_use]
    pub fn line_length(mut self, line_length: usize) -> Self {
        self.line_length = line_length.max(1);
        self
    }

    /// Omit `pcrc32`/`crc32` from the trailer, as sloppy posters do.
    #[must_use]
    pub fn without_crc(mut self) -> Self {
        self.with_crc = false;
        self
    }

    /// Declare a total file size different from the payload length
    /// (multi-part headers carry the file size, not the part size).
    #[must_use]
    pub fn file_size(mut self, size: u64) -> Self {
        self.file_size = Some(size);
        self
    }
}

/// Encode a binary payload as a yEnc article body (CRLF line endings).
///
/// The output is ready to be served as an NNTP `BODY` payload; dot-stuffing
/// is the transport's job and is not applied here.
pub fn encode(data: &[u8], opts: &EncodeOptions) -> Vec<u8> {
    let declared_size = opts.file_size.unwrap_or(data.len() as u64);

    // Worst case every byte escapes, plus line breaks and control lines.
    let mut out = Vec::with_capacity(data.len() * 2 + data.len() / opts.line_length * 2 + 256);

    match opts.part {
        Some(p) => {
            out.extend_from_slice(
                format!(
                    "=ybegin part={} total={} line={} size={} name={}\r\n",
                    p.part, p.total, opts.line_length, declared_size, opts.name
                )
                .as_bytes(),
            );
            out.extend_from_slice(format!("=ypart begin={} end={}\r\n", p.begin, p.end).as_bytes());
        }
        None => {
            out.extend_from_slice(
                format!(
                    "=ybegin line={} size={} name={}\r\n",
                    opts.line_length, declared_size, opts.name
                )
                .as_bytes(),
            );
        }
    }

    let mut column = 0usize;
    for &raw in data {
        let encoded = raw.wrapping_add(YENC_SHIFT);
        let must_escape = matches!(encoded, 0x00 | 0x0a | 0x0d | 0x3d)
            || (column == 0 && matches!(encoded, 0x09 | 0x20 | 0x2e));
        if must_escape {
            out.push(ESCAPE);
            out.push(encoded.wrapping_add(ESCAPE_SHIFT));
            column += 2;
        } else {
            out.push(encoded);
            column += 1;
        }
        if column >= opts.line_length {
            out.extend_from_slice(b"\r\n");
            column = 0;
        }
    }
    if column > 0 {
        out.extend_from_slice(b"\r\n");
    }

    let mut trailer = format!("=yend size={}", data.len());
    if let Some(p) = opts.part {
        trailer.push_str(&format!(" part={}", p.part));
        if opts.with_crc {
            trailer.push_str(&format!(" pcrc32={:08x}", crc32fast::hash(data)));
        }
    } else if opts.with_crc {
        trailer.push_str(&format!(" crc32={:08x}", crc32fast::hash(data)));
    }
    trailer.push_str("\r\n");
    out.extend_from_slice(trailer.as_bytes());

    out
}
