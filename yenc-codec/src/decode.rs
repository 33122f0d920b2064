//! yEnc article body decoding

use bytes::Bytes;
use tracing::trace;

use crate::error::{Error, Result};
use crate::header::{YencHeader, YencPart, YencTrailer};
use crate::{ESCAPE, ESCAPE_SHIFT, YENC_SHIFT};

/// A fully decoded yEnc article payload
#[derive(Debug, Clone)]
pub struct Decoded {
    /// The binary payload
    pub data: Bytes,
    /// Parsed `=ybegin` header
    pub header: YencHeader,
    /// Parsed `=ypart` line, present for multi-part postings
    pub part: Option<YencPart>,
    /// Parsed `=yend` trailer
    pub trailer: YencTrailer,
}

impl Decoded {
    /// Number of decoded payload bytes this article carries.
    ///
    /// For multi-part postings this is the part size, not the file size.
    pub fn expected_len(&self) -> u64 {
        self.part.map_or(self.trailer.size, |p| p.len())
    }
}

/// Decode one yEnc article body into its binary payload.
///
/// `raw` is the article body exactly as reassembled by the NNTP layer
/// (dot-unstuffed, line structure intact; CRLF and bare LF both accepted).
/// Lines before `=ybegin` and after `=yend` are ignored, matching how
/// posters wrap payloads in subject banners.
///
/// Validation follows the trailer: the decoded size must match the `=ypart`
/// range (or the declared size for single-part postings), and CRC-32 is
/// checked when the trailer carries `pcrc32` (or `crc32` for single-part
/// postings) and skipped when absent.
///
/// Exactly one output buffer of the final payload size is allocated.
///
/// # Errors
///
/// Returns [`Error::Malformed`] for structural problems (missing control
/// lines, dangling escape bytes, zero-size payloads),
/// [`Error::SizeMismatch`] or [`Error::CrcMismatch`] for validation
/// failures.
pub fn decode(raw: &[u8]) -> Result<Decoded> {
    let mut lines = Lines::new(raw);

    let header = loop {
        let line = lines
            .next()
            .ok_or_else(|| Error::malformed("missing =ybegin line"))?;
        if let Some(rest) = strip_keyword(line, b"=ybegin ") {
            break YencHeader::parse(&lossy(rest))?;
        }
    };

    let mut part = None;
    let mut first_body_line: Option<&[u8]> = None;
    if let Some(line) = lines.next() {
        if let Some(rest) = strip_keyword(line, b"=ypart ") {
            part = Some(YencPart::parse(&lossy(rest))?);
        } else {
            first_body_line = Some(line);
        }
    }

    let expected = part.map_or(header.size, |p| p.len());
    if expected == 0 {
        return Err(Error::malformed("zero-size payload"));
    }

    let mut out: Vec<u8> = Vec::with_capacity(expected as usize);
    let mut trailer = None;

    let body_lines = first_body_line.into_iter().chain(&mut lines);
    for line in body_lines {
        if let Some(rest) = strip_keyword(line, b"=yend ") {
            trailer = Some(YencTrailer::parse(&lossy(rest))?);
            break;
        }
        decode_line(line, &mut out)?;
    }

    let trailer = trailer.ok_or_else(|| Error::malformed("missing =yend trailer"))?;

    let declared = part.map_or(trailer.size, |p| p.len());
    if out.len() as u64 != declared {
        return Err(Error::SizeMismatch {
            expected: declared,
            actual: out.len() as u64,
        });
    }

    // pcrc32 covers this part's payload; crc32 covers the whole file and is
    // only comparable for single-part postings.
    let crc_to_check = match (trailer.pcrc32, trailer.crc32, part) {
        (Some(crc), _, _) => Some(crc),
        (None, Some(crc), None) => Some(crc),
        _ => None,
    };
    if let Some(expected_crc) = crc_to_check {
        let actual = crc32fast::hash(&out);
        if actual != expected_crc {
            return Err(Error::CrcMismatch {
                expected: expected_crc,
                actual,
            });
        }
    }

    trace!(
        name = %header.name,
        part = ?header.part,
        bytes = out.len(),
        "decoded yEnc article"
    );

    Ok(Decoded {
        data: Bytes::from(out),
        header,
        part,
        trailer,
    })
}

/// Decode a single encoded body line, appending payload bytes to `out`.
fn decode_line(line: &[u8], out: &mut Vec<u8>) -> Result<()> {
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == ESCAPE {
            i += 1;
            let Some(&escaped) = line.get(i) else {
                return Err(Error::malformed("dangling escape at end of line"));
            };
            out.push(escaped.wrapping_sub(ESCAPE_SHIFT).wrapping_sub(YENC_SHIFT));
        } else {
            out.push(b.wrapping_sub(YENC_SHIFT));
        }
        i += 1;
    }
    Ok(())
}

fn strip_keyword<'a>(line: &'a [u8], keyword: &[u8]) -> Option<&'a [u8]> {
    line.strip_prefix(keyword)
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Iterator over lines of an article body, tolerant of CRLF and bare LF.
struct Lines<'a> {
    rest: &'a [u8],
}

impl<'a> Lines<'a> {
    fn new(raw: &'a [u8]) -> Self {
        Self { rest: raw }
    }
}

impl<'a> Iterator for Lines<'a> {
    type Item = &'a [u8];

    fn next(&mut self) -> Option<&'a [u8]> {
        if self.rest.is_empty() {
            return None;
        }
        match self.rest.iter().position(|&b| b == b'\n') {
            Some(nl) => {
                let mut line = &self.rest[..nl];
                if line.last() == Some(&b'\r') {
                    line = &line[..line.len() - 1];
                }
                self.rest = &self.rest[nl + 1..];
                Some(line)
            }
            None => {
                let line = self.rest;
                self.rest = &[];
                Some(line)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode::{EncodeOptions, encode};
    use pretty_assertions::assert_eq;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 + 13) as u8).collect()
    }

    #[test]
    fn test_decode_single_part() {
        let data = payload(1000);
        let encoded = encode(&data, &EncodeOptions::new("file.bin"));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded.data[..], &data[..]);
        assert_eq!(decoded.header.name, "file.bin");
        assert_eq!(decoded.part, None);
    }

    #[test]
    fn test_decode_multipart() {
        let data = payload(700_000);
        let opts = EncodeOptions::new("movie.mkv").part(2, 5, 700_001, 1_400_000);
        let encoded = encode(&data, &opts);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded.data[..], &data[..]);
        assert_eq!(decoded.part.unwrap().begin, 700_001);
        assert_eq!(decoded.expected_len(), 700_000);
    }

    #[test]
    fn test_decode_all_byte_values() {
        let data: Vec<u8> = (0..=255u8).cycle().take(4096).collect();
        let encoded = encode(&data, &EncodeOptions::new("all.bin"));
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded.data[..], &data[..]);
    }

    #[test]
    fn test_decode_rejects_missing_begin() {
        assert!(matches!(
            decode(b"random banner\r\nmore text\r\n"),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_decode_rejects_missing_trailer() {
        let data = payload(100);
        let encoded = encode(&data, &EncodeOptions::new("f"));
        // Chop off the =yend line.
        let end = encoded
            .windows(6)
            .position(|w| w == b"=yend ")
            .unwrap();
        assert!(matches!(
            decode(&encoded[..end]),
            Err(Error::Malformed { .. })
        ));
    }

    #[test]
    fn test_decode_detects_corruption_via_crc() {
        let data = payload(512);
        let mut encoded = encode(&data, &EncodeOptions::new("f"));
        // Flip one payload byte after the header line, avoiding control
        // characters so the line structure survives.
        let body_start = encoded.iter().position(|&b| b == b'\n').unwrap() + 1;
        encoded[body_start] = encoded[body_start].wrapping_add(1);
        match decode(&encoded) {
            Err(Error::CrcMismatch { .. }) => {}
            other => panic!("expected CRC mismatch, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_without_crc_is_tolerant() {
        let data = payload(256);
        let opts = EncodeOptions::new("f").without_crc();
        let encoded = encode(&data, &opts);
        let decoded = decode(&encoded).unwrap();
        assert_eq!(&decoded.data[..], &data[..]);
        assert_eq!(decoded.trailer.pcrc32, None);
    }

    #[test]
    fn test_decode_rejects_zero_size() {
        let body = b"=ybegin line=128 size=0 name=empty\r\n=yend size=0\r\n";
        assert!(matches!(decode(body), Err(Error::Malformed { .. })));
    }

    #[test]
    fn test_decode_size_mismatch() {
        let body = b"=ybegin line=128 size=10 name=short\r\nrJ\r\n=yend size=10\r\n";
        assert!(matches!(decode(body), Err(Error::SizeMismatch { .. })));
    }

    #[test]
    fn test_decode_skips_leading_banner() {
        let data = payload(64);
        let encoded = encode(&data, &EncodeOptions::new("f"));
        let mut with_banner = b"This post brought to you by...\r\n".to_vec();
        with_banner.extend_from_slice(&encoded);
        let decoded = decode(&with_banner).unwrap();
        assert_eq!(&decoded.data[..], &data[..]);
    }
}
