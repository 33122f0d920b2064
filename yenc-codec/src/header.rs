//! Parsing of `=ybegin`, `=ypart`, and `=yend` control lines

use crate::error::{Error, Result};

/// Parsed `=ybegin` header line
///
/// All fields except `name` are advisory; the decoder validates the payload
/// against the trailer, not the header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YencHeader {
    /// Part number for multi-part postings
    pub part: Option<u32>,
    /// Total number of parts, when the poster included it
    pub total: Option<u32>,
    /// Declared encoded line length
    pub line: usize,
    /// Declared size of the complete file
    pub size: u64,
    /// Original file name
    pub name: String,
}

/// Parsed `=ypart` line (present for multi-part postings)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YencPart {
    /// First byte of this part within the file, 1-based inclusive
    pub begin: u64,
    /// Last byte of this part within the file, 1-based inclusive
    pub end: u64,
}

impl YencPart {
    /// Number of payload bytes this part carries
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin) + 1
    }

    /// Whether the part spans zero bytes
    pub fn is_empty(&self) -> bool {
        self.end < self.begin
    }
}

/// Parsed `=yend` trailer line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct YencTrailer {
    /// Declared size of the decoded payload
    pub size: u64,
    /// Part number echoed from the header
    pub part: Option<u32>,
    /// CRC-32 of this part's decoded payload
    pub pcrc32: Option<u32>,
    /// CRC-32 of the complete file
    pub crc32: Option<u32>,
}

/// Iterate `key=value` attributes on a control line.
///
/// The `name` attribute is special-cased: it consumes the remainder of the
/// line, spaces included, so it must come last (as yEnc mandates).
fn attributes(line: &str) -> impl Iterator<Item = (&str, &str)> {
    let mut rest = line.trim_start();
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }
        let eq = rest.find('=')?;
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        if key == "name" {
            rest = "";
            return Some((key, after.trim_end()));
        }
        let (value, remainder) = match after.find(' ') {
            Some(sp) => (&after[..sp], after[sp + 1..].trim_start()),
            None => (after, ""),
        };
        rest = remainder;
        Some((key, value))
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64> {
    value
        .parse::<u64>()
        .map_err(|_| Error::malformed(format!("invalid {key} value: {value:?}")))
}

fn parse_u32(key: &str, value: &str) -> Result<u32> {
    value
        .parse::<u32>()
        .map_err(|_| Error::malformed(format!("invalid {key} value: {value:?}")))
}

fn parse_crc(key: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| Error::malformed(format!("invalid {key} value: {value:?}")))
}

impl YencHeader {
    /// Parse the attribute portion of a `=ybegin` line (after the keyword).
    pub fn parse(line: &str) -> Result<Self> {
        let mut part = None;
        let mut total = None;
        let mut line_len = None;
        let mut size = None;
        let mut name = None;

        for (key, value) in attributes(line) {
            match key {
                "part" => part = Some(parse_u32(key, value)?),
                "total" => total = Some(parse_u32(key, value)?),
                "line" => line_len = Some(parse_u64(key, value)? as usize),
                "size" => size = Some(parse_u64(key, value)?),
                "name" => name = Some(value.to_string()),
                _ => {}
            }
        }

        Ok(Self {
            part,
            total,
            line: line_len.ok_or_else(|| Error::malformed("=ybegin missing line="))?,
            size: size.ok_or_else(|| Error::malformed("=ybegin missing size="))?,
            name: name.ok_or_else(|| Error::malformed("=ybegin missing name="))?,
        })
    }
}

impl YencPart {
    /// Parse the attribute portion of a `=ypart` line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut begin = None;
        let mut end = None;

        for (key, value) in attributes(line) {
            match key {
                "begin" => begin = Some(parse_u64(key, value)?),
                "end" => end = Some(parse_u64(key, value)?),
                _ => {}
            }
        }

        let begin = begin.ok_or_else(|| Error::malformed("=ypart missing begin="))?;
        let end = end.ok_or_else(|| Error::malformed("=ypart missing end="))?;
        if begin == 0 || end < begin {
            return Err(Error::malformed(format!(
                "invalid =ypart range {begin}..{end}"
            )));
        }

        Ok(Self { begin, end })
    }
}

impl YencTrailer {
    /// Parse the attribute portion of a `=yend` line.
    pub fn parse(line: &str) -> Result<Self> {
        let mut size = None;
        let mut part = None;
        let mut pcrc32 = None;
        let mut crc32 = None;

        for (key, value) in attributes(line) {
            match key {
                "size" => size = Some(parse_u64(key, value)?),
                "part" => part = Some(parse_u32(key, value)?),
                "pcrc32" => pcrc32 = Some(parse_crc(key, value)?),
                "crc32" => crc32 = Some(parse_crc(key, value)?),
                _ => {}
            }
        }

        Ok(Self {
            size: size.ok_or_else(|| Error::malformed("=yend missing size="))?,
            part,
            pcrc32,
            crc32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_part_header() {
        let header = YencHeader::parse("line=128 size=123456 name=mybinary.dat").unwrap();
        assert_eq!(header.part, None);
        assert_eq!(header.line, 128);
        assert_eq!(header.size, 123456);
        assert_eq!(header.name, "mybinary.dat");
    }

    #[test]
    fn test_parse_multipart_header_with_spaces_in_name() {
        let header =
            YencHeader::parse("part=3 total=10 line=128 size=500000 name=some file.mkv").unwrap();
        assert_eq!(header.part, Some(3));
        assert_eq!(header.total, Some(10));
        assert_eq!(header.name, "some file.mkv");
    }

    #[test]
    fn test_parse_part_line() {
        let part = YencPart::parse("begin=1 end=100000").unwrap();
        assert_eq!(part.begin, 1);
        assert_eq!(part.end, 100000);
        assert_eq!(part.len(), 100000);
    }

    #[test]
    fn test_parse_part_rejects_inverted_range() {
        assert!(YencPart::parse("begin=50 end=10").is_err());
        assert!(YencPart::parse("begin=0 end=10").is_err());
    }

    #[test]
    fn test_parse_trailer() {
        let trailer = YencTrailer::parse("size=100000 part=3 pcrc32=aabbccdd").unwrap();
        assert_eq!(trailer.size, 100000);
        assert_eq!(trailer.part, Some(3));
        assert_eq!(trailer.pcrc32, Some(0xaabbccdd));
        assert_eq!(trailer.crc32, None);
    }

    #[test]
    fn test_parse_trailer_missing_size() {
        assert!(YencTrailer::parse("part=3 pcrc32=aabbccdd").is_err());
    }

    #[test]
    fn test_header_missing_name() {
        assert!(YencHeader::parse("line=128 size=42").is_err());
    }
}
