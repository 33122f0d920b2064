//! Deterministic fixture generators

use yenc_codec::EncodeOptions;

/// Deterministic pseudo-random payload for segment `ordinal` of a test
/// file. Stable across runs so byte-exactness checks can rebuild the
/// baseline independently.
pub fn segment_payload(seed: u64, ordinal: usize, len: usize) -> Vec<u8> {
    // xorshift64*, one state per (seed, ordinal)
    let mut state = seed
        .wrapping_mul(0x9e37_79b9_7f4a_7c15)
        .wrapping_add(ordinal as u64 + 1);
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        state ^= state >> 12;
        state ^= state << 25;
        state ^= state >> 27;
        let word = state.wrapping_mul(0x2545_f491_4f6c_dd1d);
        out.extend_from_slice(&word.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// Message-id for segment `ordinal` of a named test file.
pub fn segment_msg_id(name: &str, ordinal: usize) -> String {
    format!("<{name}.part{ordinal}@test.local>")
}

/// A complete yEnc article body for one segment of a multipart posting.
///
/// `file_offset` is the 0-based position of this segment's first byte
/// within the file; the yEnc part line uses the format's 1-based inclusive
/// convention.
pub fn yenc_article(
    name: &str,
    part: u32,
    total: u32,
    file_offset: u64,
    file_size: u64,
    payload: &[u8],
) -> Vec<u8> {
    let begin = file_offset + 1;
    let end = file_offset + payload.len() as u64;
    let opts = EncodeOptions::new(name)
        .part(part, total, begin, end)
        .file_size(file_size);
    yenc_codec::encode(payload, &opts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_is_deterministic() {
        assert_eq!(segment_payload(1, 0, 1024), segment_payload(1, 0, 1024));
        assert_ne!(segment_payload(1, 0, 1024), segment_payload(1, 1, 1024));
        assert_ne!(segment_payload(1, 0, 1024), segment_payload(2, 0, 1024));
        assert_eq!(segment_payload(7, 3, 1000).len(), 1000);
    }

    #[test]
    fn test_article_round_trips() {
        let payload = segment_payload(42, 5, 700);
        let article = yenc_article("file.bin", 6, 10, 3500, 7000, &payload);
        let decoded = yenc_codec::decode(&article).unwrap();
        assert_eq!(&decoded.data[..], &payload[..]);
        assert_eq!(decoded.part.unwrap().begin, 3501);
    }
}
