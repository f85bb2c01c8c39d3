//! Variable-length Integer Encoding (Varint)
//!
//! Chunk payloads store timestamps as deltas from the previous point. Scrape
//! intervals are regular, so deltas are small and repeat; a LEB128 varint keeps
//! them at one or two bytes instead of eight.
//!
//! Signed deltas (the first point of a chunk is relative to the chunk's
//! `min_time`, later points to their predecessor) go through ZigZag so that small
//! negative numbers stay small too: 0 → 0, -1 → 1, 1 → 2, -2 → 3.
//!
//! Decoding is fallible: a truncated chunk must surface as a corrupt block, never
//! as a panic inside a query.
//!
//! ```ignore
//! let mut buf = BytesMut::new();
//! encode_varint(&mut buf, 60_000);
//! let delta = decode_varint(&mut buf.as_ref())?;
//! ```

use bytes::{Buf, BufMut};

use crate::error::{Error, Result};

/// Encode a signed integer as a ZigZag varint
pub fn encode_varint(buf: &mut impl BufMut, value: i64) {
    let unsigned = ((value << 1) ^ (value >> 63)) as u64;
    encode_varint_u64(buf, unsigned);
}

/// Encode an unsigned integer as a varint
pub fn encode_varint_u64(buf: &mut impl BufMut, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Decode a ZigZag varint to a signed integer
pub fn decode_varint(buf: &mut impl Buf) -> Result<i64> {
    let unsigned = decode_varint_u64(buf)?;
    Ok(((unsigned >> 1) as i64) ^ -((unsigned & 1) as i64))
}

/// Decode a varint to an unsigned integer
pub fn decode_varint_u64(buf: &mut impl Buf) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;

    loop {
        if !buf.has_remaining() {
            return Err(Error::InvalidBlock("truncated varint".to_string()));
        }
        let byte = buf.get_u8();
        value |= ((byte & 0x7F) as u64) << shift;

        if byte & 0x80 == 0 {
            return Ok(value);
        }

        shift += 7;
        if shift >= 64 {
            return Err(Error::InvalidBlock("varint overflows u64".to_string()));
        }
    }
}

/// Number of bytes `value` occupies once encoded
pub fn encoded_len_u64(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn roundtrip(value: i64) -> i64 {
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, value);
        decode_varint(&mut buf.as_ref()).unwrap()
    }

    #[test]
    fn test_signed_boundaries() {
        for v in [0, 1, -1, 63, -64, 60_000, i64::MAX, i64::MIN, i64::MIN + 1] {
            assert_eq!(roundtrip(v), v);
        }
    }

    #[test]
    fn test_scrape_interval_delta_is_small() {
        // A 15s scrape interval in milliseconds fits in 3 bytes
        let mut buf = BytesMut::new();
        encode_varint(&mut buf, 15_000);
        assert_eq!(buf.len(), 3);

        let mut buf = BytesMut::new();
        encode_varint(&mut buf, -1);
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn test_encoded_len_matches_encoding() {
        for v in [0u64, 127, 128, 16_383, 16_384, u64::MAX] {
            let mut buf = BytesMut::new();
            encode_varint_u64(&mut buf, v);
            assert_eq!(buf.len(), encoded_len_u64(v));
        }
    }

    #[test]
    fn test_truncated_input_is_an_error() {
        let mut buf = BytesMut::new();
        encode_varint_u64(&mut buf, 1 << 20);
        let truncated = &buf[..buf.len() - 1];
        let err = decode_varint_u64(&mut &truncated[..]).unwrap_err();
        assert!(matches!(err, Error::InvalidBlock(_)));
    }

    #[test]
    fn test_overlong_input_is_an_error() {
        let bytes = [0xFFu8; 11];
        assert!(decode_varint_u64(&mut &bytes[..]).is_err());
    }
}
