//! Variable-length integer encoding.
//!
//! 7 bits per byte, least significant group first, high bit set on every
//! byte except the last.

use std::io::Read;

use byteorder::ReadBytesExt;

use crate::error::{Result, TesseraError};

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(encoded_len(value));
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80;
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Number of bytes `value` occupies once encoded.
pub fn encoded_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros() as usize;
    bits.div_ceil(7).max(1)
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(TesseraError::corrupt("varint overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encoded_len_matches_encoding() {
        for value in [0, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            assert_eq!(encode_u64(value).len(), encoded_len(value));
        }
    }

    #[test]
    fn test_read_back() {
        let mut bytes = encode_u64(300);
        bytes.extend(encode_u64(u64::MAX));
        let mut reader = bytes.as_slice();
        assert_eq!(read_u64(&mut reader).unwrap(), 300);
        assert_eq!(read_u64(&mut reader).unwrap(), u64::MAX);
        assert!(read_u64(&mut reader).is_err());
    }

    #[test]
    fn test_overlong_input_is_rejected() {
        let bytes = [0xffu8; 11];
        assert!(read_u64(&mut bytes.as_slice()).is_err());
    }
}
