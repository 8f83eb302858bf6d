//! Unsigned LEB128 varints, used for stored heights and priorities.

use crate::error::{CoreError, Result};

/// Maximum encoded length of a `u64`.
pub const MAX_VARINT_LEN: usize = 10;

/// Encode `value` as an unsigned varint.
pub fn encode_uvarint(mut value: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(MAX_VARINT_LEN);
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
    out
}

/// Decode an unsigned varint occupying the whole of `bytes`.
pub fn decode_uvarint(bytes: &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for (i, byte) in bytes.iter().enumerate() {
        if i == MAX_VARINT_LEN || (i == MAX_VARINT_LEN - 1 && *byte > 1) {
            return Err(CoreError::InvalidVarint("value overflows u64".to_string()));
        }
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if i + 1 != bytes.len() {
                return Err(CoreError::InvalidVarint(format!(
                    "{} trailing bytes",
                    bytes.len() - i - 1
                )));
            }
            return Ok(value);
        }
    }
    Err(CoreError::InvalidVarint("truncated input".to_string()))
}
