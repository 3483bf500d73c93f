//! LEB128 variable-length integer decoding.
//!
//! Every LEB128 decoder takes a byte slice and returns the value together with
//! the number of bytes consumed. Fixed-width little-endian immediates (float
//! constants and `v128.const`) are read with the `decode_*_bits` helpers.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,
    #[error("overflows a {0}-bit integer")]
    Overflow(u32),
}

const MAX_LEN_32: usize = 5;
const MAX_LEN_33: usize = 5;
const MAX_LEN_64: usize = 10;

/// Decodes an unsigned 32-bit integer.
pub fn decode_u32(bytes: &[u8]) -> Result<(u32, usize), DecodeError> {
    let mut result = 0u32;
    for i in 0..MAX_LEN_32 {
        let byte = *bytes.get(i).ok_or(DecodeError::UnexpectedEof)?;
        if i == MAX_LEN_32 - 1 && byte & 0xf0 != 0 {
            return Err(DecodeError::Overflow(32));
        }
        result |= u32::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(DecodeError::Overflow(32))
}

/// Decodes an unsigned 64-bit integer.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize), DecodeError> {
    let mut result = 0u64;
    for i in 0..MAX_LEN_64 {
        let byte = *bytes.get(i).ok_or(DecodeError::UnexpectedEof)?;
        if i == MAX_LEN_64 - 1 && byte > 1 {
            return Err(DecodeError::Overflow(64));
        }
        result |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok((result, i + 1));
        }
    }
    Err(DecodeError::Overflow(64))
}

/// Decodes a signed integer of `bits` width into an `i64`, sign-extending the
/// result and rejecting encodings whose unused bits are not a sign extension.
fn decode_signed(bytes: &[u8], bits: u32, max_len: usize) -> Result<(i64, usize), DecodeError> {
    let mut result = 0i64;
    let mut shift = 0u32;
    for i in 0..max_len {
        let byte = *bytes.get(i).ok_or(DecodeError::UnexpectedEof)?;
        if shift < 64 {
            result |= i64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 != 0 {
            continue;
        }
        if i == max_len - 1 {
            // Bits of the last byte beyond `bits` must all equal the sign bit.
            let used = bits - 7 * (max_len as u32 - 1);
            let sign_and_unused = (byte as i8) << 1 >> used;
            if sign_and_unused != 0 && sign_and_unused != -1 {
                return Err(DecodeError::Overflow(bits));
            }
        }
        if shift < 64 && byte & 0x40 != 0 {
            result |= -1i64 << shift;
        }
        if bits < 64 {
            // Truncate to `bits` and sign-extend back out.
            let unused = 64 - bits;
            result = result << unused >> unused;
        }
        return Ok((result, i + 1));
    }
    Err(DecodeError::Overflow(bits))
}

/// Decodes a signed 32-bit integer.
pub fn decode_i32(bytes: &[u8]) -> Result<(i32, usize), DecodeError> {
    let (value, read) = decode_signed(bytes, 32, MAX_LEN_32)?;
    Ok((value as i32, read))
}

/// Decodes a signed 33-bit integer, as used by block types.
pub fn decode_i33_as_i64(bytes: &[u8]) -> Result<(i64, usize), DecodeError> {
    decode_signed(bytes, 33, MAX_LEN_33)
}

/// Decodes a signed 64-bit integer.
pub fn decode_i64(bytes: &[u8]) -> Result<(i64, usize), DecodeError> {
    decode_signed(bytes, 64, MAX_LEN_64)
}

/// Decodes an unsigned 32-bit integer from input that has already been
/// validated, yielding zero on malformed input.
pub fn load_u32(bytes: &[u8]) -> u32 {
    decode_u32(bytes).map_or(0, |(v, _)| v)
}

/// Like [`load_u32`], for signed 32-bit integers.
pub fn load_i32(bytes: &[u8]) -> i32 {
    decode_i32(bytes).map_or(0, |(v, _)| v)
}

/// Like [`load_u32`], for signed 64-bit integers.
pub fn load_i64(bytes: &[u8]) -> i64 {
    decode_i64(bytes).map_or(0, |(v, _)| v)
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N], DecodeError> {
    bytes
        .get(..N)
        .and_then(|b| b.try_into().ok())
        .ok_or(DecodeError::UnexpectedEof)
}

/// Reads the bit pattern of a little-endian IEEE-754 `f32`.
pub fn decode_f32_bits(bytes: &[u8]) -> Result<u32, DecodeError> {
    fixed(bytes).map(u32::from_le_bytes)
}

/// Reads the bit pattern of a little-endian IEEE-754 `f64`.
pub fn decode_f64_bits(bytes: &[u8]) -> Result<u64, DecodeError> {
    fixed(bytes).map(u64::from_le_bytes)
}

/// Reads a 16-byte `v128` immediate.
pub fn decode_v128(bytes: &[u8]) -> Result<u128, DecodeError> {
    fixed(bytes).map(u128::from_le_bytes)
}

/// Encodes an unsigned 32-bit integer.
pub fn encode_u32(mut value: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_LEN_32);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            return buf;
        }
        buf.push(byte | 0x80);
    }
}

/// Encodes a signed 64-bit integer.
pub fn encode_i64(mut value: i64) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_LEN_64);
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            buf.push(byte);
            return buf;
        }
        buf.push(byte | 0x80);
    }
}

/// Encodes a signed 32-bit integer.
pub fn encode_i32(value: i32) -> Vec<u8> {
    encode_i64(i64::from(value))
}
