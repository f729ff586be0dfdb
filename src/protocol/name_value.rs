//! Variable-length integers and name-value pairs.
//!
//! Lengths below 128 take one byte. Longer lengths take four bytes, big
//! endian, with the top bit of the first byte set:
//!
//! ```text
//! 0xxxxxxx                               value <= 127
//! 1xxxxxxx xxxxxxxx xxxxxxxx xxxxxxxx    31-bit value
//! ```
//!
//! A pair is `name_len, value_len, name, value`. PARAMS and
//! GET_VALUES(_RESULT) bodies are plain sequences of pairs that end where the
//! content ends.

use bytes::{BufMut, Bytes, BytesMut};

use super::record::ByteSource;
use crate::error::{FcgiError, Result};

/// Largest value a varint can carry.
pub const MAX_VARINT: u32 = 0x7FFF_FFFF;

const LONG_FORM: u8 = 0x80;

/// Encoded size of `value`.
#[inline]
pub fn varint_len(value: u32) -> usize {
    if value <= 127 {
        1
    } else {
        4
    }
}

/// Append `value` as a varint.
///
/// # Panics
///
/// Panics in debug builds if `value` exceeds [`MAX_VARINT`].
pub fn encode_varint(value: u32, buf: &mut BytesMut) {
    debug_assert!(value <= MAX_VARINT);
    if value <= 127 {
        buf.put_u8(value as u8);
    } else {
        buf.put_u32((value & MAX_VARINT) | (u32::from(LONG_FORM) << 24));
    }
}

/// Read one varint.
pub fn decode_varint<S: ByteSource + ?Sized>(src: &mut S) -> Result<u32> {
    let mut first = [0u8; 1];
    src.fill(&mut first)?;
    if first[0] & LONG_FORM == 0 {
        return Ok(u32::from(first[0]));
    }
    let mut rest = [0u8; 3];
    src.fill(&mut rest)?;
    Ok(u32::from(first[0] & !LONG_FORM) << 24
        | u32::from(rest[0]) << 16
        | u32::from(rest[1]) << 8
        | u32::from(rest[2]))
}

/// Read the two length prefixes of a pair.
pub fn read_lengths<S: ByteSource + ?Sized>(src: &mut S) -> Result<(usize, usize)> {
    let name_len = decode_varint(src)? as usize;
    let value_len = decode_varint(src)? as usize;
    Ok((name_len, value_len))
}

/// Read one complete pair.
pub fn read_pair<S: ByteSource + ?Sized>(src: &mut S) -> Result<(Bytes, Bytes)> {
    let (name_len, value_len) = read_lengths(src)?;
    if let Some(available) = src.known_len() {
        if name_len.saturating_add(value_len) > available {
            return Err(FcgiError::Framing(format!(
                "pair of {} + {} bytes with {} left",
                name_len, value_len, available
            )));
        }
    }
    let name = src.take(name_len)?;
    let value = src.take(value_len)?;
    Ok((name, value))
}

/// Encoded size of one pair.
pub fn pair_len(name: &[u8], value: &[u8]) -> usize {
    varint_len(name.len() as u32) + varint_len(value.len() as u32) + name.len() + value.len()
}

/// Append one pair.
pub fn encode_pair(name: &[u8], value: &[u8], buf: &mut BytesMut) -> Result<()> {
    for part in [name, value] {
        if part.len() > MAX_VARINT as usize {
            return Err(FcgiError::Framing(format!(
                "name-value component of {} bytes is too long",
                part.len()
            )));
        }
    }
    buf.reserve(pair_len(name, value));
    encode_varint(name.len() as u32, buf);
    encode_varint(value.len() as u32, buf);
    buf.put_slice(name);
    buf.put_slice(value);
    Ok(())
}

/// Encode a sequence of pairs into one body.
pub fn encode_pairs<'a, I>(pairs: I) -> Result<Bytes>
where
    I: IntoIterator<Item = (&'a [u8], &'a [u8])>,
{
    let mut buf = BytesMut::new();
    for (name, value) in pairs {
        encode_pair(name, value, &mut buf)?;
    }
    Ok(buf.freeze())
}
