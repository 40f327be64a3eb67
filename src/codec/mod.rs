//! MQTT Packet Codec
//!
//! Bit-exact encoding and decoding of MQTT v3.1 / v3.1.1 control packets.

mod decode;
mod encode;


pub use decode::Decoder;
pub use encode::Encoder;

use crate::protocol::{DecodeError, EncodeError};
use bytes::{BufMut, BytesMut};

/// Maximum remaining length (268,435,455 bytes = ~256 MB)
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Longest string or binary field (u16 length prefix)
pub const MAX_STRING_LEN: usize = u16::MAX as usize;

/// Default maximum packet size accepted by the decoder
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Read the remaining-length varint from the start of `buf`.
///
/// Returns `(value, bytes_consumed)`. An input that ends mid-sequence is
/// `InsufficientData` (retry with more bytes); a continuation bit on the
/// fourth byte is `MalformedLength`.
#[inline]
pub fn read_remaining_length(buf: &[u8]) -> Result<(usize, usize), DecodeError> {
    let mut multiplier: usize = 1;
    let mut value: usize = 0;
    let mut pos = 0;

    loop {
        if pos >= 4 {
            return Err(DecodeError::MalformedLength);
        }
        let Some(&byte) = buf.get(pos) else {
            return Err(DecodeError::InsufficientData);
        };
        value += (byte & 0x7F) as usize * multiplier;
        pos += 1;

        if byte & 0x80 == 0 {
            break;
        }
        multiplier *= 128;
    }

    Ok((value, pos))
}

/// Write `value` as a remaining-length varint, returning the bytes written
#[inline]
pub fn write_remaining_length(buf: &mut BytesMut, mut value: usize) -> Result<usize, EncodeError> {
    if value > MAX_REMAINING_LENGTH {
        return Err(EncodeError::RemainingLengthOverflow(value));
    }

    let mut count = 0;
    loop {
        let mut byte = (value % 128) as u8;
        value /= 128;
        if value > 0 {
            byte |= 0x80;
        }
        buf.put_u8(byte);
        count += 1;
        if value == 0 {
            break;
        }
    }
    Ok(count)
}

/// Number of bytes the remaining-length varint for `value` occupies
#[inline]
pub fn remaining_length_len(value: usize) -> usize {
    if value < 128 {
        1
    } else if value < 16_384 {
        2
    } else if value < 2_097_152 {
        3
    } else {
        4
    }
}

/// Read a big-endian u16 from a complete frame body
#[inline]
pub fn read_u16(buf: &[u8]) -> Result<u16, DecodeError> {
    match buf {
        [hi, lo, ..] => Ok(u16::from_be_bytes([*hi, *lo])),
        _ => Err(DecodeError::MalformedPacket("truncated two byte integer")),
    }
}

/// Read a length-prefixed UTF-8 string from a complete frame body.
/// Returns (string, bytes_consumed).
#[inline]
pub fn read_string(buf: &[u8]) -> Result<(&str, usize), DecodeError> {
    let (bytes, consumed) = read_prefixed(buf, "truncated string")?;
    let s = std::str::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8)?;

    if s.contains('\0') {
        return Err(DecodeError::MalformedPacket(
            "string contains null character",
        ));
    }

    Ok((s, consumed))
}

/// Read length-prefixed binary data from a complete frame body.
/// Returns (data, bytes_consumed).
#[inline]
pub fn read_binary(buf: &[u8]) -> Result<(&[u8], usize), DecodeError> {
    read_prefixed(buf, "truncated binary data")
}

#[inline]
fn read_prefixed<'a>(buf: &'a [u8], what: &'static str) -> Result<(&'a [u8], usize), DecodeError> {
    let len = read_u16(buf).map_err(|_| DecodeError::MalformedPacket(what))? as usize;
    let total_len = 2 + len;
    if buf.len() < total_len {
        return Err(DecodeError::MalformedPacket(what));
    }
    Ok((&buf[2..total_len], total_len))
}

/// Write a length-prefixed UTF-8 string
#[inline]
pub fn write_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    write_binary(buf, s.as_bytes())
}

/// Write length-prefixed binary data
#[inline]
pub fn write_binary(buf: &mut BytesMut, data: &[u8]) -> Result<(), EncodeError> {
    let len = data.len();
    if len > MAX_STRING_LEN {
        return Err(EncodeError::StringTooLong);
    }
    buf.put_u16(len as u16);
    buf.put_slice(data);
    Ok(())
}
