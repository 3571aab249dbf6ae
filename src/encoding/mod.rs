//! Fixed-width binary encoding for on-media persistence.
//!
//! This module provides the hand-written, byte-stable helpers that back the
//! per-file metadata codec and the in-zone record headers. Because the
//! on-media format must never change under a dependency upgrade, no external
//! serialization library is used.
//!
//! # Wire format
//!
//! | Item                 | Encoding                         |
//! |----------------------|----------------------------------|
//! | `u32`                | 4 bytes, little-endian           |
//! | `u64`                | 8 bytes, little-endian           |
//! | length-prefixed blob | `[u32 len LE][bytes]`            |
//!
//! All decode helpers take a `&mut &[u8]` cursor and advance it past the
//! consumed bytes, so a caller can walk a buffer containing a sequence of
//! fields.
//!
//! # Zero-panic guarantee
//!
//! No function here panics on malformed input; truncated buffers surface as
//! [`EncodingError::UnexpectedEof`].

#[cfg(test)]
mod tests;

use thiserror::Error;

// ------------------------------------------------------------------------------------------------
// Error type
// ------------------------------------------------------------------------------------------------

/// Errors produced during encoding or decoding.
#[derive(Debug, Error)]
pub enum EncodingError {
    /// The buffer ran out of bytes before decoding completed.
    #[error("unexpected end of buffer (need {needed} bytes, have {available})")]
    UnexpectedEof {
        /// Bytes required to continue decoding.
        needed: usize,
        /// Bytes actually remaining.
        available: usize,
    },

    /// A length field exceeded the representable or remaining range.
    #[error("length overflow: {0}")]
    LengthOverflow(String),
}

// ------------------------------------------------------------------------------------------------
// Internal helpers
// ------------------------------------------------------------------------------------------------

/// Verify that `buf` has at least `needed` bytes.
#[inline]
fn require(buf: &[u8], needed: usize) -> Result<(), EncodingError> {
    if buf.len() < needed {
        Err(EncodingError::UnexpectedEof {
            needed,
            available: buf.len(),
        })
    } else {
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Put helpers
// ------------------------------------------------------------------------------------------------

/// Append a little-endian `u32` to `buf`.
#[inline]
pub fn put_fixed32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a little-endian `u64` to `buf`.
#[inline]
pub fn put_fixed64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

/// Append a `u32`-length-prefixed blob to `buf`.
///
/// Returns `Err` if the blob is longer than `u32::MAX` bytes.
pub fn put_length_prefixed_slice(buf: &mut Vec<u8>, value: &[u8]) -> Result<(), EncodingError> {
    let len = u32::try_from(value.len())
        .map_err(|_| EncodingError::LengthOverflow(format!("blob of {} bytes", value.len())))?;
    put_fixed32(buf, len);
    buf.extend_from_slice(value);
    Ok(())
}

// ------------------------------------------------------------------------------------------------
// Get helpers
// ------------------------------------------------------------------------------------------------

/// Decode a little-endian `u32` from the front of `input`, advancing it.
pub fn get_fixed32(input: &mut &[u8]) -> Result<u32, EncodingError> {
    require(input, 4)?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&input[..4]);
    *input = &input[4..];
    Ok(u32::from_le_bytes(raw))
}

/// Decode a little-endian `u64` from the front of `input`, advancing it.
pub fn get_fixed64(input: &mut &[u8]) -> Result<u64, EncodingError> {
    require(input, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&input[..8]);
    *input = &input[8..];
    Ok(u64::from_le_bytes(raw))
}

/// Decode a `u32`-length-prefixed blob from the front of `input`, advancing it.
pub fn get_length_prefixed_slice<'a>(input: &mut &'a [u8]) -> Result<&'a [u8], EncodingError> {
    let len = get_fixed32(input)? as usize;
    require(input, len)?;
    let (head, rest) = input.split_at(len);
    *input = rest;
    Ok(head)
}

/// Decode a little-endian `u64` at `offset` within `buf` without a cursor.
///
/// Used by the record-header decoders that peek into a larger read buffer.
pub fn decode_fixed64_at(buf: &[u8], offset: usize) -> Result<u64, EncodingError> {
    let end = offset
        .checked_add(8)
        .ok_or_else(|| EncodingError::LengthOverflow(format!("header offset {offset}")))?;
    require(buf, end)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[offset..end]);
    Ok(u64::from_le_bytes(raw))
}
