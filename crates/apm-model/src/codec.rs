// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Versioned binary layout for records that are persisted or sent over the wire.
//!
//! Every record starts with a big-endian `i32` layout version followed by its fields in
//! a fixed order. Each type owns one decode routine per version it understands and
//! rejects anything else, so a reader never guesses at a layout it has not seen.
//!
//! Field encodings:
//! - strings: `i32` byte length followed by UTF-8 bytes; `-1` encodes an absent value
//! - nested records: a presence byte (`0`/`1`) followed by the record's own versioned
//!   encoding
//! - collections: `i32` element count followed by that many encoded elements
//! - integers: big-endian, booleans: a single `0`/`1` byte

use bytes::{Buf, BufMut, Bytes, BytesMut};

const NULL_LENGTH: i32 = -1;
const MAX_STRING_LEN: usize = i32::MAX as usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("Unsupported {record} layout version {found}")]
    UnsupportedVersion { record: &'static str, found: i32 },

    #[error("Truncated record: needed {needed} bytes but only {remaining} remain")]
    Truncated { needed: usize, remaining: usize },

    #[error("String field is not valid UTF-8")]
    InvalidUtf8,

    #[error("Invalid {field} tag {tag}")]
    InvalidTag { field: &'static str, tag: u8 },

    #[error("Invalid negative length {0}")]
    NegativeLength(i32),

    #[error("Required field {0} is absent")]
    MissingField(&'static str),

    #[error("{0} unexpected trailing bytes after record")]
    TrailingBytes(usize),
}

/// A type with a stable, versioned binary encoding.
pub trait Record: Sized {
    /// Name used in error messages.
    const NAME: &'static str;

    /// Layout version written by [`Record::encode`].
    const VERSION: i32;

    /// Writes the version header followed by the current layout.
    fn encode<B: BufMut>(&self, buf: &mut B);

    /// Reads the version header and dispatches to the matching layout.
    fn decode<B: Buf>(buf: &mut B) -> Result<Self, CodecError>;

    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes exactly one record. Leftover input is an error.
    fn from_bytes(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut buf = bytes;
        let record = Self::decode(&mut buf)?;
        if buf.has_remaining() {
            return Err(CodecError::TrailingBytes(buf.remaining()));
        }
        Ok(record)
    }
}

fn ensure<B: Buf>(buf: &B, needed: usize) -> Result<(), CodecError> {
    if buf.remaining() < needed {
        return Err(CodecError::Truncated {
            needed,
            remaining: buf.remaining(),
        });
    }
    Ok(())
}

pub fn get_version<B: Buf>(buf: &mut B) -> Result<i32, CodecError> {
    get_i32(buf)
}

pub fn get_u8<B: Buf>(buf: &mut B) -> Result<u8, CodecError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

pub fn get_i32<B: Buf>(buf: &mut B) -> Result<i32, CodecError> {
    ensure(buf, 4)?;
    Ok(buf.get_i32())
}

pub fn get_u64<B: Buf>(buf: &mut B) -> Result<u64, CodecError> {
    ensure(buf, 8)?;
    Ok(buf.get_u64())
}

pub fn put_bool<B: BufMut>(buf: &mut B, value: bool) {
    buf.put_u8(u8::from(value));
}

pub fn get_bool<B: Buf>(buf: &mut B, field: &'static str) -> Result<bool, CodecError> {
    match get_u8(buf)? {
        0 => Ok(false),
        1 => Ok(true),
        tag => Err(CodecError::InvalidTag { field, tag }),
    }
}

/// Writes `value`. A string longer than `i32::MAX` bytes is cut to the longest prefix
/// that fits and ends on a char boundary, so the output always decodes.
pub fn put_string<B: BufMut>(buf: &mut B, value: Option<&str>) {
    match value {
        Some(value) => {
            let value = truncate_to_boundary(value, MAX_STRING_LEN);
            buf.put_i32(value.len() as i32);
            buf.put_slice(value.as_bytes());
        }
        None => buf.put_i32(NULL_LENGTH),
    }
}

fn truncate_to_boundary(value: &str, max_len: usize) -> &str {
    if value.len() <= max_len {
        return value;
    }
    let mut len = max_len;
    while !value.is_char_boundary(len) {
        len -= 1;
    }
    &value[..len]
}

pub fn get_string<B: Buf>(buf: &mut B) -> Result<Option<String>, CodecError> {
    let len = get_i32(buf)?;
    if len == NULL_LENGTH {
        return Ok(None);
    }
    let len = usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))?;
    ensure(buf, len)?;
    let bytes = buf.copy_to_bytes(len);
    String::from_utf8(bytes.to_vec())
        .map(Some)
        .map_err(|_| CodecError::InvalidUtf8)
}

/// Reads a string that must be present.
pub fn get_required_string<B: Buf>(
    buf: &mut B,
    field: &'static str,
) -> Result<String, CodecError> {
    get_string(buf)?.ok_or(CodecError::MissingField(field))
}

pub fn put_count<B: BufMut>(buf: &mut B, count: usize) {
    buf.put_i32(i32::try_from(count).unwrap_or(i32::MAX));
}

pub fn get_count<B: Buf>(buf: &mut B) -> Result<usize, CodecError> {
    let count = get_i32(buf)?;
    usize::try_from(count).map_err(|_| CodecError::NegativeLength(count))
}

pub fn put_optional<R: Record, B: BufMut>(buf: &mut B, value: Option<&R>) {
    match value {
        Some(record) => {
            buf.put_u8(1);
            record.encode(buf);
        }
        None => buf.put_u8(0),
    }
}

pub fn get_optional<R: Record, B: Buf>(buf: &mut B) -> Result<Option<R>, CodecError> {
    if get_bool(buf, R::NAME)? {
        R::decode(buf).map(Some)
    } else {
        Ok(None)
    }
}
