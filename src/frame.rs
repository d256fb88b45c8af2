//! Byte-level group framing.
//!
//! A container file is a sequence of groups, each framed as:
//!
//! ```text
//! varint64  N          N = item count + 1, so N >= 1
//! varint32  tag_len    1..=MAX_TAG_LENGTH for tagged data
//! bytes     tag
//! N-1 times:
//!   varint32  len      len <= MAX_MESSAGE_SIZE
//!   bytes     payload
//! ```
//!
//! This module knows nothing about payload contents: it serializes whole
//! groups into a byte buffer for the emitter and provides the streaming
//! varint/byte reads the iterator decodes groups with, enforcing the size
//! ceilings.

use crate::bgzf_input::BgzfInput;
use crate::errors::{Result, VpkgError};
use crate::varint;

/// Items larger than this are refused on both read and write.
pub const MAX_MESSAGE_SIZE: u64 = 1_000_000_000;

/// Serialize one complete group into `out`.
///
/// The caller has already validated the tag and message sizes; this is
/// pure framing.
pub fn encode_group(tag: &[u8], messages: &[Vec<u8>], out: &mut Vec<u8>) {
    varint::encode_u64(out, messages.len() as u64 + 1);
    varint::encode_u32(out, tag.len() as u32);
    out.extend_from_slice(tag);
    for message in messages {
        varint::encode_u32(out, message.len() as u32);
        out.extend_from_slice(message);
    }
}

/// Parse a group prelude (count, tag-candidate) from a peeked byte slice,
/// without consuming anything.
///
/// Returns `None` when the bytes cannot be a tagged group header: varint
/// parse failure, zero count, or a tag length outside
/// `1..=MAX_TAG_LENGTH`. Registry approval of the tag is the caller's
/// business.
#[must_use]
pub(crate) fn parse_group_prelude(buf: &[u8]) -> Option<(u64, Vec<u8>)> {
    let (count, used) = varint::decode_u64(buf)?;
    if count < 1 {
        return None;
    }
    let rest = &buf[used..];
    let (tag_len, used) = varint::decode_u32(rest)?;
    let tag_len = tag_len as usize;
    if tag_len == 0 || tag_len > crate::registry::MAX_TAG_LENGTH {
        return None;
    }
    let rest = &rest[used..];
    if rest.len() < tag_len {
        return None;
    }
    Some((count, rest[..tag_len].to_vec()))
}

/// Read one byte, or `None` at end of input.
fn read_byte(input: &mut BgzfInput) -> Result<Option<u8>> {
    let available = input.fill_buf()?;
    let Some(&byte) = available.first() else {
        return Ok(None);
    };
    input.consume(1);
    Ok(Some(byte))
}

/// Read a 64-bit varint, treating end-of-input *before the first byte* as a
/// clean end of the stream (`Ok(None)`). End of input mid-varint is a
/// malformed frame at `at`.
pub(crate) fn try_read_varint64(input: &mut BgzfInput, at: i64) -> Result<Option<u64>> {
    let mut value: u64 = 0;
    for i in 0..varint::MAX_VARINT64_LEN {
        let Some(byte) = read_byte(input)? else {
            if i == 0 {
                return Ok(None);
            }
            return Err(VpkgError::malformed(at, "input ends in the middle of a varint"));
        };
        let payload = u64::from(byte & 0x7f);
        if i == varint::MAX_VARINT64_LEN - 1 && payload > 1 {
            return Err(VpkgError::malformed(at, "varint overflows 64 bits"));
        }
        value |= payload << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some(value));
        }
    }
    Err(VpkgError::malformed(at, "varint longer than 10 bytes"))
}

/// Read a 32-bit varint; any end of input is a malformed frame at `at`.
pub(crate) fn read_varint32(input: &mut BgzfInput, at: i64) -> Result<u32> {
    let value = try_read_varint64(input, at)?
        .ok_or_else(|| VpkgError::malformed(at, "input ends where a length varint is required"))?;
    u32::try_from(value).map_err(|_| VpkgError::malformed(at, "length varint overflows 32 bits"))
}

/// Read exactly `len` payload bytes; a short read is a malformed frame.
pub(crate) fn read_exact_vec(input: &mut BgzfInput, len: usize, at: i64) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(len);
    while out.len() < len {
        let available = input.fill_buf()?;
        if available.is_empty() {
            return Err(VpkgError::malformed(
                at,
                format!("input ends {} bytes into a {len}-byte item", out.len()),
            ));
        }
        let take = available.len().min(len - out.len());
        out.extend_from_slice(&available[..take]);
        input.consume(take);
    }
    Ok(out)
}
