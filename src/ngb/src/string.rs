//! String payload decoding
//!
//! Three encodings appear in NGB streams:
//! - Standard: u32 LE byte length, then UTF-8 bytes
//! - UTF-16LE: u32 LE byte length (must be even), then UTF-16LE code units
//! - FFFEFF: `FF FE FF`, one length byte, UTF-8 bytes, `00 00`
//!
//! The type id does not say which one applies, so every call takes the
//! encoding explicitly.
//!
//! The FFFEFF length is a single byte, so a body holds 0..=255 bytes. No
//! wider length form is recognised; `encode` refuses longer strings.

use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, FFFEFF};

/// Size of the Standard / UTF-16LE length prefix
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Terminator after an FFFEFF string body
pub const FFFEFF_TERMINATOR: [u8; 2] = [0x00, 0x00];

/// String encoding expected by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringEncoding {
    #[default]
    Standard,
    Utf16Le,
    Fffeff,
}

/// Decode one string starting at `pos`.
///
/// Returns the text and the position just past it. `base` is the absolute
/// offset of `buf[0]` and is only used to report error offsets.
pub fn read(
    buf: &[u8],
    pos: usize,
    encoding: StringEncoding,
    base: usize,
) -> Result<(String, usize)> {
    let (body, next) = body(buf, pos, encoding, base)?;
    let body_offset = base + next - body.len() - trailer_len(encoding);

    let text = match encoding {
        StringEncoding::Standard | StringEncoding::Fffeff => utf8(body, body_offset)?,
        StringEncoding::Utf16Le => utf16le(body, body_offset)?,
    };

    Ok((text, next))
}

/// Decode a single string occupying the start of `buf`
pub fn decode(buf: &[u8], encoding: StringEncoding) -> Result<String> {
    read(buf, 0, encoding, 0).map(|(s, _)| s)
}

/// Byte length of `count` consecutive strings starting at `pos`.
///
/// Walks the length prefixes without decoding any text.
pub fn measure(
    buf: &[u8],
    pos: usize,
    count: u32,
    encoding: StringEncoding,
    base: usize,
) -> Result<usize> {
    let mut cursor = pos;
    for _ in 0..count {
        let (_, next) = body(buf, cursor, encoding, base)?;
        cursor = next;
    }
    Ok(cursor - pos)
}

/// Encode a string in the given encoding
pub fn encode(s: &str, encoding: StringEncoding) -> Result<Vec<u8>> {
    match encoding {
        StringEncoding::Standard => with_length_prefix(s.as_bytes()),
        StringEncoding::Utf16Le => {
            let bytes: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
            with_length_prefix(&bytes)
        }
        StringEncoding::Fffeff => {
            let len = u8::try_from(s.len()).map_err(|_| {
                Error::corrupted(format!("FFFEFF string of {} bytes is too long", s.len()))
            })?;
            let mut out = Vec::with_capacity(s.len() + 6);
            out.extend_from_slice(&FFFEFF);
            out.push(len);
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(&FFFEFF_TERMINATOR);
            Ok(out)
        }
    }
}

fn with_length_prefix(bytes: &[u8]) -> Result<Vec<u8>> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| Error::corrupted(format!("string of {} bytes is too long", bytes.len())))?;
    let mut out = Vec::with_capacity(LENGTH_PREFIX_SIZE + bytes.len());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(out)
}

fn trailer_len(encoding: StringEncoding) -> usize {
    match encoding {
        StringEncoding::Fffeff => FFFEFF_TERMINATOR.len(),
        _ => 0,
    }
}

/// Locate the raw body of one string and the position after it
fn body(buf: &[u8], pos: usize, encoding: StringEncoding, base: usize) -> Result<(&[u8], usize)> {
    match encoding {
        StringEncoding::Standard => length_prefixed(buf, pos, base),
        StringEncoding::Utf16Le => {
            let (body, next) = length_prefixed(buf, pos, base)?;
            if body.len() % 2 != 0 {
                return Err(Error::corrupted_at(
                    base + pos,
                    format!("UTF-16 string has odd byte length {}", body.len()),
                ));
            }
            Ok((body, next))
        }
        StringEncoding::Fffeff => fffeff_body(buf, pos, base),
    }
}

fn length_prefixed(buf: &[u8], pos: usize, base: usize) -> Result<(&[u8], usize)> {
    let start = pos + LENGTH_PREFIX_SIZE;
    if start > buf.len() {
        return Err(Error::corrupted_at(
            base + pos,
            "truncated string length prefix",
        ));
    }

    let len = LittleEndian::read_u32(&buf[pos..start]) as usize;
    let end = start
        .checked_add(len)
        .filter(|&end| end <= buf.len())
        .ok_or_else(|| {
            Error::corrupted_at(
                base + pos,
                format!(
                    "string of {} bytes overruns buffer ({} bytes left)",
                    len,
                    buf.len() - start
                ),
            )
        })?;

    Ok((&buf[start..end], end))
}

fn fffeff_body(buf: &[u8], pos: usize, base: usize) -> Result<(&[u8], usize)> {
    let rest = buf.get(pos..).unwrap_or_default();
    if !rest.starts_with(&FFFEFF) {
        return Err(Error::corrupted_at(base + pos, "missing FF FE FF string bracket"));
    }

    let len_pos = pos + FFFEFF.len();
    let len_byte = buf
        .get(len_pos)
        .ok_or_else(|| Error::corrupted_at(base + pos, "truncated FFFEFF string header"))?;
    let len = usize::from(*len_byte);
    let cursor = len_pos + 1;

    let end = cursor + len;
    if end > buf.len() {
        return Err(Error::corrupted_at(
            base + pos,
            format!("FFFEFF string of {} bytes overruns buffer", len),
        ));
    }

    if buf.get(end..end + FFFEFF_TERMINATOR.len()) != Some(&FFFEFF_TERMINATOR[..]) {
        return Err(Error::corrupted_at(base + end, "unterminated FFFEFF string"));
    }

    Ok((&buf[cursor..end], end + FFFEFF_TERMINATOR.len()))
}

fn utf8(bytes: &[u8], offset: usize) -> Result<String> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| Error::corrupted_at(offset + e.valid_up_to(), "invalid UTF-8 in string"))
}

fn utf16le(bytes: &[u8], offset: usize) -> Result<String> {
    let units: Vec<u16> = bytes.chunks_exact(2).map(LittleEndian::read_u16).collect();
    String::from_utf16(&units).map_err(|_| Error::corrupted_at(offset, "invalid UTF-16 in string"))
}
