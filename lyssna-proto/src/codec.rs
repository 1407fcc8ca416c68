//! Bit-exact frame codec.
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! u32 magic            0xDECAFBAD
//! u32 total_len        bytes remaining after this word
//! u32 seqno
//! u32 transaction_id   0 = unsolicited
//! u16 type_len         followed by type_len ASCII bytes
//! u32 num_kv
//!   num_kv * { u16 key_len, key, u32 value_len, value }
//! u32 checksum         CRC-32 over every preceding byte of the frame
//! ```
//!
//! Decoding is incremental: callers feed a growing buffer and get back
//! either a complete frame with its consumed length or the number of
//! additional bytes required. Leading garbage is recovered by scanning to
//! the next magic; decoding fails `BadMagic` only when no magic exists in
//! the buffer at all.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::frame::{Frame, KeyedValue, FRAME_MAGIC, MAX_BODY_LEN, MAX_KEY_LEN, MAX_TYPE_LEN};

/// Fixed bytes before the body: magic + total_len.
const HEADER_LEN: usize = 8;
/// seqno + transaction_id + type_len + num_kv + checksum.
const MIN_BODY_LEN: usize = 4 + 4 + 2 + 4 + 4;

/// Successful incremental decode outcome.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// At least `0` more bytes are required before a frame can complete.
    Need(usize),
    /// A whole frame, plus how many buffer bytes it consumed (including
    /// any garbage skipped before the magic).
    Frame { frame: Frame, consumed: usize },
}

/// Unrecoverable decode failures. Any of these closes the endpoint.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("no frame magic found in stream")]
    BadMagic,
    #[error("frame truncated against its declared lengths")]
    Short,
    #[error("frame checksum mismatch")]
    BadChecksum,
    #[error("frame type of {0} bytes exceeds cap")]
    TypeTooLong(usize),
    #[error("keyed value exceeds frame bounds")]
    KvTooLong,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("frame type of {0} bytes exceeds cap")]
    TypeTooLong(usize),
    #[error("key '{0}' exceeds key cap")]
    KeyTooLong(String),
    #[error("encoded body of {0} bytes exceeds cap")]
    BodyTooLong(usize),
}

/// Serializes a frame. The output re-decodes to an equal frame.
pub fn encode(frame: &Frame) -> Result<Bytes, EncodeError> {
    let type_bytes = frame.frame_type.as_bytes();
    if type_bytes.len() > MAX_TYPE_LEN || !frame.frame_type.is_ascii() {
        return Err(EncodeError::TypeTooLong(type_bytes.len()));
    }

    let mut body_len = MIN_BODY_LEN + type_bytes.len();
    for kv in &frame.kvs {
        if kv.key.len() > MAX_KEY_LEN || !kv.key.is_ascii() {
            return Err(EncodeError::KeyTooLong(kv.key.clone()));
        }
        body_len += 2 + kv.key.len() + 4 + kv.value.len();
    }
    if body_len > MAX_BODY_LEN {
        return Err(EncodeError::BodyTooLong(body_len));
    }

    let mut buf = BytesMut::with_capacity(HEADER_LEN + body_len);
    buf.put_u32(FRAME_MAGIC);
    buf.put_u32(body_len as u32);
    buf.put_u32(frame.seqno);
    buf.put_u32(frame.transaction_id);
    buf.put_u16(type_bytes.len() as u16);
    buf.put_slice(type_bytes);
    buf.put_u32(frame.kvs.len() as u32);
    for kv in &frame.kvs {
        buf.put_u16(kv.key.len() as u16);
        buf.put_slice(kv.key.as_bytes());
        buf.put_u32(kv.value.len() as u32);
        buf.put_slice(&kv.value);
    }
    let checksum = crc32fast::hash(&buf);
    buf.put_u32(checksum);

    Ok(buf.freeze())
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode(buf: &[u8]) -> Result<Decoded, DecodeError> {
    // Locate the magic, skipping any garbage in front of it.
    let start = match find_magic(buf) {
        FindMagic::At(offset) => offset,
        FindMagic::Partial => return Ok(Decoded::Need(1)),
        FindMagic::Absent => {
            if buf.len() < 4 {
                return Ok(Decoded::Need(4 - buf.len()));
            }
            return Err(DecodeError::BadMagic);
        }
    };
    if start > 0 {
        tracing::warn!(skipped = start, "resynced to frame magic");
    }

    let avail = &buf[start..];
    if avail.len() < HEADER_LEN {
        return Ok(Decoded::Need(HEADER_LEN - avail.len()));
    }

    let body_len = read_u32(avail, 4) as usize;
    if body_len < MIN_BODY_LEN || body_len > MAX_BODY_LEN {
        return Err(DecodeError::KvTooLong);
    }
    if avail.len() < HEADER_LEN + body_len {
        return Ok(Decoded::Need(HEADER_LEN + body_len - avail.len()));
    }

    let whole = &avail[..HEADER_LEN + body_len];
    let claimed = read_u32(whole, whole.len() - 4);
    let actual = crc32fast::hash(&whole[..whole.len() - 4]);
    if claimed != actual {
        return Err(DecodeError::BadChecksum);
    }

    let seqno = read_u32(whole, 8);
    let transaction_id = read_u32(whole, 12);

    // Cursor over the body, bounded by the checksum trailer.
    let end = whole.len() - 4;
    let mut pos = 16usize;

    let type_len = read_u16_checked(whole, &mut pos, end)? as usize;
    if type_len > MAX_TYPE_LEN {
        return Err(DecodeError::TypeTooLong(type_len));
    }
    let type_raw = read_slice_checked(whole, &mut pos, end, type_len)?;
    if !type_raw.is_ascii() {
        return Err(DecodeError::TypeTooLong(type_len));
    }
    let frame_type = std::str::from_utf8(type_raw)
        .map_err(|_| DecodeError::TypeTooLong(type_len))?
        .to_string();

    let num_kv = read_u32_checked(whole, &mut pos, end)?;
    let mut kvs = Vec::new();
    for _ in 0..num_kv {
        let key_len = read_u16_checked(whole, &mut pos, end)? as usize;
        if key_len > MAX_KEY_LEN {
            return Err(DecodeError::KvTooLong);
        }
        let key_raw = read_slice_checked(whole, &mut pos, end, key_len)?;
        let key = std::str::from_utf8(key_raw)
            .map_err(|_| DecodeError::KvTooLong)?
            .to_string();
        let value_len = read_u32_checked(whole, &mut pos, end)? as usize;
        let value = read_slice_checked(whole, &mut pos, end, value_len)?;
        kvs.push(KeyedValue::new(key, Bytes::copy_from_slice(value)));
    }
    if pos != end {
        // Slack between the last keyed value and the checksum.
        return Err(DecodeError::Short);
    }

    Ok(Decoded::Frame {
        frame: Frame {
            frame_type,
            seqno,
            transaction_id,
            kvs,
        },
        consumed: start + HEADER_LEN + body_len,
    })
}

enum FindMagic {
    At(usize),
    /// The buffer tail could be the first bytes of a magic.
    Partial,
    Absent,
}

fn find_magic(buf: &[u8]) -> FindMagic {
    let magic = FRAME_MAGIC.to_be_bytes();
    if buf.len() >= 4 && buf[..4] == magic {
        return FindMagic::At(0);
    }
    for offset in 1..buf.len() {
        let rest = &buf[offset..];
        if rest.len() >= 4 {
            if rest[..4] == magic {
                return FindMagic::At(offset);
            }
        } else if magic.starts_with(rest) {
            return FindMagic::Partial;
        }
    }
    FindMagic::Absent
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_be_bytes(buf[at..at + 4].try_into().unwrap())
}

fn read_u16_checked(buf: &[u8], pos: &mut usize, end: usize) -> Result<u16, DecodeError> {
    let raw = read_slice_checked(buf, pos, end, 2)?;
    Ok(u16::from_be_bytes(raw.try_into().unwrap()))
}

fn read_u32_checked(buf: &[u8], pos: &mut usize, end: usize) -> Result<u32, DecodeError> {
    let raw = read_slice_checked(buf, pos, end, 4)?;
    Ok(u32::from_be_bytes(raw.try_into().unwrap()))
}

fn read_slice_checked<'a>(
    buf: &'a [u8],
    pos: &mut usize,
    end: usize,
    len: usize,
) -> Result<&'a [u8], DecodeError> {
    if end - *pos < len {
        return Err(DecodeError::Short);
    }
    let s = &buf[*pos..*pos + len];
    *pos += len;
    Ok(s)
}
