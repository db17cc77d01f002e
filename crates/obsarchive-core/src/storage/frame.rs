//! Frame codec for the container file.
//!
//! A container is the 8-byte magic followed by a sequence of frames:
//!
//! ```text
//! frame  := kind:u8 | len:u32 LE | crc32:u32 LE | payload[len]
//! crc32  := CRC-32 over kind byte + payload
//!
//! kind 1 (catalog) := JSON-encoded CatalogAction
//! kind 2 (row)     := group_id:u32 LE | time:i64 LE | cells
//! kind 3 (aux)     := group_id:u32 LE | name_len:u16 LE | name | values
//! ```
//!
//! `cells` and aux `values` are little-endian `f32` runs after the group's
//! compression codec. The row prefix (group id and time) is never compressed
//! so the directory can be rebuilt by reading 21 bytes per row.

use bytes::{Buf, BufMut, BytesMut};
use crc32fast::Hasher as Crc32;
use snafu::prelude::*;

/// File signature, also carries the major layout version.
pub(crate) const MAGIC: &[u8; 8] = b"OBSARCH1";

/// Bytes before the payload: kind + len + crc.
pub(crate) const HEADER_LEN: usize = 9;

/// Uncompressed prefix of a row payload: group id + time.
pub(crate) const ROW_PREFIX_LEN: usize = 12;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum FrameKind {
    Catalog = 1,
    Row = 2,
    Aux = 3,
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(FrameKind::Catalog),
            2 => Ok(FrameKind::Row),
            3 => Ok(FrameKind::Aux),
            other => Err(other),
        }
    }
}

/// Location of a frame inside the container file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameRef {
    /// Offset of the frame header.
    pub offset: u64,
    /// Payload length.
    pub len: u32,
}

impl FrameRef {
    /// Offset of the first payload byte.
    pub(crate) fn payload_offset(&self) -> u64 {
        self.offset + HEADER_LEN as u64
    }

    /// Offset one past the last payload byte.
    pub(crate) fn end(&self) -> u64 {
        self.payload_offset() + u64::from(self.len)
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub kind: u8,
    pub len: u32,
    pub crc: u32,
}

impl FrameHeader {
    pub(crate) fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_LEN {
            return None;
        }
        Some(FrameHeader {
            kind: buf.get_u8(),
            len: buf.get_u32_le(),
            crc: buf.get_u32_le(),
        })
    }
}

pub(crate) fn checksum(kind: u8, payload: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(&[kind]);
    h.update(payload);
    h.finalize()
}

/// Header + payload, ready to append.
pub(crate) fn encode_frame(kind: FrameKind, payload: &[u8]) -> Vec<u8> {
    let kind = kind as u8;
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(kind);
    buf.put_u32_le(payload.len() as u32);
    buf.put_u32_le(checksum(kind, payload));
    buf.put_slice(payload);
    buf.to_vec()
}

/// Why a buffered frame could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
pub(crate) enum FrameDecodeError {
    #[snafu(display("frame is truncated"))]
    Truncated,

    #[snafu(display("expected {expected:?} frame, found kind {found}"))]
    UnexpectedKind { expected: FrameKind, found: u8 },

    #[snafu(display("frame checksum mismatch"))]
    Checksum,
}

/// Verify a whole frame held in memory and borrow its payload.
pub(crate) fn open_frame(buf: &[u8], expected: FrameKind) -> Result<&[u8], FrameDecodeError> {
    let header = FrameHeader::decode(buf).context(TruncatedSnafu)?;
    ensure!(
        header.kind == expected as u8,
        UnexpectedKindSnafu {
            expected,
            found: header.kind,
        }
    );
    let payload = buf
        .get(HEADER_LEN..HEADER_LEN + header.len as usize)
        .context(TruncatedSnafu)?;
    ensure!(checksum(header.kind, payload) == header.crc, ChecksumSnafu);
    Ok(payload)
}

pub(crate) fn encode_row_payload(group_id: u32, time: i64, cells: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(ROW_PREFIX_LEN + cells.len());
    buf.put_u32_le(group_id);
    buf.put_i64_le(time);
    buf.put_slice(cells);
    buf.to_vec()
}

/// Split a row payload into `(group_id, time, cells)`.
pub(crate) fn decode_row_payload(payload: &[u8]) -> Option<(u32, i64, &[u8])> {
    if payload.len() < ROW_PREFIX_LEN {
        return None;
    }
    let (mut prefix, cells) = payload.split_at(ROW_PREFIX_LEN);
    Some((prefix.get_u32_le(), prefix.get_i64_le(), cells))
}

pub(crate) fn encode_aux_payload(group_id: u32, name: &str, values: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(6 + name.len() + values.len());
    buf.put_u32_le(group_id);
    buf.put_u16_le(name.len() as u16);
    buf.put_slice(name.as_bytes());
    buf.put_slice(values);
    buf.to_vec()
}

/// Split an aux payload into `(group_id, name, values)`.
pub(crate) fn decode_aux_payload(payload: &[u8]) -> Option<(u32, String, &[u8])> {
    let mut cursor = payload;
    if cursor.remaining() < 6 {
        return None;
    }
    let group_id = cursor.get_u32_le();
    let name_len = cursor.get_u16_le() as usize;
    if cursor.remaining() < name_len {
        return None;
    }
    let (name, values) = cursor.split_at(name_len);
    let name = String::from_utf8(name.to_vec()).ok()?;
    Some((group_id, name, values))
}
