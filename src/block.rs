//! Block model and its binary record encoding.
//!
//! A record is `magic u32 | body_len u32 | crc32 u32 | body`, all
//! little-endian.  The body carries the block's identity, parent linkage,
//! timestamp, optional filter metadata and the opaque chain payload.

use std::fmt;
use std::io::{self, Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use crc32fast::Hasher;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const RECORD_MAGIC: u32 = 0x424C_4B31; // "BLK1"
/// Upper bound on a record body; anything larger is treated as corruption.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("invalid record magic {0:#010x}")]
    InvalidMagic(u32),
    #[error("record checksum mismatch (expected {expected:#010x}, got {actual:#010x})")]
    ChecksumMismatch { expected: u32, actual: u32 },
    #[error("record body of {0} bytes exceeds the size limit")]
    Oversized(u64),
    #[error("truncated record")]
    Truncated,
    #[error("invalid UTF-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("invalid block timestamp {0}ms")]
    InvalidTimestamp(i64),
    #[error("field {0} is too long to encode")]
    FieldTooLong(&'static str),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Model ─────────────────────────────────────────────────────────────────────

/// Identity of a block: its hash-like id and its height.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockRef {
    pub id:     String,
    pub number: u64,
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

/// Filter expressions a block was produced under, if any.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockFilters {
    pub include: String,
    pub exclude: String,
    pub system:  String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub number:        u64,
    pub id:            String,
    pub parent_id:     String,
    pub parent_number: u64,
    /// Last irreversible block number as known by the block's producer.
    pub lib_num:       u64,
    pub timestamp:     DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters:       Option<BlockFilters>,
    #[serde(with = "hex_payload")]
    pub payload:       Bytes,
}

impl Block {
    pub fn to_ref(&self) -> BlockRef {
        BlockRef { id: self.id.clone(), number: self.number }
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{} ({})", self.number, self.id)
    }
}

mod hex_payload {
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(payload: &Bytes, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(payload))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Bytes, D::Error> {
        let raw = String::deserialize(d)?;
        hex::decode(raw).map(Bytes::from).map_err(serde::de::Error::custom)
    }
}

// ── Record encoding ───────────────────────────────────────────────────────────

pub fn write_record<W: Write>(mut writer: W, block: &Block) -> Result<(), RecordError> {
    let body = encode_body(block)?;
    let body_len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_RECORD_SIZE)
        .ok_or(RecordError::Oversized(body.len() as u64))?;
    let mut hasher = Hasher::new();
    hasher.update(&body);

    writer.write_u32::<LittleEndian>(RECORD_MAGIC)?;
    writer.write_u32::<LittleEndian>(body_len)?;
    writer.write_u32::<LittleEndian>(hasher.finalize())?;
    writer.write_all(&body)?;
    Ok(())
}

/// Read the next record.  `Ok(None)` means the stream ended cleanly on a
/// record boundary.
pub fn read_record<R: Read>(mut reader: R) -> Result<Option<Block>, RecordError> {
    let mut magic_buf = [0u8; 4];
    let mut filled = 0;
    while filled < magic_buf.len() {
        match reader.read(&mut magic_buf[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => return Err(RecordError::Truncated),
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    let magic = u32::from_le_bytes(magic_buf);
    if magic != RECORD_MAGIC {
        return Err(RecordError::InvalidMagic(magic));
    }

    let body_len = reader.read_u32::<LittleEndian>().map_err(truncated)?;
    if body_len > MAX_RECORD_SIZE {
        return Err(RecordError::Oversized(u64::from(body_len)));
    }
    let expected = reader.read_u32::<LittleEndian>().map_err(truncated)?;
    let mut body = vec![0u8; body_len as usize];
    reader.read_exact(&mut body).map_err(truncated)?;

    let mut hasher = Hasher::new();
    hasher.update(&body);
    let actual = hasher.finalize();
    if actual != expected {
        return Err(RecordError::ChecksumMismatch { expected, actual });
    }
    decode_body(&body).map(Some)
}

/// Encode a single block as a standalone record buffer.
pub fn encode_block(block: &Block) -> Result<Vec<u8>, RecordError> {
    let mut out = Vec::new();
    write_record(&mut out, block)?;
    Ok(out)
}

/// Decode a buffer holding exactly one record.
pub fn decode_block(data: &[u8]) -> Result<Block, RecordError> {
    read_record(Cursor::new(data))?.ok_or(RecordError::Truncated)
}

fn encode_body(block: &Block) -> Result<Vec<u8>, RecordError> {
    let mut body = Vec::with_capacity(64 + block.payload.len());
    body.write_u64::<LittleEndian>(block.number)?;
    body.write_u64::<LittleEndian>(block.parent_number)?;
    body.write_u64::<LittleEndian>(block.lib_num)?;
    body.write_i64::<LittleEndian>(block.timestamp.timestamp_millis())?;
    write_str(&mut body, &block.id, "id")?;
    write_str(&mut body, &block.parent_id, "parent_id")?;
    match &block.filters {
        Some(f) => {
            body.write_u8(1)?;
            write_str(&mut body, &f.include, "filters.include")?;
            write_str(&mut body, &f.exclude, "filters.exclude")?;
            write_str(&mut body, &f.system, "filters.system")?;
        }
        None => body.write_u8(0)?,
    }
    let payload_len = u32::try_from(block.payload.len())
        .map_err(|_| RecordError::FieldTooLong("payload"))?;
    body.write_u32::<LittleEndian>(payload_len)?;
    body.write_all(&block.payload)?;
    Ok(body)
}

fn decode_body(body: &[u8]) -> Result<Block, RecordError> {
    let mut r = Cursor::new(body);
    let number        = r.read_u64::<LittleEndian>().map_err(truncated)?;
    let parent_number = r.read_u64::<LittleEndian>().map_err(truncated)?;
    let lib_num       = r.read_u64::<LittleEndian>().map_err(truncated)?;
    let millis        = r.read_i64::<LittleEndian>().map_err(truncated)?;
    let timestamp = DateTime::<Utc>::from_timestamp_millis(millis)
        .ok_or(RecordError::InvalidTimestamp(millis))?;
    let id        = read_str(&mut r, "id")?;
    let parent_id = read_str(&mut r, "parent_id")?;
    let filters = match r.read_u8().map_err(truncated)? {
        0 => None,
        _ => Some(BlockFilters {
            include: read_str(&mut r, "filters.include")?,
            exclude: read_str(&mut r, "filters.exclude")?,
            system:  read_str(&mut r, "filters.system")?,
        }),
    };
    let payload_len = r.read_u32::<LittleEndian>().map_err(truncated)? as usize;
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload).map_err(truncated)?;

    Ok(Block {
        number,
        id,
        parent_id,
        parent_number,
        lib_num,
        timestamp,
        filters,
        payload: Bytes::from(payload),
    })
}

fn write_str(out: &mut Vec<u8>, s: &str, field: &'static str) -> Result<(), RecordError> {
    let len = u16::try_from(s.len()).map_err(|_| RecordError::FieldTooLong(field))?;
    out.write_u16::<LittleEndian>(len)?;
    out.write_all(s.as_bytes())?;
    Ok(())
}

fn read_str(r: &mut Cursor<&[u8]>, field: &'static str) -> Result<String, RecordError> {
    let len = r.read_u16::<LittleEndian>().map_err(truncated)? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf).map_err(truncated)?;
    String::from_utf8(buf).map_err(|_| RecordError::InvalidUtf8(field))
}

fn truncated(e: io::Error) -> RecordError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        RecordError::Truncated
    } else {
        RecordError::Io(e)
    }
}
