//! Segment codec: a bundle object is a short header followed by a stream
//! of block records, compressed as a whole.
//!
//! # Layout
//! ```text
//! b"BNDL" | version u8 | codec u8 | <compressed record stream>
//! ```
//! The codec byte selects how the record stream is wrapped.  Records are
//! written by [`crate::block::write_record`]; the stream ends on a clean
//! record boundary.

use std::io::{self, BufReader, Read, Write};

use thiserror::Error;

use crate::block::{read_record, write_record, Block, RecordError};

pub const SEGMENT_MAGIC:   &[u8; 4] = b"BNDL";
pub const SEGMENT_VERSION: u8       = 1;
/// Default Zstd compression level.
pub const DEFAULT_COMPRESSION_LEVEL: i32 = 3;

// ── CodecId ──────────────────────────────────────────────────────────────────

/// How a segment's record stream is compressed.  The discriminant is the
/// value written to disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum CodecId {
    None = 0,
    #[default]
    Zstd = 1,
    Lz4  = 2,
}

impl CodecId {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(CodecId::None),
            1 => Some(CodecId::Zstd),
            2 => Some(CodecId::Lz4),
            _ => None,
        }
    }

    /// Human-readable name (for diagnostics only).
    pub fn name(self) -> &'static str {
        match self {
            CodecId::None => "none",
            CodecId::Zstd => "zstd",
            CodecId::Lz4  => "lz4",
        }
    }

    /// Parse from a CLI string.
    pub fn from_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" => Some(CodecId::None),
            "zstd" => Some(CodecId::Zstd),
            "lz4"  => Some(CodecId::Lz4),
            _      => None,
        }
    }
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid segment magic")]
    InvalidMagic,
    #[error("Unsupported segment version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown segment codec: {0}")]
    UnknownCodec(u8),
    #[error("Compression error: {0}")]
    Compression(String),
    #[error("Record error: {0}")]
    Record(#[from] RecordError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── Writer ───────────────────────────────────────────────────────────────────

enum Encoder<W: Write> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
    Lz4(lz4_flex::frame::FrameEncoder<W>),
}

/// Accepts blocks and writes them as one segment; call [`finish`] to
/// flush the compressor and recover the underlying writer.
///
/// [`finish`]: SegmentWriter::finish
pub struct SegmentWriter<W: Write> {
    encoder: Encoder<W>,
    blocks:  usize,
}

impl<W: Write> SegmentWriter<W> {
    pub fn new(writer: W) -> Result<Self, CodecError> {
        Self::with_codec(writer, CodecId::default(), DEFAULT_COMPRESSION_LEVEL)
    }

    pub fn with_codec(mut writer: W, codec: CodecId, level: i32) -> Result<Self, CodecError> {
        writer.write_all(SEGMENT_MAGIC)?;
        writer.write_all(&[SEGMENT_VERSION, codec as u8])?;
        let encoder = match codec {
            CodecId::None => Encoder::Plain(writer),
            CodecId::Zstd => Encoder::Zstd(zstd::stream::write::Encoder::new(writer, level)?),
            CodecId::Lz4  => Encoder::Lz4(lz4_flex::frame::FrameEncoder::new(writer)),
        };
        Ok(Self { encoder, blocks: 0 })
    }

    pub fn write(&mut self, block: &Block) -> Result<(), CodecError> {
        match &mut self.encoder {
            Encoder::Plain(w) => write_record(w, block)?,
            Encoder::Zstd(w)  => write_record(w, block)?,
            Encoder::Lz4(w)   => write_record(w, block)?,
        }
        self.blocks += 1;
        Ok(())
    }

    pub fn block_count(&self) -> usize {
        self.blocks
    }

    pub fn finish(self) -> Result<W, CodecError> {
        let mut inner = match self.encoder {
            Encoder::Plain(w) => w,
            Encoder::Zstd(w)  => w.finish()?,
            Encoder::Lz4(w)   => w.finish().map_err(|e| CodecError::Compression(e.to_string()))?,
        };
        inner.flush()?;
        Ok(inner)
    }
}

/// Serialize `blocks` into an in-memory segment.
pub fn encode_segment<'a, I>(blocks: I, codec: CodecId, level: i32) -> Result<Vec<u8>, CodecError>
where
    I: IntoIterator<Item = &'a Block>,
{
    let mut writer = SegmentWriter::with_codec(Vec::new(), codec, level)?;
    for block in blocks {
        writer.write(block)?;
    }
    writer.finish()
}

// ── Reader ───────────────────────────────────────────────────────────────────

/// Produces blocks from a segment until end-of-data or the first error.
pub struct SegmentReader<'r> {
    inner: Box<dyn Read + Send + 'r>,
    codec: CodecId,
    done:  bool,
}

impl<'r> SegmentReader<'r> {
    pub fn new<R: Read + Send + 'r>(mut reader: R) -> Result<Self, CodecError> {
        let mut header = [0u8; 6];
        reader.read_exact(&mut header)?;
        if &header[..4] != SEGMENT_MAGIC {
            return Err(CodecError::InvalidMagic);
        }
        if header[4] != SEGMENT_VERSION {
            return Err(CodecError::UnsupportedVersion(header[4]));
        }
        let codec = CodecId::from_byte(header[5]).ok_or(CodecError::UnknownCodec(header[5]))?;
        let inner: Box<dyn Read + Send + 'r> = match codec {
            CodecId::None => Box::new(BufReader::new(reader)),
            CodecId::Zstd => Box::new(zstd::stream::read::Decoder::new(reader)?),
            CodecId::Lz4  => Box::new(lz4_flex::frame::FrameDecoder::new(reader)),
        };
        Ok(Self { inner, codec, done: false })
    }

    pub fn codec(&self) -> CodecId {
        self.codec
    }

    /// Next block, `Ok(None)` at end of data.  After an error the reader
    /// yields nothing more.
    pub fn read(&mut self) -> Result<Option<Block>, CodecError> {
        if self.done {
            return Ok(None);
        }
        match read_record(&mut self.inner) {
            Ok(Some(block)) => Ok(Some(block)),
            Ok(None) => {
                self.done = true;
                Ok(None)
            }
            Err(e) => {
                self.done = true;
                Err(e.into())
            }
        }
    }
}

impl Iterator for SegmentReader<'_> {
    type Item = Result<Block, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

/// Decode an in-memory segment in full.
pub fn decode_segment(data: &[u8]) -> Result<Vec<Block>, CodecError> {
    SegmentReader::new(data)?.collect()
}
