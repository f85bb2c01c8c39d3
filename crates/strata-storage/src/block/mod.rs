//! Block Storage Format
//!
//! This module implements the binary file format of a Strata block. The same bytes
//! are written to the local data directory when a block is sealed and uploaded
//! unchanged to the object archive.
//!
//! ## Block File Structure
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ Header (48 bytes)                                           │
//! │ - Magic bytes: "STBK" (4 bytes)                             │
//! │ - Version: 1 (2 bytes)                                      │
//! │ - Compression: None/Lz4 (2 bytes)                           │
//! │ - Resolution: raw/5m/1h (2 bytes)                           │
//! │ - Reserved (2 bytes)                                        │
//! │ - Min time, max time (8 + 8 bytes)                          │
//! │ - Series count, sample count (4 + 4 bytes)                  │
//! │ - Reserved (12 bytes)                                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Chunk for series 1 (optionally LZ4 compressed)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Chunk for series 2                                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │ ...                                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Index                                                       │
//! │ - Entry count (4 bytes)                                     │
//! │ - For each series, sorted by key:                           │
//! │   * Series key (varint-length labels)                       │
//! │   * Chunk offset (8 bytes), chunk length (4 bytes)          │
//! │   * Min time, max time (8 + 8 bytes)                        │
//! │   * Point count (4 bytes), chunk CRC32 (4 bytes)            │
//! ├─────────────────────────────────────────────────────────────┤
//! │ Footer (32 bytes)                                           │
//! │ - Index offset (8 bytes), index length (4 bytes)            │
//! │ - Index CRC32 (4 bytes)                                     │
//! │ - Version, compression, resolution (2 + 2 + 2 bytes)        │
//! │ - Reserved (6 bytes)                                        │
//! │ - Magic bytes: "STBK" again (4 bytes)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Chunk Format (Uncompressed)
//!
//! ```text
//! Raw point:     timestamp delta (zigzag varint), value (f64)
//! Summary point: timestamp delta (zigzag varint), min, max, sum (f64),
//!                count (varint), last (f64)
//! ```
//!
//! The first delta is relative to the entry's `min_time`, later ones to the
//! previous point.
//!
//! ## Ranged Reads
//!
//! Footer and index are enough to locate any series, so a remote reader fetches
//! the last 32 bytes, then the index, then only the chunks it needs. Every chunk
//! and the index carry their own CRC32, so a damaged region is detected without
//! downloading the rest of the block.

mod reader;
mod writer;

pub use reader::{decode_chunk, BlockReader};
pub use writer::{BlockWriter, EncodedBlock};

use bytes::{Buf, BufMut, BytesMut};
use strata_core::{Compression, Error, Resolution, Result, SeriesKey, SeriesMatcher};

/// Magic bytes for block files: "STBK"
pub const BLOCK_MAGIC: [u8; 4] = [0x53, 0x54, 0x42, 0x4B];

/// Version number for the block format
pub const BLOCK_VERSION: u16 = 1;

/// Block header size (48 bytes)
pub const HEADER_SIZE: usize = 48;

/// Block footer size (32 bytes)
pub const FOOTER_SIZE: usize = 32;

/// Fixed part of an index entry after the series key
const INDEX_ENTRY_FIXED: usize = 8 + 4 + 8 + 8 + 4 + 4;

/// Location and summary of one series chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub key: SeriesKey,
    pub offset: u64,
    pub len: u32,
    pub min_time: i64,
    pub max_time: i64,
    pub count: u32,
    pub crc: u32,
}

impl IndexEntry {
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min_time <= end && self.max_time >= start
    }

    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.offset as usize + self.len as usize
    }
}

/// Parsed block header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u16,
    pub compression: Compression,
    pub resolution: Resolution,
    pub min_time: i64,
    pub max_time: i64,
    pub series_count: u32,
    pub sample_count: u32,
}

impl BlockHeader {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&BLOCK_MAGIC);
        buf.put_u16(self.version);
        buf.put_u16(self.compression as u16);
        buf.put_u16(self.resolution as u16);
        buf.put_u16(0);
        buf.put_i64(self.min_time);
        buf.put_i64(self.max_time);
        buf.put_u32(self.series_count);
        buf.put_u32(self.sample_count);
        buf.put_bytes(0, 12);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(Error::InvalidBlock("header truncated".to_string()));
        }
        let mut cursor = &data[..HEADER_SIZE];

        let mut magic = [0u8; 4];
        cursor.copy_to_slice(&mut magic);
        if magic != BLOCK_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let version = cursor.get_u16();
        if version != BLOCK_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let compression = Compression::try_from(cursor.get_u16())?;
        let resolution = Resolution::try_from(cursor.get_u16())?;
        cursor.advance(2);

        Ok(Self {
            version,
            compression,
            resolution,
            min_time: cursor.get_i64(),
            max_time: cursor.get_i64(),
            series_count: cursor.get_u32(),
            sample_count: cursor.get_u32(),
        })
    }
}

/// Parsed block footer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub index_offset: u64,
    pub index_len: u32,
    pub index_crc: u32,
    pub version: u16,
    pub compression: Compression,
    pub resolution: Resolution,
}

impl Footer {
    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        buf.put_u64(self.index_offset);
        buf.put_u32(self.index_len);
        buf.put_u32(self.index_crc);
        buf.put_u16(self.version);
        buf.put_u16(self.compression as u16);
        buf.put_u16(self.resolution as u16);
        buf.put_bytes(0, 6);
        buf.put_slice(&BLOCK_MAGIC);
    }

    /// Decode the last `FOOTER_SIZE` bytes of a block
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() != FOOTER_SIZE {
            return Err(Error::InvalidBlock(format!(
                "footer must be {} bytes, got {}",
                FOOTER_SIZE,
                data.len()
            )));
        }
        if data[FOOTER_SIZE - 4..] != BLOCK_MAGIC {
            return Err(Error::InvalidMagic);
        }

        let mut cursor = data;
        let index_offset = cursor.get_u64();
        let index_len = cursor.get_u32();
        let index_crc = cursor.get_u32();
        let version = cursor.get_u16();
        if version != BLOCK_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        Ok(Self {
            index_offset,
            index_len,
            index_crc,
            version,
            compression: Compression::try_from(cursor.get_u16())?,
            resolution: Resolution::try_from(cursor.get_u16())?,
        })
    }

    pub fn index_range(&self) -> std::ops::Range<usize> {
        self.index_offset as usize..self.index_offset as usize + self.index_len as usize
    }
}

/// Decoded block index with the footer it was located through
#[derive(Debug, Clone)]
pub struct BlockIndex {
    pub footer: Footer,
    pub entries: Vec<IndexEntry>,
}

impl BlockIndex {
    pub(crate) fn encode_entries(entries: &[IndexEntry], buf: &mut BytesMut) {
        buf.put_u32(entries.len() as u32);
        for entry in entries {
            entry.key.encode(buf);
            buf.put_u64(entry.offset);
            buf.put_u32(entry.len);
            buf.put_i64(entry.min_time);
            buf.put_i64(entry.max_time);
            buf.put_u32(entry.count);
            buf.put_u32(entry.crc);
        }
    }

    /// Decode the index region and verify it against the footer checksum
    pub fn decode(footer: Footer, data: &[u8]) -> Result<Self> {
        if data.len() != footer.index_len as usize {
            return Err(Error::InvalidBlock("index length mismatch".to_string()));
        }
        if crc32fast::hash(data) != footer.index_crc {
            return Err(Error::CrcMismatch("block index".to_string()));
        }

        let mut cursor = data;
        if cursor.remaining() < 4 {
            return Err(Error::InvalidBlock("index truncated".to_string()));
        }
        let count = cursor.get_u32() as usize;
        let mut entries = Vec::with_capacity(count.min(4096));
        for _ in 0..count {
            let key = SeriesKey::decode(&mut cursor)?;
            if cursor.remaining() < INDEX_ENTRY_FIXED {
                return Err(Error::InvalidBlock("index entry truncated".to_string()));
            }
            entries.push(IndexEntry {
                key,
                offset: cursor.get_u64(),
                len: cursor.get_u32(),
                min_time: cursor.get_i64(),
                max_time: cursor.get_i64(),
                count: cursor.get_u32(),
                crc: cursor.get_u32(),
            });
        }
        if cursor.has_remaining() {
            return Err(Error::InvalidBlock("trailing bytes after index".to_string()));
        }

        Ok(Self { footer, entries })
    }

    /// Entries whose series matches and whose time range overlaps `[start, end]`
    pub fn select<'a>(
        &'a self,
        matcher: &'a SeriesMatcher,
        start: i64,
        end: i64,
    ) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.entries
            .iter()
            .filter(move |e| e.overlaps(start, end) && matcher.matches(&e.key))
    }

    /// Approximate heap footprint, used to weigh cache entries
    pub fn approximate_size(&self) -> usize {
        self.entries
            .iter()
            .map(|e| e.key.encoded_len() + INDEX_ENTRY_FIXED)
            .sum()
    }
}
