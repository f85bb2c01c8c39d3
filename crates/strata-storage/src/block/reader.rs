//! Block Reader - Validating and Decoding Block Files
//!
//! `BlockReader` opens a complete block held in memory (a local block file, or a
//! block fetched whole from the archive). Remote reads that only fetch some
//! chunks use [`Footer`], [`BlockIndex`] and [`decode_chunk`] directly.
//!
//! ## Validation
//! 1. File is at least header + footer
//! 2. Magic bytes at start and end ("STBK"), supported version
//! 3. Footer agrees with the header on compression and resolution
//! 4. Index lies between the chunks and the footer, and its CRC32 matches
//! 5. Every index entry points inside the chunk region
//!
//! Chunks are verified lazily: each chunk's CRC32 is checked when it is decoded.
//! [`BlockReader::verify`] decodes all of them up front.
//!
//! ## Error Handling
//! - `InvalidMagic`: File doesn't start/end with "STBK"
//! - `UnsupportedVersion`: Block written by a newer format version
//! - `CrcMismatch`: Index or chunk corruption
//! - `InvalidBlock`: Malformed data (truncated, bad varints, out of range offsets)
//! - `Decompression`: LZ4 decompression failed

use bytes::{Buf, Bytes};
use strata_core::{
    varint, Aggregate, Compression, Error, Point, Resolution, Result, SeriesMatcher, SeriesPoints,
};

use super::{BlockHeader, BlockIndex, Footer, IndexEntry, FOOTER_SIZE, HEADER_SIZE};

/// Reads series from an in-memory block file
#[derive(Debug, Clone)]
pub struct BlockReader {
    data: Bytes,
    header: BlockHeader,
    index: BlockIndex,
}

impl BlockReader {
    /// Open a block file for reading
    pub fn new(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(Error::InvalidBlock("block too small".to_string()));
        }

        let header = BlockHeader::decode(&data)?;

        let footer_start = data.len() - FOOTER_SIZE;
        let footer = Footer::decode(&data[footer_start..])?;
        if footer.compression != header.compression || footer.resolution != header.resolution {
            return Err(Error::InvalidBlock("header and footer disagree".to_string()));
        }

        let index_range = footer.index_range();
        if index_range.start < HEADER_SIZE || index_range.end != footer_start {
            return Err(Error::InvalidBlock("index out of bounds".to_string()));
        }
        let index = BlockIndex::decode(footer, &data[index_range.clone()])?;

        for entry in &index.entries {
            let range = entry.range();
            if range.start < HEADER_SIZE || range.end > index_range.start {
                return Err(Error::InvalidBlock(format!(
                    "chunk of {} out of bounds",
                    entry.key
                )));
            }
        }

        Ok(Self {
            data,
            header,
            index,
        })
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn resolution(&self) -> Resolution {
        self.header.resolution
    }

    /// The complete block file
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Decode all points of one indexed series
    pub fn read_series(&self, entry: &IndexEntry) -> Result<Vec<Point>> {
        decode_chunk(
            entry,
            self.header.compression,
            self.header.resolution,
            &self.data[entry.range()],
        )
    }

    /// Points of matching series inside the inclusive range `[start, end]`
    pub fn query(&self, matcher: &SeriesMatcher, start: i64, end: i64) -> Result<Vec<SeriesPoints>> {
        let mut out = Vec::new();
        for entry in self.index.select(matcher, start, end) {
            let points: Vec<Point> = self
                .read_series(entry)?
                .into_iter()
                .filter(|p| p.timestamp >= start && p.timestamp <= end)
                .collect();
            if !points.is_empty() {
                out.push(SeriesPoints::new(entry.key.clone(), points));
            }
        }
        Ok(out)
    }

    /// Every series in the block, in key order
    pub fn read_all(&self) -> Result<Vec<SeriesPoints>> {
        self.index
            .entries
            .iter()
            .map(|entry| Ok(SeriesPoints::new(entry.key.clone(), self.read_series(entry)?)))
            .collect()
    }

    /// Decode every chunk, surfacing the first corruption
    pub fn verify(&self) -> Result<()> {
        for entry in &self.index.entries {
            self.read_series(entry)?;
        }
        Ok(())
    }
}

/// Decode one stored chunk located by `entry`
pub fn decode_chunk(
    entry: &IndexEntry,
    compression: Compression,
    resolution: Resolution,
    stored: &[u8],
) -> Result<Vec<Point>> {
    if stored.len() != entry.len as usize {
        return Err(Error::InvalidBlock(format!(
            "chunk of {} has {} bytes, index says {}",
            entry.key,
            stored.len(),
            entry.len
        )));
    }
    if crc32fast::hash(stored) != entry.crc {
        return Err(Error::CrcMismatch(format!("chunk of {}", entry.key)));
    }

    let payload = match compression {
        Compression::None => Bytes::copy_from_slice(stored),
        Compression::Lz4 => Bytes::from(
            lz4_flex::decompress_size_prepended(stored)
                .map_err(|e| Error::Decompression(e.to_string()))?,
        ),
    };

    let mut cursor = payload.as_ref();
    let mut points = Vec::with_capacity(entry.count as usize);
    let mut timestamp = entry.min_time;

    for _ in 0..entry.count {
        timestamp = timestamp
            .checked_add(varint::decode_varint(&mut cursor)?)
            .ok_or_else(|| Error::InvalidBlock("timestamp overflow".to_string()))?;
        let point = if resolution.is_raw() {
            Point::raw(timestamp, read_f64(&mut cursor)?)
        } else {
            let min = read_f64(&mut cursor)?;
            let max = read_f64(&mut cursor)?;
            let sum = read_f64(&mut cursor)?;
            let count = varint::decode_varint_u64(&mut cursor)?;
            let last = read_f64(&mut cursor)?;
            Point::summary(
                timestamp,
                Aggregate {
                    min,
                    max,
                    sum,
                    count,
                    last,
                },
            )
        };
        points.push(point);
    }

    if cursor.has_remaining() {
        return Err(Error::InvalidBlock(format!(
            "trailing bytes in chunk of {}",
            entry.key
        )));
    }
    if points.first().map(|p| p.timestamp) != Some(entry.min_time)
        || points.last().map(|p| p.timestamp) != Some(entry.max_time)
    {
        return Err(Error::InvalidBlock(format!(
            "chunk of {} disagrees with its index entry",
            entry.key
        )));
    }

    Ok(points)
}

fn read_f64(cursor: &mut &[u8]) -> Result<f64> {
    if cursor.remaining() < 8 {
        return Err(Error::InvalidBlock("unexpected end of chunk".to_string()));
    }
    Ok(cursor.get_f64())
}
