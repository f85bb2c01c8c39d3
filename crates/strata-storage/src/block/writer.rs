//! Block Writer - Encoding Series into an Immutable Block File
//!
//! `BlockWriter` collects the points of many series over one time range and
//! encodes them into the block format described in [`crate::block`].
//!
//! ## What Does BlockWriter Do?
//!
//! 1. **Validates points** per series: strictly increasing timestamps inside
//!    `[min_time, max_time)`, point kind matching the block resolution
//! 2. **Orders series** by their canonical key
//! 3. **Delta-encodes** timestamps with zigzag varints
//! 4. **Compresses each chunk** with LZ4 (or not at all)
//! 5. **Builds the index** with per-chunk CRC32 for ranged reads
//! 6. **Derives the external id** from the block content
//!
//! ## External Id
//!
//! The id is a SHA-256 over resolution, time range and, for every series, its
//! canonical key, point count and the CRC32 of the uncompressed chunk payload.
//! Encoding the same data twice yields the same id, which is what makes shipping
//! and compaction idempotent: a retry writes to the same archive key.
//!
//! ## Example Usage
//!
//! ```ignore
//! let mut writer = BlockWriter::new(Resolution::Raw, Compression::Lz4, 0, 100_000);
//! writer.add_series(key, vec![Point::raw(0, 1.0), Point::raw(60_000, 2.0)])?;
//! let block = writer.finish()?;
//! archive.put(&path, block.data.clone()).await?;
//! ```
//!
//! ## Thread Safety
//!
//! BlockWriter is NOT thread-safe. The sealer builds one writer per sealed block
//! outside the Block Store locks.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};
use strata_core::{
    now_ms, varint, BlockMeta, Compression, Error, Point, PointValue, Resolution, Result,
    SeriesKey,
};

use super::{BlockHeader, BlockIndex, Footer, IndexEntry, BLOCK_VERSION, HEADER_SIZE};

/// A fully encoded block ready to be stored locally or uploaded
#[derive(Debug, Clone)]
pub struct EncodedBlock {
    pub meta: BlockMeta,
    pub data: Bytes,
}

/// Builds a block file from per-series points
pub struct BlockWriter {
    resolution: Resolution,
    compression: Compression,
    min_time: i64,
    max_time: i64,
    series: BTreeMap<SeriesKey, Vec<Point>>,
    created_at_ms: i64,
    level: u32,
    sources: Vec<String>,
    output_count: u32,
}

impl BlockWriter {
    /// Create a writer for points in `[min_time, max_time)`
    pub fn new(resolution: Resolution, compression: Compression, min_time: i64, max_time: i64) -> Self {
        Self {
            resolution,
            compression,
            min_time,
            max_time,
            series: BTreeMap::new(),
            created_at_ms: now_ms(),
            level: 0,
            sources: Vec::new(),
            output_count: 1,
        }
    }

    /// Record the blocks this one is derived from
    pub fn with_lineage(mut self, level: u32, sources: Vec<String>) -> Self {
        self.level = level;
        self.sources = sources;
        self
    }

    /// Number of sibling blocks written together with this one
    pub fn with_output_count(mut self, output_count: u32) -> Self {
        self.output_count = output_count.max(1);
        self
    }

    pub fn with_created_at(mut self, created_at_ms: i64) -> Self {
        self.created_at_ms = created_at_ms;
        self
    }

    /// Add all points of one series. Empty point lists are ignored.
    pub fn add_series(&mut self, key: SeriesKey, points: Vec<Point>) -> Result<()> {
        if points.is_empty() {
            return Ok(());
        }
        if self.series.contains_key(&key) {
            return Err(Error::InvalidBlock(format!("duplicate series {}", key)));
        }

        let mut prev: Option<i64> = None;
        for point in &points {
            let kind_ok = match point.value {
                PointValue::Raw(_) => self.resolution.is_raw(),
                PointValue::Summary(_) => !self.resolution.is_raw(),
            };
            if !kind_ok {
                return Err(Error::InvalidBlock(format!(
                    "point kind does not match {} block",
                    self.resolution
                )));
            }
            if point.timestamp < self.min_time || point.timestamp >= self.max_time {
                return Err(Error::InvalidBlock(format!(
                    "timestamp {} outside [{}, {})",
                    point.timestamp, self.min_time, self.max_time
                )));
            }
            if prev.is_some_and(|p| point.timestamp <= p) {
                return Err(Error::InvalidBlock(format!(
                    "timestamps of {} are not strictly increasing",
                    key
                )));
            }
            prev = Some(point.timestamp);
        }

        self.series.insert(key, points);
        Ok(())
    }

    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    pub fn sample_count(&self) -> usize {
        self.series.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Encode the block and derive its metadata
    pub fn finish(self) -> Result<EncodedBlock> {
        if self.series.is_empty() {
            return Err(Error::InvalidBlock("block has no series".to_string()));
        }

        let sample_count = self.sample_count();
        let header = BlockHeader {
            version: BLOCK_VERSION,
            compression: self.compression,
            resolution: self.resolution,
            min_time: self.min_time,
            max_time: self.max_time,
            series_count: self.series.len() as u32,
            sample_count: sample_count.min(u32::MAX as usize) as u32,
        };

        let mut output = BytesMut::with_capacity(HEADER_SIZE + sample_count * 10);
        header.encode(&mut output);

        let mut digest = Sha256::new();
        digest.update((self.resolution as u16).to_be_bytes());
        digest.update(self.min_time.to_be_bytes());
        digest.update(self.max_time.to_be_bytes());

        let mut entries = Vec::with_capacity(self.series.len());
        let mut payload = BytesMut::new();
        let mut key_buf = BytesMut::new();

        for (key, points) in &self.series {
            let min_time = points[0].timestamp;
            let max_time = points[points.len() - 1].timestamp;

            payload.clear();
            encode_points(points, min_time, &mut payload);

            let stored = match self.compression {
                Compression::None => payload.to_vec(),
                Compression::Lz4 => lz4_flex::compress_prepend_size(&payload),
            };
            let crc = crc32fast::hash(&stored);

            entries.push(IndexEntry {
                key: key.clone(),
                offset: output.len() as u64,
                len: stored.len() as u32,
                min_time,
                max_time,
                count: points.len() as u32,
                crc,
            });
            output.put_slice(&stored);

            key_buf.clear();
            key.encode(&mut key_buf);
            digest.update(&key_buf);
            digest.update((points.len() as u32).to_be_bytes());
            digest.update(crc32fast::hash(&payload).to_be_bytes());
        }

        let index_offset = output.len() as u64;
        let mut index = BytesMut::new();
        BlockIndex::encode_entries(&entries, &mut index);
        let footer = Footer {
            index_offset,
            index_len: index.len() as u32,
            index_crc: crc32fast::hash(&index),
            version: BLOCK_VERSION,
            compression: self.compression,
            resolution: self.resolution,
        };
        output.put_slice(&index);
        footer.encode(&mut output);

        let hash = digest.finalize();
        let external_id = format!("{:020}-{}", self.min_time, hex::encode(&hash[..16]));

        let meta = BlockMeta {
            external_id,
            resolution: self.resolution,
            min_time: self.min_time,
            max_time: self.max_time,
            series_count: self.series.len() as u32,
            sample_count: sample_count as u64,
            size_bytes: output.len() as u64,
            created_at_ms: self.created_at_ms,
            level: self.level,
            sources: self.sources,
            output_count: self.output_count,
        };

        Ok(EncodedBlock {
            meta,
            data: output.freeze(),
        })
    }
}

fn encode_points(points: &[Point], base: i64, buf: &mut BytesMut) {
    let mut last = base;
    for point in points {
        varint::encode_varint(buf, point.timestamp - last);
        last = point.timestamp;
        match point.value {
            PointValue::Raw(v) => buf.put_f64(v),
            PointValue::Summary(agg) => {
                buf.put_f64(agg.min);
                buf.put_f64(agg.max);
                buf.put_f64(agg.sum);
                varint::encode_varint_u64(buf, agg.count);
                buf.put_f64(agg.last);
            }
        }
    }
}
