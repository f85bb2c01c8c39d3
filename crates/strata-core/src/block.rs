//! Block Metadata
//!
//! A block is the immutable storage unit of Strata: every sample of many series
//! within `[min_time, max_time)`, at one resolution. The same block file lives on
//! the local disk after sealing and in the object archive after shipping.
//!
//! ## Block Lifecycle
//! 1. Samples accumulate in the open block of the Block Store
//! 2. The open block is sealed by time or size and encoded to a block file
//! 3. The shipper uploads it; `meta.json` is written last and commits it
//! 4. The compactor merges blocks of one day and derives 5m / 1h blocks
//! 5. Outputs list their inputs in `sources`; the inputs are then deleted
//!
//! ## BlockMeta
//! The JSON sidecar stored next to every archived block. Its presence is the
//! commit marker, so everything a reader needs to plan a query is in here:
//! - Resolution and time range (`max_time` is exclusive)
//! - Series and sample counts, encoded size
//! - Creation time and compaction level
//! - Lineage: external ids of the blocks this one was derived from
//!
//! ## Example
//! ```ignore
//! let meta = BlockMeta {
//!     external_id: "00000000000000000000-3f2a9c0d41e8b7a6c5d4e3f2a1b0c9d8".to_string(),
//!     resolution: Resolution::Raw,
//!     min_time: 0,
//!     max_time: 100_000,
//!     series_count: 1,
//!     sample_count: 2,
//!     size_bytes: 142,
//!     created_at_ms: 1_700_000_000_000,
//!     level: 0,
//!     sources: vec![],
//!     output_count: 1,
//! };
//! ```

use serde::{Deserialize, Serialize};

use crate::resolution::Resolution;

/// Metadata of a sealed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    /// Content-derived id
    pub external_id: String,

    pub resolution: Resolution,

    /// First timestamp covered (inclusive)
    pub min_time: i64,

    /// End of the covered range (exclusive)
    pub max_time: i64,

    pub series_count: u32,

    /// Samples for raw blocks, windows for downsampled blocks
    pub sample_count: u64,

    /// Encoded size of the block file
    pub size_bytes: u64,

    /// Creation timestamp (ms); orders duplicate samples during compaction
    pub created_at_ms: i64,

    /// 0 for sealed blocks, +1 per compaction
    #[serde(default)]
    pub level: u32,

    /// External ids of the blocks this one replaces
    #[serde(default)]
    pub sources: Vec<String>,

    /// Blocks written by the compaction that produced this one. Its sources are
    /// superseded only once all of them are committed.
    #[serde(default = "default_output_count")]
    pub output_count: u32,
}

fn default_output_count() -> u32 {
    1
}

impl BlockMeta {
    /// Whether the block has data inside the inclusive query range `[start, end]`
    pub fn overlaps(&self, start: i64, end: i64) -> bool {
        self.min_time <= end && self.max_time > start
    }

    pub fn duration_ms(&self) -> i64 {
        self.max_time - self.min_time
    }

    /// Ordering key for last-write-wins: a block with a larger key wins ties
    pub fn write_order(&self) -> (i64, &str) {
        (self.created_at_ms, self.external_id.as_str())
    }

    pub fn is_derived_from(&self, external_id: &str) -> bool {
        self.sources.iter().any(|s| s == external_id)
    }
}

/// Compression type for block chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u16)]
pub enum Compression {
    None = 0,
    #[default]
    Lz4 = 1,
}

impl TryFrom<u16> for Compression {
    type Error = crate::Error;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Lz4),
            _ => Err(crate::Error::InvalidCompression(value)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(min_time: i64, max_time: i64) -> BlockMeta {
        BlockMeta {
            external_id: "a".to_string(),
            resolution: Resolution::Raw,
            min_time,
            max_time,
            series_count: 1,
            sample_count: 2,
            size_bytes: 100,
            created_at_ms: 5,
            level: 0,
            sources: vec![],
            output_count: 1,
        }
    }

    #[test]
    fn test_overlap_uses_exclusive_max_time() {
        let m = meta(0, 100_000);
        assert!(m.overlaps(0, 120_000));
        assert!(m.overlaps(99_999, 99_999));
        assert!(!m.overlaps(100_000, 200_000));
        assert!(!m.overlaps(-10, -1));
        assert!(m.overlaps(-10, 0));
    }

    #[test]
    fn test_json_sidecar_shape() {
        let m = meta(0, 10);
        let json = serde_json::to_value(&m).unwrap();
        assert_eq!(json["resolution"], "raw");
        assert_eq!(json["max_time"], 10);

        // Sidecars without lineage fields still parse
        let legacy = r#"{"external_id":"x","resolution":"5m","min_time":0,"max_time":1,
            "series_count":1,"sample_count":1,"size_bytes":1,"created_at_ms":0}"#;
        let parsed: BlockMeta = serde_json::from_str(legacy).unwrap();
        assert_eq!(parsed.resolution, Resolution::FiveMinutes);
        assert!(parsed.sources.is_empty());
        assert_eq!(parsed.output_count, 1);
    }

    #[test]
    fn test_compression_ids() {
        assert_eq!(Compression::try_from(1).unwrap(), Compression::Lz4);
        assert!(Compression::try_from(2).is_err());
    }
}
