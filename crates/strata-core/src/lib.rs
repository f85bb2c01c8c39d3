pub mod block;
pub mod downsample;
pub mod error;
pub mod matcher;
pub mod resolution;
pub mod series;
pub mod varint;

pub use block::{BlockMeta, Compression};
pub use downsample::downsample_points;
pub use error::{Error, ErrorKind, Result};
pub use matcher::{LabelMatcher, MatchOp, SeriesMatcher};
pub use resolution::{select_resolution, Resolution, ResolutionPolicy, RetentionPolicy};
pub use series::{
    Aggregate, Label, Point, PointValue, Sample, SeriesKey, SeriesPoints, METRIC_NAME_LABEL,
};

/// Current wall clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}
