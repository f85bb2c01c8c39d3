//! Window folding for downsampled resolutions
//!
//! Raw samples fold into `{min, max, sum, count, last}` per aligned window of the
//! target resolution. Summary points fold by merging their aggregates, so a 1h
//! window built from twelve 5m windows equals one built from the raw samples.

use crate::resolution::Resolution;
use crate::series::{Aggregate, Point, PointValue};

/// Fold time-ordered points into windows of `target`.
///
/// Each output point is stamped with its window start. Points already at a
/// coarser or equal window are merged as they are. A raw target returns the
/// input unchanged.
pub fn downsample_points(points: &[Point], target: Resolution) -> Vec<Point> {
    if target.is_raw() {
        return points.to_vec();
    }

    let mut out: Vec<Point> = Vec::new();
    for point in points {
        let window = target.align(point.timestamp);
        let aggregate = match point.value {
            PointValue::Raw(v) => Aggregate::from_value(v),
            PointValue::Summary(agg) => agg,
        };

        match out.last_mut() {
            Some(Point {
                timestamp,
                value: PointValue::Summary(current),
            }) if *timestamp == window => current.merge(&aggregate),
            _ => out.push(Point::summary(window, aggregate)),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_raw_to_five_minutes() {
        let points = vec![
            Point::raw(0, 1.0),
            Point::raw(60_000, 3.0),
            Point::raw(299_999, 2.0),
            Point::raw(300_000, 10.0),
        ];
        let out = downsample_points(&points, Resolution::FiveMinutes);
        assert_eq!(out.len(), 2);

        let first = out[0].value.as_summary().unwrap();
        assert_eq!(out[0].timestamp, 0);
        assert_eq!(first.count, 3);
        assert_eq!(first.sum, 6.0);
        assert_eq!(first.min, 1.0);
        assert_eq!(first.max, 3.0);
        assert_eq!(first.last, 2.0);

        assert_eq!(out[1].timestamp, 300_000);
        assert_eq!(out[1].value.as_summary().unwrap().count, 1);
    }

    #[test]
    fn test_summaries_merge_into_coarser_windows() {
        let raw: Vec<Point> = (0..24).map(|i| Point::raw(i * 300_000, i as f64)).collect();
        let five = downsample_points(&raw, Resolution::FiveMinutes);
        assert_eq!(five.len(), 24);

        let from_five = downsample_points(&five, Resolution::OneHour);
        let from_raw = downsample_points(&raw, Resolution::OneHour);
        assert_eq!(from_five, from_raw);
        assert_eq!(from_raw.len(), 2);
        assert_eq!(from_raw[1].value.as_summary().unwrap().count, 12);
        assert_eq!(from_raw[1].value.as_summary().unwrap().last, 23.0);
    }

    #[test]
    fn test_negative_timestamps_align_down() {
        let out = downsample_points(&[Point::raw(-1, 1.0)], Resolution::FiveMinutes);
        assert_eq!(out[0].timestamp, -300_000);
    }

    #[test]
    fn test_raw_target_is_identity() {
        let points = vec![Point::raw(5, 1.0)];
        assert_eq!(downsample_points(&points, Resolution::Raw), points);
    }
}
