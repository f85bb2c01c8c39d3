//! Request and response bodies of the HTTP API

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use strata_core::{Point, PointValue, SeriesPoints};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriteRequest {
    pub samples: Vec<WriteSample>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WriteSample {
    /// Must include `__name__` or at least one other label
    pub labels: BTreeMap<String, String>,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleStatus {
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SampleResult {
    pub status: SampleStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl SampleResult {
    pub fn accepted() -> Self {
        Self {
            status: SampleStatus::Accepted,
            error_type: None,
            reason: None,
        }
    }

    pub fn rejected(error_type: impl ToString, reason: impl Into<String>) -> Self {
        Self {
            status: SampleStatus::Rejected,
            error_type: Some(error_type.to_string()),
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteResponse {
    pub accepted: usize,
    pub rejected: usize,
    /// One entry per request sample, in request order
    pub results: Vec<SampleResult>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryRangeParams {
    /// Series matcher, e.g. `cpu{host="a"}`
    pub query: String,
    /// Inclusive range bounds, ms since the Unix epoch
    pub start: i64,
    pub end: i64,
    /// Seconds (`60`) or a human duration (`5m`)
    #[serde(default)]
    pub step: Option<String>,
    /// Force a tier: `raw`, `5m` or `1h`
    #[serde(default)]
    pub resolution: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRangeResponse {
    pub status: String,
    pub data: QueryData,
    pub partial: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryData {
    pub resolution: String,
    pub result: Vec<SeriesResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeriesResult {
    pub metric: BTreeMap<String, String>,
    pub values: Vec<PointEntry>,
}

impl From<SeriesPoints> for SeriesResult {
    fn from(series: SeriesPoints) -> Self {
        Self {
            metric: series.key.to_map(),
            values: series.points.iter().map(PointEntry::from).collect(),
        }
    }
}

/// `[timestamp, value]` for raw points, an object for window summaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointEntry {
    Raw(i64, f64),
    Summary {
        timestamp: i64,
        min: f64,
        max: f64,
        sum: f64,
        count: u64,
        last: f64,
    },
}

impl From<&Point> for PointEntry {
    fn from(point: &Point) -> Self {
        match point.value {
            PointValue::Raw(v) => PointEntry::Raw(point.timestamp, v),
            PointValue::Summary(agg) => PointEntry::Summary {
                timestamp: point.timestamp,
                min: agg.min,
                max: agg.max,
                sum: agg.sum,
                count: agg.count,
                last: agg.last,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub status: String,
    pub error_type: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub open_samples: usize,
    pub sealed_blocks: usize,
    pub unshipped_blocks: usize,
}
