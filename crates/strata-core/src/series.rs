//! Series, Sample and Point Data Structures
//!
//! ## Series identity
//! A series is identified by its full label set. The metric name is stored as the
//! reserved `__name__` label, so `cpu{host="a"}` and `cpu{host="b"}` are two
//! series and `{__name__="cpu", host="a"}` is the same series as the first one.
//!
//! `SeriesKey` keeps its labels sorted by name with unique names. That makes the
//! derived `Ord`/`Hash` canonical: blocks order their chunks by key, and block
//! external ids hash the canonical binary encoding.
//!
//! ## Points
//! Raw data is a stream of `(timestamp, f64)` samples. Downsampled tiers store
//! one [`Aggregate`] per window instead; reads return both as [`Point`]s so the
//! query layer can merge tiers without caring which one answered.

use std::collections::BTreeMap;
use std::fmt;

use bytes::{Buf, BufMut};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::varint;

/// Label holding the metric name
pub const METRIC_NAME_LABEL: &str = "__name__";

/// A single label name/value pair
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    pub value: String,
}

impl Label {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Canonical, sorted label set identifying one series
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    labels: Vec<Label>,
}

impl SeriesKey {
    /// Build a key from an arbitrary label list.
    ///
    /// Labels are sorted by name; when a name repeats the last value wins.
    /// Labels with an empty value are dropped (an empty value means "absent").
    pub fn new(labels: impl IntoIterator<Item = Label>) -> Result<Self> {
        let mut by_name: BTreeMap<String, String> = BTreeMap::new();
        for label in labels {
            if label.name.is_empty() {
                return Err(Error::InvalidSeriesKey("empty label name".to_string()));
            }
            if label.value.is_empty() {
                by_name.remove(&label.name);
                continue;
            }
            by_name.insert(label.name, label.value);
        }

        if by_name.is_empty() {
            return Err(Error::InvalidSeriesKey("series has no labels".to_string()));
        }

        Ok(Self {
            labels: by_name
                .into_iter()
                .map(|(name, value)| Label { name, value })
                .collect(),
        })
    }

    /// Convenience constructor: metric name plus `(name, value)` pairs
    pub fn metric(name: &str, pairs: &[(&str, &str)]) -> Result<Self> {
        let labels = std::iter::once(Label::new(METRIC_NAME_LABEL, name))
            .chain(pairs.iter().map(|(n, v)| Label::new(*n, *v)));
        Self::new(labels)
    }

    pub fn labels(&self) -> &[Label] {
        &self.labels
    }

    /// Value of a label, if present
    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels
            .binary_search_by(|l| l.name.as_str().cmp(name))
            .ok()
            .map(|i| self.labels[i].value.as_str())
    }

    pub fn metric_name(&self) -> Option<&str> {
        self.get(METRIC_NAME_LABEL)
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.labels
            .iter()
            .map(|l| (l.name.clone(), l.value.clone()))
            .collect()
    }

    /// Binary form used by the block index and external id digests:
    /// label count, then length-prefixed name and value per label.
    pub fn encode(&self, buf: &mut impl BufMut) {
        varint::encode_varint_u64(buf, self.labels.len() as u64);
        for label in &self.labels {
            varint::encode_varint_u64(buf, label.name.len() as u64);
            buf.put_slice(label.name.as_bytes());
            varint::encode_varint_u64(buf, label.value.len() as u64);
            buf.put_slice(label.value.as_bytes());
        }
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = varint::encoded_len_u64(self.labels.len() as u64);
        for label in &self.labels {
            len += varint::encoded_len_u64(label.name.len() as u64) + label.name.len();
            len += varint::encoded_len_u64(label.value.len() as u64) + label.value.len();
        }
        len
    }

    pub fn decode(buf: &mut impl Buf) -> Result<Self> {
        let count = varint::decode_varint_u64(buf)? as usize;
        let mut labels = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = read_string(buf)?;
            let value = read_string(buf)?;
            labels.push(Label { name, value });
        }

        // Encoded keys are canonical; anything else means the bytes are damaged
        if labels.is_empty() || labels.windows(2).any(|w| w[0].name >= w[1].name) {
            return Err(Error::InvalidBlock("non-canonical series key".to_string()));
        }
        Ok(Self { labels })
    }
}

fn read_string(buf: &mut impl Buf) -> Result<String> {
    let len = varint::decode_varint_u64(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::InvalidBlock("truncated label".to_string()));
    }
    let mut bytes = vec![0u8; len];
    buf.copy_to_slice(&mut bytes);
    String::from_utf8(bytes).map_err(|_| Error::InvalidBlock("label is not utf-8".to_string()))
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(name) = self.metric_name() {
            f.write_str(name)?;
        }
        f.write_str("{")?;
        let mut first = true;
        for label in self.labels.iter().filter(|l| l.name != METRIC_NAME_LABEL) {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            write!(f, "{}=\"", label.name)?;
            for c in label.value.chars() {
                match c {
                    '"' => f.write_str("\\\"")?,
                    '\\' => f.write_str("\\\\")?,
                    '\n' => f.write_str("\\n")?,
                    c => write!(f, "{}", c)?,
                }
            }
            f.write_str("\"")?;
        }
        f.write_str("}")
    }
}

/// One sample on the write path
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub key: SeriesKey,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub value: f64,
}

impl Sample {
    pub fn new(key: SeriesKey, timestamp: i64, value: f64) -> Self {
        Self {
            key,
            timestamp,
            value,
        }
    }
}

/// Summary statistics of the raw samples inside one downsampling window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    pub min: f64,
    pub max: f64,
    pub sum: f64,
    pub count: u64,
    /// Value of the latest sample in the window
    pub last: f64,
}

impl Aggregate {
    pub fn from_value(value: f64) -> Self {
        Self {
            min: value,
            max: value,
            sum: value,
            count: 1,
            last: value,
        }
    }

    /// Fold in a sample that is later than everything seen so far
    pub fn observe(&mut self, value: f64) {
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        self.sum += value;
        self.count += 1;
        self.last = value;
    }

    /// Fold in an aggregate covering a later time span
    pub fn merge(&mut self, later: &Aggregate) {
        self.min = self.min.min(later.min);
        self.max = self.max.max(later.max);
        self.sum += later.sum;
        self.count += later.count;
        self.last = later.last;
    }

    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            f64::NAN
        } else {
            self.sum / self.count as f64
        }
    }
}

/// Value of a point as stored at its resolution
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PointValue {
    Raw(f64),
    Summary(Aggregate),
}

impl PointValue {
    /// Scalar used when a single number is needed (raw value, or window mean)
    pub fn scalar(&self) -> f64 {
        match self {
            PointValue::Raw(v) => *v,
            PointValue::Summary(agg) => agg.mean(),
        }
    }

    pub fn as_summary(&self) -> Option<&Aggregate> {
        match self {
            PointValue::Summary(agg) => Some(agg),
            PointValue::Raw(_) => None,
        }
    }
}

/// A timestamped value returned from reads
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub timestamp: i64,
    pub value: PointValue,
}

impl Point {
    pub fn raw(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value: PointValue::Raw(value),
        }
    }

    pub fn summary(timestamp: i64, aggregate: Aggregate) -> Self {
        Self {
            timestamp,
            value: PointValue::Summary(aggregate),
        }
    }
}

/// Points of one series, ordered by timestamp
#[derive(Debug, Clone, PartialEq)]
pub struct SeriesPoints {
    pub key: SeriesKey,
    pub points: Vec<Point>,
}

impl SeriesPoints {
    pub fn new(key: SeriesKey, points: Vec<Point>) -> Self {
        Self { key, points }
    }
}
