//! Query Federation
//!
//! `QueryEngine` answers a range query from two tiers at once: the local Block
//! Store, which holds the most recent data, and the object archive read through
//! the [`RemoteBlockReader`].
//!
//! ## Raw queries
//!
//! ```text
//!   start                  oldest local sample                    end
//!     │◀──────── archive ────────▶│◀───────── Block Store ─────────▶│
//! ```
//!
//! The range is split at the Block Store's oldest timestamp and both halves
//! are read concurrently. Samples shipped but not yet evicted may exist in both
//! tiers; merging keys every point by `(series, timestamp)`, so each sample is
//! returned once.
//!
//! ## Summary queries (5m, 1h)
//!
//! The archive serves the whole range at the summary tier and reports where its
//! coverage ends. Raw samples from the first window after that point are folded
//! into summary windows on the fly: local samples, plus archived raw blocks
//! between the end of summary coverage and the oldest local sample. Archived
//! windows and folded windows never overlap, so nothing is counted twice.
//!
//! ## Failures
//!
//! Both sub-queries share one deadline. A sub-query that errors or runs past it
//! is a failed source: the other tier's result is returned with `partial` set
//! and a warning. Only when both fail does the query fail.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use strata_core::{downsample_points, Point, Resolution, SeriesKey, SeriesMatcher, SeriesPoints};
use strata_observability::metrics;
use strata_storage::{BlockStore, RemoteBlockReader, RemoteRead};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, instrument, warn};

use crate::config::QueryConfig;
use crate::error::{QueryError, Result};

/// A range query over `[start, end]` (inclusive, ms)
#[derive(Debug, Clone, PartialEq)]
pub struct QueryRequest {
    pub matcher: SeriesMatcher,
    pub start: i64,
    pub end: i64,
    pub step: Option<Duration>,
    /// Read this tier instead of deriving one from the range
    pub resolution: Option<Resolution>,
}

impl QueryRequest {
    pub fn new(matcher: SeriesMatcher, start: i64, end: i64) -> Self {
        Self {
            matcher,
            start,
            end,
            step: None,
            resolution: None,
        }
    }

    pub fn with_step(mut self, step: Duration) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = Some(resolution);
        self
    }

    fn range(&self) -> Duration {
        Duration::from_millis(self.end.saturating_sub(self.start).max(0) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryResponse {
    pub resolution: Resolution,
    pub series: Vec<SeriesPoints>,
    /// A tier failed; `series` holds only what the other tier returned
    pub partial: bool,
    pub warnings: Vec<String>,
}

/// Per-series merge keyed by timestamp; later inserts replace exact duplicates
#[derive(Default)]
struct SeriesMerger {
    series: BTreeMap<SeriesKey, BTreeMap<i64, Point>>,
}

impl SeriesMerger {
    fn extend(&mut self, series: impl IntoIterator<Item = SeriesPoints>) {
        for s in series {
            let points = self.series.entry(s.key).or_default();
            for point in s.points {
                points.insert(point.timestamp, point);
            }
        }
    }

    fn finish(self) -> Vec<SeriesPoints> {
        self.series
            .into_iter()
            .filter(|(_, points)| !points.is_empty())
            .map(|(key, points)| SeriesPoints::new(key, points.into_values().collect()))
            .collect()
    }
}

/// Run one sub-query under the shared deadline; failures become warnings
async fn bounded<T, E, F>(deadline: Instant, source: &str, fut: F) -> std::result::Result<T, String>
where
    E: fmt::Display,
    F: Future<Output = std::result::Result<T, E>>,
{
    match timeout_at(deadline, fut).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{} tier failed: {}", source, e)),
        Err(_) => Err(format!("{} tier exceeded the query deadline", source)),
    }
}

pub struct QueryEngine {
    store: Arc<BlockStore>,
    remote: Arc<RemoteBlockReader>,
    config: QueryConfig,
}

impl QueryEngine {
    pub fn new(store: Arc<BlockStore>, remote: Arc<RemoteBlockReader>, config: QueryConfig) -> Self {
        Self {
            store,
            remote,
            config,
        }
    }

    /// Tier a request reads: its explicit resolution, or one picked from its range and step
    pub fn resolution_for(&self, request: &QueryRequest) -> Resolution {
        request.resolution.unwrap_or_else(|| {
            self.config
                .resolution
                .select_for_step(request.range(), request.step)
        })
    }

    #[instrument(skip(self, request), fields(matcher = %request.matcher, start = request.start, end = request.end))]
    pub async fn query(&self, request: &QueryRequest) -> Result<QueryResponse> {
        if request.start > request.end {
            return Err(QueryError::InvalidRange {
                start: request.start,
                end: request.end,
            });
        }

        let started = std::time::Instant::now();
        let resolution = self.resolution_for(request);
        let deadline = Instant::now() + self.config.timeout;

        let response = if resolution.is_raw() {
            self.query_raw(request, deadline).await?
        } else {
            self.query_summary(request, resolution, deadline).await?
        };

        metrics::QUERIES_TOTAL
            .with_label_values(&[resolution.as_str()])
            .inc();
        metrics::QUERY_LATENCY
            .with_label_values(&[resolution.as_str()])
            .observe(started.elapsed().as_secs_f64());
        if response.partial {
            metrics::PARTIAL_QUERIES_TOTAL.inc();
            warn!(warnings = ?response.warnings, "Returning partial query result");
        }
        Ok(response)
    }

    async fn query_raw(&self, request: &QueryRequest, deadline: Instant) -> Result<QueryResponse> {
        let (start, end) = (request.start, request.end);
        let boundary = self.store.oldest_timestamp().await;

        let local_range = match boundary {
            Some(b) if b <= end => Some((start.max(b), end)),
            _ => None,
        };
        let remote_range = match boundary {
            Some(b) if b <= start => None,
            Some(b) => Some((start, end.min(b - 1))),
            None => Some((start, end)),
        };
        debug!(?boundary, ?local_range, ?remote_range, "Split raw query");

        let local = async {
            match local_range {
                Some((s, e)) => self.store.query(&request.matcher, s, e).await,
                None => Ok(Vec::new()),
            }
        };
        let remote = async {
            match remote_range {
                Some((s, e)) => self
                    .remote
                    .read(&request.matcher, s, e, Resolution::Raw)
                    .await
                    .map(Some),
                None => Ok(None),
            }
        };
        let (local, remote) = tokio::join!(
            bounded(deadline, "local", local),
            bounded(deadline, "archive", remote)
        );

        let mut response = QueryResponse {
            resolution: Resolution::Raw,
            series: Vec::new(),
            partial: false,
            warnings: Vec::new(),
        };
        let mut merger = SeriesMerger::default();

        let remote_ok = match remote {
            Ok(read) => {
                if let Some(read) = read {
                    note_remote(&mut response, &read, Resolution::Raw);
                    merger.extend(read.series);
                }
                true
            }
            Err(warning) => {
                response.partial = true;
                response.warnings.push(warning);
                false
            }
        };
        match local {
            Ok(series) => merger.extend(series),
            Err(warning) => {
                if !remote_ok {
                    response.warnings.push(warning);
                    return Err(QueryError::Unavailable(response.warnings.join("; ")));
                }
                response.partial = true;
                response.warnings.push(warning);
            }
        }

        response.series = merger.finish();
        Ok(response)
    }

    async fn query_summary(
        &self,
        request: &QueryRequest,
        resolution: Resolution,
        deadline: Instant,
    ) -> Result<QueryResponse> {
        let (start, end) = (request.start, request.end);
        let oldest_local = self.store.oldest_timestamp().await;

        let (local, remote) = tokio::join!(
            bounded(
                deadline,
                "local",
                self.store.query(&request.matcher, start, end)
            ),
            bounded(
                deadline,
                "archive",
                self.remote.read(&request.matcher, start, end, resolution)
            )
        );

        let mut response = QueryResponse {
            resolution,
            series: Vec::new(),
            partial: false,
            warnings: Vec::new(),
        };
        let mut points: BTreeMap<SeriesKey, Vec<Point>> = BTreeMap::new();

        // Samples at or after this are folded from raw data
        let mut fold_from = i64::MIN;
        let mut summary_coverage = false;
        let remote_ok = match remote {
            Ok(read) => {
                note_remote(&mut response, &read, resolution);
                if let Some(coverage_end) = read.coverage_end() {
                    fold_from = read.resolution.align_up(coverage_end);
                    summary_coverage = !read.resolution.is_raw();
                }
                for s in read.series {
                    points.entry(s.key).or_default().extend(s.points);
                }
                true
            }
            Err(warning) => {
                response.partial = true;
                response.warnings.push(warning);
                false
            }
        };

        // Raw blocks already shipped and evicted, but not yet downsampled
        if let Some(oldest) = oldest_local {
            if summary_coverage && fold_from < oldest && fold_from <= end {
                let gap = bounded(
                    deadline,
                    "archive",
                    self.remote.read(
                        &request.matcher,
                        fold_from.max(start),
                        end.min(oldest - 1),
                        Resolution::Raw,
                    ),
                )
                .await;
                match gap {
                    Ok(read) if read.resolution.is_raw() => {
                        debug!(series = read.series.len(), "Folding archived raw samples past summary coverage");
                        for s in read.series {
                            points.entry(s.key).or_default().extend(s.points);
                        }
                    }
                    Ok(_) => {}
                    Err(warning) => {
                        response.partial = true;
                        response.warnings.push(warning);
                    }
                }
            }
        }

        match local {
            Ok(series) => {
                for s in series {
                    let recent = s.points.into_iter().filter(|p| p.timestamp >= fold_from);
                    points.entry(s.key).or_default().extend(recent);
                }
            }
            Err(warning) => {
                if !remote_ok {
                    response.warnings.push(warning);
                    return Err(QueryError::Unavailable(response.warnings.join("; ")));
                }
                response.partial = true;
                response.warnings.push(warning);
            }
        }

        response.series = points
            .into_iter()
            .filter(|(_, p)| !p.is_empty())
            .map(|(key, mut p)| {
                p.sort_by_key(|point| point.timestamp);
                p.dedup_by_key(|point| point.timestamp);
                SeriesPoints::new(key, downsample_points(&p, resolution))
            })
            .collect();
        Ok(response)
    }
}

fn note_remote(response: &mut QueryResponse, read: &RemoteRead, requested: Resolution) {
    if read.resolution != requested && !read.series.is_empty() {
        response
            .warnings
            .push(format!("archive served {} data instead of {}", read.resolution, requested));
    }
    for id in &read.skipped_blocks {
        response
            .warnings
            .push(format!("skipped corrupt archived block {}", id));
    }
}
