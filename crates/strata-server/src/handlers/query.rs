//! Range query endpoint

use std::str::FromStr;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::Json;
use humantime_serde::re::humantime;
use strata_core::{ErrorKind, Resolution, SeriesMatcher};
use strata_query::QueryRequest;

use super::{api_error, ApiError};
use crate::models::{QueryData, QueryRangeParams, QueryRangeResponse, SeriesResult};
use crate::AppState;

/// Seconds as a number, or a human duration such as `5m`
fn parse_step(step: &str) -> Option<Duration> {
    match step.parse::<f64>() {
        Ok(secs) if secs > 0.0 && secs.is_finite() => Some(Duration::from_secs_f64(secs)),
        Ok(_) => None,
        Err(_) => humantime::parse_duration(step)
            .ok()
            .filter(|d| !d.is_zero()),
    }
}

pub async fn query_range(
    State(state): State<AppState>,
    Query(params): Query<QueryRangeParams>,
) -> Result<Json<QueryRangeResponse>, ApiError> {
    let matcher =
        SeriesMatcher::parse(&params.query).map_err(|e| api_error(e.kind(), e))?;

    let mut request = QueryRequest::new(matcher, params.start, params.end);
    if let Some(step) = params.step.as_deref() {
        let step = parse_step(step).ok_or_else(|| {
            api_error(ErrorKind::InvalidInput, format!("invalid step: {}", step))
        })?;
        request = request.with_step(step);
    }
    if let Some(resolution) = params.resolution.as_deref() {
        let resolution = Resolution::from_str(resolution).map_err(|e| api_error(e.kind(), e))?;
        request = request.with_resolution(resolution);
    }

    let response = state
        .engine
        .query(&request)
        .await
        .map_err(|e| api_error(e.kind(), e))?;

    Ok(Json(QueryRangeResponse {
        status: "success".to_string(),
        data: QueryData {
            resolution: response.resolution.to_string(),
            result: response.series.into_iter().map(SeriesResult::from).collect(),
        },
        partial: response.partial,
        warnings: response.warnings,
    }))
}
