//! Sample ingestion endpoint
//!
//! Every sample gets its own verdict. Samples with a malformed label set are
//! rejected before reaching the Block Store; the rest are appended as one batch,
//! and out-of-order samples come back rejected with the store's reason.

use axum::extract::State;
use axum::Json;
use strata_core::{Label, Sample, SeriesKey};
use strata_storage::AppendStatus;
use tracing::debug;

use crate::models::{SampleResult, SampleStatus, WriteRequest, WriteResponse};
use crate::AppState;

pub async fn write(
    State(state): State<AppState>,
    Json(request): Json<WriteRequest>,
) -> Json<WriteResponse> {
    let mut results: Vec<Option<SampleResult>> = vec![None; request.samples.len()];
    let mut batch = Vec::with_capacity(request.samples.len());
    let mut positions = Vec::with_capacity(request.samples.len());

    for (i, sample) in request.samples.into_iter().enumerate() {
        let labels = sample
            .labels
            .into_iter()
            .map(|(name, value)| Label::new(name, value));
        match SeriesKey::new(labels) {
            Ok(key) => {
                batch.push(Sample::new(key, sample.timestamp, sample.value));
                positions.push(i);
            }
            Err(e) => results[i] = Some(SampleResult::rejected(e.kind(), e.to_string())),
        }
    }

    let statuses = state.store.append_batch(batch).await;
    for (i, status) in positions.into_iter().zip(statuses) {
        results[i] = Some(match status {
            AppendStatus::Accepted => SampleResult::accepted(),
            AppendStatus::Rejected { kind, reason } => SampleResult::rejected(kind, reason),
        });
    }

    let results: Vec<SampleResult> = results.into_iter().flatten().collect();
    let accepted = results
        .iter()
        .filter(|r| r.status == SampleStatus::Accepted)
        .count();
    let rejected = results.len() - accepted;
    debug!(accepted, rejected, "Write request handled");

    Json(WriteResponse {
        accepted,
        rejected,
        results,
    })
}
