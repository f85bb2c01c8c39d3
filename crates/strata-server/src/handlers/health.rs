//! Health endpoint

use axum::extract::State;
use axum::Json;

use crate::models::HealthResponse;
use crate::AppState;

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.store.stats().await;
    Json(HealthResponse {
        status: "ok".to_string(),
        open_samples: stats.open_samples,
        sealed_blocks: stats.sealed_blocks,
        unshipped_blocks: stats.unshipped_blocks,
    })
}
