//! Strata Server
//!
//! HTTP/JSON front end of Strata plus the wiring of its background loops.
//!
//! ## Endpoints
//!
//! - `POST /api/v1/write`: append samples, one verdict per sample
//! - `GET /api/v1/query_range?query=&start=&end=&step=`: federated range query
//! - `GET /health`: liveness plus Block Store counters
//! - `GET /metrics`: Prometheus text format

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use strata_query::QueryEngine;
use strata_storage::BlockStore;

pub mod app;
pub mod config;
pub mod handlers;
pub mod models;

pub use app::Strata;
pub use config::{ObjectStoreConfig, ServerConfig};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<BlockStore>,
    pub engine: Arc<QueryEngine>,
}

/// Create the API router with all endpoints
pub fn create_router(state: AppState) -> Router {
    let api_routes = Router::new()
        .route("/write", post(handlers::write::write))
        .route("/query_range", get(handlers::query::query_range))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/health", get(handlers::health::health_check))
        .with_state(state)
        .merge(strata_observability::create_metrics_router())
}
