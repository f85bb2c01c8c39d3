//! HTTP handlers

pub mod health;
pub mod query;
pub mod write;

use axum::http::StatusCode;
use axum::Json;
use strata_core::ErrorKind;

use crate::models::ErrorResponse;

pub type ApiError = (StatusCode, Json<ErrorResponse>);

/// Error body with a status code derived from the error kind
pub fn api_error(kind: ErrorKind, message: impl ToString) -> ApiError {
    let status = match kind {
        ErrorKind::InvalidInput | ErrorKind::OutOfOrder => StatusCode::BAD_REQUEST,
        ErrorKind::ArchiveUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            status: "error".to_string(),
            error_type: kind.to_string(),
            error: message.to_string(),
        }),
    )
}
