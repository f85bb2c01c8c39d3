//! Prometheus scrape endpoint

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

/// Every registered Strata metric in the Prometheus text format
pub fn render() -> prometheus::Result<(String, Vec<u8>)> {
    let encoder = TextEncoder::new();
    let mut body = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut body)?;
    Ok((encoder.format_type().to_string(), body))
}

pub async fn metrics_handler() -> Response {
    match render() {
        Ok((content_type, body)) => {
            (StatusCode::OK, [(header::CONTENT_TYPE, content_type)], body).into_response()
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to encode metrics: {}", e),
        )
            .into_response(),
    }
}

/// Router serving `/metrics`, merged into the server's API router
pub fn create_metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[test]
    fn test_render_includes_strata_metrics() {
        crate::metrics::init();
        crate::metrics::BLOCKS_SEALED_TOTAL.inc();
        let (content_type, body) = render().unwrap();
        assert!(content_type.starts_with("text/plain"));
        let text = String::from_utf8(body).unwrap();
        assert!(text.contains("strata_blocks_sealed_total"));
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        crate::metrics::init();
        crate::metrics::SAMPLES_APPENDED_TOTAL.inc();

        let response = create_metrics_router()
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/plain; version=0.0.4"
        );

        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("strata_samples_appended_total"));
    }
}
