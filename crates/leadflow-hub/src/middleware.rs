//! API middleware: API key auth and request logging.

use axum::{
    body::Body,
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::time::Instant;
use tracing::info;

use crate::metrics::SharedMetrics;

/// Environment variable holding the API key. Unset = open API.
pub const API_KEY_ENV: &str = "LEADFLOW_API_KEY";

/// Whether the request headers carry the expected key.
///
/// Accepts `Authorization: Bearer <key>` or `X-API-Key: <key>`.
pub fn is_authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return true;
    };

    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let token = match auth.strip_prefix("Bearer ") {
        Some(bearer) => bearer,
        None => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
    };

    token == expected
}

/// API key authentication middleware.
pub async fn auth_middleware(headers: HeaderMap, request: Request<Body>, next: Next) -> Response {
    let expected = std::env::var(API_KEY_ENV).ok();

    if !is_authorized(expected.as_deref(), &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "Invalid or missing API key. Set Authorization: Bearer <key> or X-API-Key: <key>"
            })),
        )
            .into_response();
    }

    next.run(request).await
}

/// Request logging middleware; also counts requests in the metrics.
pub async fn logging_middleware(
    State(metrics): State<SharedMetrics>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let start = Instant::now();

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status = response.status();
    metrics.record_request(!(status.is_client_error() || status.is_server_error()));

    info!(
        "{} {} → {} ({:.1}ms)",
        method,
        uri,
        status.as_u16(),
        duration.as_secs_f64() * 1000.0
    );

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_no_key_configured_allows_all() {
        assert!(is_authorized(None, &HeaderMap::new()));
    }

    #[test]
    fn test_key_accepted_from_either_header() {
        let mut bearer = HeaderMap::new();
        bearer.insert("authorization", HeaderValue::from_static("Bearer s3cret"));
        assert!(is_authorized(Some("s3cret"), &bearer));

        let mut api_key = HeaderMap::new();
        api_key.insert("x-api-key", HeaderValue::from_static("s3cret"));
        assert!(is_authorized(Some("s3cret"), &api_key));

        let mut wrong = HeaderMap::new();
        wrong.insert("x-api-key", HeaderValue::from_static("guess"));
        assert!(!is_authorized(Some("s3cret"), &wrong));
        assert!(!is_authorized(Some("s3cret"), &HeaderMap::new()));
    }
}
