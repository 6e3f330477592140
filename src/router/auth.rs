//! API-key middleware: `X-API-Key` (header name configurable) or
//! `Authorization: Bearer <key>`, checked in that order, compared in
//! constant time. Disabled entirely when no key is configured.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use subtle::ConstantTimeEq;

use super::AppState;

pub async fn require_api_key(State(state): State<AppState>, request: Request<Body>, next: Next) -> Response {
    if state.settings.api_key.is_empty() {
        return next.run(request).await;
    }

    match extract_key(request.headers(), &state.settings.api_key_header) {
        None => unauthorized("missing API key"),
        Some(presented) => {
            if constant_time_eq(presented.as_bytes(), state.settings.api_key.as_bytes()) {
                next.run(request).await
            } else {
                forbidden("invalid API key")
            }
        }
    }
}

fn extract_key(headers: &HeaderMap, header_name: &str) -> Option<String> {
    if let Some(value) = headers.get(header_name).and_then(|v| v.to_str().ok()) {
        return Some(value.to_string());
    }

    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.to_string())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.ct_eq(b).into()
}

fn unauthorized(message: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": true, "message": message }))).into_response()
}

fn forbidden(message: &str) -> Response {
    (StatusCode::FORBIDDEN, Json(json!({ "error": true, "message": message }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn extracts_from_custom_header_first() {
        let mut headers = HeaderMap::new();
        headers.insert("X-API-Key", HeaderValue::from_static("secret"));
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer other"),
        );
        assert_eq!(extract_key(&headers, "X-API-Key"), Some("secret".to_string()));
    }

    #[test]
    fn falls_back_to_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            HeaderValue::from_static("Bearer from-bearer"),
        );
        assert_eq!(extract_key(&headers, "X-API-Key"), Some("from-bearer".to_string()));
    }

    #[test]
    fn missing_both_returns_none() {
        let headers = HeaderMap::new();
        assert_eq!(extract_key(&headers, "X-API-Key"), None);
    }

    #[test]
    fn constant_time_eq_rejects_different_lengths() {
        assert!(!constant_time_eq(b"short", b"much longer value"));
    }

    #[test]
    fn constant_time_eq_accepts_equal_values() {
        assert!(constant_time_eq(b"matching-key", b"matching-key"));
    }
}
