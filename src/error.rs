//! # Error Handling
//!
//! Unified error handling for the ingestion API, implementing a consistent
//! problem+json response format with trace ID propagation.

use axum::{
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

use crate::buffer::StoreError;

/// Unified API error response structure
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ApiError {
    /// HTTP status code for the response
    #[serde(skip_serializing, skip_deserializing)]
    pub status: StatusCode,
    /// Error code for programmatic handling
    pub code: String,
    /// Human-readable error message
    pub message: String,
    /// Additional error details (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// Suggested retry delay in seconds (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Correlation trace ID for debugging (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl ApiError {
    /// Create a new API error with the given status code and message
    pub fn new<S: Into<String>>(status: StatusCode, code: S, message: S) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
            details: None,
            retry_after: None,
            trace_id: None,
        }
    }

    /// Add details to the error
    pub fn with_details<V: Into<serde_json::Value>>(mut self, details: V) -> Self {
        self.details = Some(details.into());
        self
    }

    /// Set retry after delay
    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Attach the request correlation ID from the `x-request-id` header.
    pub fn with_trace_from(mut self, headers: &HeaderMap) -> Self {
        self.trace_id = headers
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        self
    }
}

/// Synchronous rejection at the ingest boundary (400).
pub fn invalid_payload(message: &str) -> ApiError {
    ApiError::new(StatusCode::BAD_REQUEST, "INVALID_PAYLOAD", message)
}

/// Transient failure to reach the buffer (503, retriable).
pub fn upstream_unavailable(message: &str) -> ApiError {
    ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "UPSTREAM_UNAVAILABLE", message)
        .with_retry_after(5)
}

/// Read-path failure when querying persisted rows (503).
pub fn store_unavailable(message: &str) -> ApiError {
    ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", message)
        .with_retry_after(5)
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut headers = HeaderMap::new();
        headers.insert(
            "content-type",
            HeaderValue::from_static("application/problem+json"),
        );

        if let Some(retry_after) = self.retry_after {
            if let Ok(header_value) = HeaderValue::from_str(&retry_after.to_string()) {
                headers.insert("retry-after", header_value);
            }
        }

        (self.status, headers, axum::Json(self)).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        upstream_unavailable(&error.to_string())
    }
}

impl From<sea_orm::DbErr> for ApiError {
    fn from(error: sea_orm::DbErr) -> Self {
        store_unavailable(&error.to_string())
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(error: anyhow::Error) -> Self {
        ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "INTERNAL_SERVER_ERROR",
            &error.to_string(),
        )
    }
}

/// Internal pipeline errors; never surfaced over HTTP directly.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("bulk insert rejected by the store after retry: {0}")]
    CommitFailed(sea_orm::DbErr),
    #[error("buffer operation failed: {0}")]
    Buffer(#[from] StoreError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use serde_json::json;

    #[test]
    fn api_error_basic() {
        let error = invalid_payload("user_id must be a positive integer");

        assert_eq!(error.status, StatusCode::BAD_REQUEST);
        assert_eq!(error.code, "INVALID_PAYLOAD");
        assert!(error.details.is_none());
        assert!(error.retry_after.is_none());
    }

    #[test]
    fn upstream_unavailable_carries_retry_hint() {
        let error = upstream_unavailable("buffer unreachable");

        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code, "UPSTREAM_UNAVAILABLE");
        assert_eq!(error.retry_after, Some(5));
    }

    #[test]
    fn retry_after_becomes_a_header() {
        let response = upstream_unavailable("buffer unreachable").into_response();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get("retry-after").unwrap(), "5");
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/problem+json"
        );
    }

    #[test]
    fn trace_id_extracted_from_request_headers() {
        let mut headers = HeaderMap::new();
        headers.insert("x-request-id", "trace-1234".parse().unwrap());

        let error = invalid_payload("bad").with_trace_from(&headers);
        assert_eq!(error.trace_id, Some("trace-1234".to_string()));
    }

    #[test]
    fn details_are_serialized_when_present() {
        let error = invalid_payload("validation failed")
            .with_details(json!({"content": "must not be empty"}));

        let body = serde_json::to_value(&error).unwrap();
        assert_eq!(
            body.get("details").unwrap(),
            &json!({"content": "must not be empty"})
        );
    }

    #[test]
    fn db_errors_map_to_store_unavailable() {
        let error: ApiError = sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "connection refused".to_string(),
        ))
        .into();

        assert_eq!(error.status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(error.code, "STORE_UNAVAILABLE");
    }
}
