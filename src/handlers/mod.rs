//! # API Handlers
//!
//! This module contains all the HTTP endpoint handlers for the ingestion API.

use axum::{extract::State, response::Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::models::ServiceInfo;
use crate::server::AppState;

pub mod messages;
pub mod queue;
pub mod simulate;
pub mod ws;

/// Root handler that returns basic service information
#[utoipa::path(
    get,
    path = "/",
    responses(
        (status = 200, description = "Service information", body = ServiceInfo)
    ),
    tag = "root"
)]
pub async fn root(State(state): State<AppState>) -> Json<ServiceInfo> {
    Json(ServiceInfo::from_config(&state.config))
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Overall service status
    pub status: String,
    /// Buffer connectivity: "connected" or "disconnected"
    pub buffer: String,
    /// Number of records waiting in the pending buffer
    pub queue_length: u64,
    /// Messages per committed batch
    pub batch_threshold: usize,
}

/// Health check reporting buffer connectivity and queue length.
///
/// Always answers 200; a broken buffer is reported in the body so probes can
/// distinguish degradation from a dead process.
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service health", body = HealthResponse)
    ),
    tag = "operations"
)]
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let (buffer, queue_length) = match state.store.ping().await {
        Ok(()) => {
            let queue_length = state.store.pending_len().await.unwrap_or(0);
            ("connected", queue_length)
        }
        Err(err) => {
            tracing::warn!(error = %err, "Health check: buffer unreachable");
            ("disconnected", 0)
        }
    };

    let status = if buffer == "connected" {
        "healthy"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status: status.to_string(),
        buffer: buffer.to_string(),
        queue_length,
        batch_threshold: state.config.batch_size,
    })
}
