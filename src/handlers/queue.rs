//! # Queue Status and Reset Handlers
//!
//! Queue depth inspection and the administrative reset.

use axum::{extract::State, http::HeaderMap, response::Json};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use crate::buffer::{BATCH_START_TIME_KEY, WORKER_BUFFER_SIZE_KEY};
use crate::error::{ApiError, store_unavailable};
use crate::repositories::MessageRepository;
use crate::server::AppState;

/// Current queue depth split across the buffer list and the coordinator's
/// staging area
#[derive(Debug, Serialize, ToSchema)]
pub struct QueueStatusResponse {
    /// Records waiting in the pending buffer list
    pub buffer_length: u64,
    /// Messages staged inside the coordinator
    pub worker_buffer_size: u64,
    /// Epoch seconds of the first staged message; null when staging is empty
    pub batch_start_time: Option<f64>,
}

/// Report the pending buffer length and the coordinator's staging state
#[utoipa::path(
    get,
    path = "/queue/status",
    responses(
        (status = 200, description = "Queue status", body = QueueStatusResponse),
        (status = 503, description = "Buffer unreachable", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn queue_status(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<QueueStatusResponse>, ApiError> {
    let buffer_length = state
        .store
        .pending_len()
        .await
        .map_err(|err| ApiError::from(err).with_trace_from(&headers))?;
    let worker_buffer_size = state
        .store
        .counter(WORKER_BUFFER_SIZE_KEY)
        .await
        .map_err(|err| ApiError::from(err).with_trace_from(&headers))?;
    let batch_start_time = state
        .store
        .gauge(BATCH_START_TIME_KEY)
        .await
        .map_err(|err| ApiError::from(err).with_trace_from(&headers))?;

    Ok(Json(QueueStatusResponse {
        buffer_length,
        worker_buffer_size,
        batch_start_time,
    }))
}

/// Result of an administrative reset
#[derive(Debug, Serialize, ToSchema)]
pub struct ResetResponse {
    /// Rows deleted from the persisted table
    pub deleted_messages: u64,
    /// Entries drained from the pending buffer
    pub cleared_queue: u64,
}

/// Truncate the persisted table and drain the pending buffer
///
/// Lifetime counters (`total_messages`, `total_batches`) are left untouched:
/// they count work performed, not rows retained. The coordinator's staging
/// area is not accessed directly; it empties through the coordinator
/// observing the drained buffer.
#[utoipa::path(
    delete,
    path = "/reset",
    responses(
        (status = 200, description = "Reset completed", body = ResetResponse),
        (status = 503, description = "Store or buffer unreachable", body = ApiError)
    ),
    tag = "operations"
)]
pub async fn reset(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ResetResponse>, ApiError> {
    let deleted_messages = MessageRepository::new(&state.db)
        .delete_all()
        .await
        .map_err(|err| store_unavailable(&err.to_string()).with_trace_from(&headers))?;

    let cleared_queue = state
        .store
        .drain_pending()
        .await
        .map_err(|err| ApiError::from(err).with_trace_from(&headers))?;

    info!(deleted_messages, cleared_queue, "Administrative reset completed");

    Ok(Json(ResetResponse {
        deleted_messages,
        cleared_queue,
    }))
}
