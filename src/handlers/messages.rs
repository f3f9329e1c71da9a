//! # Messages Endpoint Handlers
//!
//! Single-message enqueue and the persisted read path.

use axum::{
    extract::rejection::JsonRejection,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::{IntoParams, ToSchema};

use crate::error::{ApiError, invalid_payload, store_unavailable};
use crate::models::message::Model;
use crate::records::QueuedMessage;
use crate::repositories::MessageRepository;
use crate::server::AppState;

/// Longest accepted message body, in characters.
const MAX_CONTENT_CHARS: usize = 2000;

/// Request payload for enqueueing a single message
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateMessageRequest {
    /// Identifier of the authoring user (positive)
    pub user_id: i32,
    /// Identifier of the target channel (positive)
    pub channel_id: i32,
    /// Message body (non-empty, at most 2000 characters)
    pub content: String,
    /// Optional ingest timestamp; stamped server-side when absent
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Acknowledgment returned once the buffer has accepted the message
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageAccepted {
    /// Opaque identifier for correlating later persistence events
    pub tracking_id: String,
    /// Ingest timestamp assigned to the message
    pub queued_at: DateTime<Utc>,
}

/// Enqueue one message for batched persistence
#[utoipa::path(
    post,
    path = "/messages",
    request_body = CreateMessageRequest,
    responses(
        (status = 202, description = "Message accepted into the buffer", body = MessageAccepted),
        (status = 400, description = "Invalid payload", body = ApiError),
        (status = 503, description = "Buffer unreachable", body = ApiError)
    ),
    tag = "messages"
)]
pub async fn create_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<CreateMessageRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageAccepted>), ApiError> {
    let Json(request) =
        payload.map_err(|err| invalid_payload(&err.body_text()).with_trace_from(&headers))?;

    let content = validate(&request).map_err(|err| err.with_trace_from(&headers))?;

    let message = QueuedMessage::new(request.user_id, request.channel_id, content, request.created_at);
    let encoded = message
        .encode()
        .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;

    state
        .store
        .push_pending(&encoded)
        .await
        .map_err(|err| ApiError::from(err).with_trace_from(&headers))?;

    info!(
        tracking_id = %message.tracking_id,
        user_id = message.user_id,
        channel_id = message.channel_id,
        "Message queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(MessageAccepted {
            tracking_id: message.tracking_id,
            queued_at: message.created_at,
        }),
    ))
}

fn validate(request: &CreateMessageRequest) -> Result<String, ApiError> {
    if request.user_id <= 0 {
        return Err(invalid_payload("user_id must be a positive integer"));
    }
    if request.channel_id <= 0 {
        return Err(invalid_payload("channel_id must be a positive integer"));
    }

    let content = request.content.trim();
    if content.is_empty() {
        return Err(invalid_payload("content cannot be empty or whitespace only"));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(invalid_payload("content must be at most 2000 characters"));
    }

    Ok(content.to_string())
}

/// Query parameters for the persisted read path
#[derive(Debug, Deserialize, IntoParams)]
pub struct ListMessagesQuery {
    /// Maximum number of rows to return (default: 50, max: 500)
    pub limit: Option<u64>,
}

/// A persisted message row
#[derive(Debug, Serialize, ToSchema)]
pub struct MessageRow {
    pub id: i32,
    pub user_id: i32,
    pub channel_id: i32,
    pub content: String,
    pub created_at: String,
    pub inserted_at: String,
}

impl From<Model> for MessageRow {
    fn from(model: Model) -> Self {
        Self {
            id: model.id,
            user_id: model.user_id,
            channel_id: model.channel_id,
            content: model.content,
            created_at: model.created_at.to_rfc3339(),
            inserted_at: model.inserted_at.to_rfc3339(),
        }
    }
}

/// Retrieve the most recently persisted messages
#[utoipa::path(
    get,
    path = "/messages",
    params(ListMessagesQuery),
    responses(
        (status = 200, description = "Persisted messages, newest commit first", body = [MessageRow]),
        (status = 400, description = "Invalid query parameters", body = ApiError),
        (status = 503, description = "Relational store unavailable", body = ApiError)
    ),
    tag = "messages"
)]
pub async fn list_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListMessagesQuery>,
) -> Result<Json<Vec<MessageRow>>, ApiError> {
    let limit = query.limit.unwrap_or(50);
    if limit < 1 || limit > 500 {
        return Err(invalid_payload("limit must be between 1 and 500").with_trace_from(&headers));
    }

    let rows = MessageRepository::new(&state.db)
        .recent(limit)
        .await
        .map_err(|err| store_unavailable(&err.to_string()).with_trace_from(&headers))?;

    Ok(Json(rows.into_iter().map(MessageRow::from).collect()))
}
