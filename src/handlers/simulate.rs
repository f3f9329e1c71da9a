//! # Simulation Endpoint Handler
//!
//! Injects a configurable burst of synthetic messages so the batching
//! behavior can be observed end to end: bursts below the batch threshold stay
//! queued until the time trigger, larger bursts flush in threshold-sized
//! commits.

use axum::{
    extract::State,
    extract::rejection::JsonRejection,
    http::{HeaderMap, StatusCode},
    response::Json,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::error::{ApiError, invalid_payload};
use crate::records::QueuedMessage;
use crate::server::AppState;

const MAX_SIMULATED_MESSAGES: u64 = 10_000;
const DEFAULT_SIMULATED_MESSAGES: u64 = 500;

/// Chat lines used for synthetic traffic.
const SIMULATED_CONTENT: &[&str] = &[
    "Hey everyone! How's it going?",
    "Just pushed the latest changes to main",
    "Can someone review my PR when they get a chance?",
    "The new feature is looking great!",
    "Anyone up for a quick sync?",
    "Just deployed to staging, testing now",
    "Found a bug in the auth flow, fixing it",
    "Great work on the dashboard!",
    "Need help with the API integration",
    "The tests are passing now",
    "Updated the docs with the new endpoints",
    "Quick question about the database schema",
    "Just finished the code review",
    "Working on the performance optimization",
    "The metrics look good today",
    "Anyone seen this error before?",
    "Fixed the memory leak issue",
    "Ready for the demo tomorrow",
    "The pipeline is running faster now",
    "Debugging the WebSocket connection",
    "The batch processing is working well",
    "Added more logging for debugging",
    "Optimized the database queries",
    "The cache hit rate improved",
    "All systems operational",
    "Investigating the latency spike",
    "Scaling up the worker instances",
    "The queue is draining nicely",
];

/// Request payload for the burst simulation
#[derive(Debug, Deserialize, ToSchema)]
pub struct SimulateRequest {
    /// Number of messages to inject (1-10000, default 500)
    pub count: Option<u64>,
}

/// Response describing the injected burst and the expected batching outcome
#[derive(Debug, Serialize, ToSchema)]
pub struct SimulateResponse {
    /// Tracking ids of every injected message, in enqueue order
    pub tracking_ids: Vec<String>,
    /// Number of messages injected
    pub count: u64,
    /// Batches the volume trigger will flush immediately
    pub expected_complete_batches: u64,
    /// Messages left for the time trigger
    pub expected_remaining_queued: u64,
    /// Messages per committed batch
    pub batch_threshold: usize,
}

/// Inject a burst of synthetic messages
#[utoipa::path(
    post,
    path = "/simulate",
    request_body = SimulateRequest,
    responses(
        (status = 202, description = "Burst accepted into the buffer", body = SimulateResponse),
        (status = 400, description = "Invalid payload", body = ApiError),
        (status = 503, description = "Buffer unreachable", body = ApiError)
    ),
    tag = "messages"
)]
pub async fn simulate(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SimulateRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<SimulateResponse>), ApiError> {
    let Json(request) =
        payload.map_err(|err| invalid_payload(&err.body_text()).with_trace_from(&headers))?;

    let count = request.count.unwrap_or(DEFAULT_SIMULATED_MESSAGES);
    if count < 1 || count > MAX_SIMULATED_MESSAGES {
        return Err(
            invalid_payload("count must be between 1 and 10000").with_trace_from(&headers)
        );
    }

    info!(count, "Starting burst simulation");

    // Generate up front; the RNG handle must not live across await points.
    let messages: Vec<QueuedMessage> = {
        let mut rng = rand::thread_rng();
        (0..count)
            .map(|_| {
                let content = SIMULATED_CONTENT[rng.gen_range(0..SIMULATED_CONTENT.len())];
                QueuedMessage::new(
                    rng.gen_range(1..=10_000),
                    rng.gen_range(1..=100),
                    content.to_string(),
                    None,
                )
            })
            .collect()
    };

    // Every returned id must have been acknowledged by the buffer, so the
    // ids are collected only after each append succeeds.
    let mut tracking_ids = Vec::with_capacity(messages.len());
    for message in &messages {
        let encoded = message
            .encode()
            .map_err(|err| ApiError::from(anyhow::Error::from(err)))?;
        state
            .store
            .push_pending(&encoded)
            .await
            .map_err(|err| ApiError::from(err).with_trace_from(&headers))?;
        tracking_ids.push(message.tracking_id.clone());
    }

    let batch_threshold = state.config.batch_size;
    let expected_complete_batches = count / batch_threshold as u64;
    let expected_remaining_queued = count % batch_threshold as u64;

    info!(
        count,
        expected_complete_batches, expected_remaining_queued, "Burst simulation queued"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(SimulateResponse {
            tracking_ids,
            count,
            expected_complete_batches,
            expected_remaining_queued,
            batch_threshold,
        }),
    ))
}
