//! # Telemetry Broadcaster
//!
//! Per connected observer, multiplexes a periodic stats snapshot and the
//! event-driven persistence stream onto one WebSocket. Each session owns its
//! subscription and timer; both are released when the session ends. The
//! subscription is established before the first stats frame is sent so no
//! publication is missed during the hand-off.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use chrono::{DateTime, Utc};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::buffer::{
    CURRENT_RPS_KEY, MetricsStore, StoreError, TOTAL_BATCHES_KEY, TOTAL_MESSAGES_KEY,
    WORKER_BUFFER_SIZE_KEY,
};
use crate::records::PersistenceEvent;
use crate::server::AppState;

/// How long an outbound frame may sit in the socket before the session is
/// considered stalled and terminated. Terminating keeps the event stream
/// lossless for every surviving observer; the dropped client reconnects and
/// reconciles through the persisted read endpoint.
const WRITE_DEADLINE: Duration = Duration::from_secs(5);

/// Periodic snapshot of the shared counters plus derived fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatsSnapshot {
    pub total_messages: u64,
    pub current_rps: f64,
    pub queue_depth: u64,
    pub total_batches: u64,
    pub avg_batch_size: f64,
    pub batch_threshold: usize,
    pub batch_progress: u64,
    pub batch_progress_percent: f64,
    pub timestamp: DateTime<Utc>,
}

impl StatsSnapshot {
    /// Safe defaults sent when the metrics store cannot be read.
    fn zeroed(batch_threshold: usize) -> Self {
        Self {
            total_messages: 0,
            current_rps: 0.0,
            queue_depth: 0,
            total_batches: 0,
            avg_batch_size: 0.0,
            batch_threshold,
            batch_progress: 0,
            batch_progress_percent: 0.0,
            timestamp: Utc::now(),
        }
    }
}

/// Frames pushed to observers, discriminated by a `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    StatsUpdate(StatsSnapshot),
    BatchPersisted {
        batch_id: String,
        ids: Vec<String>,
        batch_size: usize,
        worker_timestamp: DateTime<Utc>,
    },
}

impl Frame {
    fn from_event(event: PersistenceEvent) -> Self {
        Frame::BatchPersisted {
            batch_id: event.batch_id,
            ids: event.ids,
            batch_size: event.batch_size,
            worker_timestamp: event.timestamp,
        }
    }
}

/// Reads the shared counters and assembles one stats snapshot.
///
/// Missing keys read as zero; `queue_depth` combines the buffer list with the
/// coordinator's staged messages so enqueued-but-unpersisted work is visible
/// end to end.
pub async fn collect_snapshot(
    store: &dyn MetricsStore,
    batch_threshold: usize,
) -> Result<StatsSnapshot, StoreError> {
    let total_messages = store.counter(TOTAL_MESSAGES_KEY).await?;
    let total_batches = store.counter(TOTAL_BATCHES_KEY).await?;
    let current_rps = store.gauge(CURRENT_RPS_KEY).await?.unwrap_or(0.0);
    let worker_buffer_size = store.counter(WORKER_BUFFER_SIZE_KEY).await?;
    let buffer_length = store.pending_len().await?;

    let queue_depth = buffer_length + worker_buffer_size;
    let avg_batch_size = total_messages as f64 / total_batches.max(1) as f64;
    let batch_progress = worker_buffer_size;
    let batch_progress_percent = if batch_threshold > 0 {
        100.0 * batch_progress as f64 / batch_threshold as f64
    } else {
        0.0
    };

    Ok(StatsSnapshot {
        total_messages,
        current_rps,
        queue_depth,
        total_batches,
        avg_batch_size,
        batch_threshold,
        batch_progress,
        batch_progress_percent,
        timestamp: Utc::now(),
    })
}

/// Drives one observer session until disconnect, write stall, or lag.
pub async fn run_session(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();

    // Subscribe before any frame goes out.
    let mut events = state.store.subscribe();

    let mut ticker = tokio::time::interval(state.config.broadcast_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let batch_threshold = state.config.batch_size;
    info!("Stats observer connected");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let snapshot = collect_snapshot(state.store.as_ref(), batch_threshold)
                    .await
                    .unwrap_or_else(|err| {
                        debug!(error = %err, "Failed to read stats; sending defaults");
                        StatsSnapshot::zeroed(batch_threshold)
                    });
                if send_frame(&mut sender, &Frame::StatsUpdate(snapshot)).await.is_err() {
                    break;
                }
            }
            event = events.recv() => match event {
                Ok(event) => {
                    // Forwarded promptly and never coalesced with stats
                    // frames; observers correlate on the carried ids.
                    let frame = Frame::from_event(event);
                    if send_frame(&mut sender, &frame).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Observer fell behind the event stream; terminating session");
                    break;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = next_incoming(&mut receiver) => match incoming {
                Incoming::Closed => {
                    info!("Stats observer disconnected");
                    break;
                }
                Incoming::Other => {}
            },
        }
    }

    // Dropping the receiver cancels the subscription; the timer dies with
    // the session future.
}

enum Incoming {
    Closed,
    Other,
}

async fn next_incoming(receiver: &mut SplitStream<WebSocket>) -> Incoming {
    match receiver.next().await {
        Some(Ok(Message::Close(_))) | None => Incoming::Closed,
        Some(Ok(_)) => Incoming::Other,
        Some(Err(err)) => {
            debug!(error = %err, "Observer read failed");
            Incoming::Closed
        }
    }
}

struct SessionClosed;

async fn send_frame(
    sender: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> Result<(), SessionClosed> {
    let payload = match serde_json::to_string(frame) {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "Failed to encode frame");
            return Ok(());
        }
    };

    match tokio::time::timeout(WRITE_DEADLINE, sender.send(Message::Text(payload.into()))).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => {
            debug!(error = %err, "Observer write failed");
            Err(SessionClosed)
        }
        Err(_) => {
            warn!("Observer write stalled beyond deadline; terminating session");
            Err(SessionClosed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{BATCH_START_TIME_KEY, InMemoryStore};

    #[tokio::test]
    async fn snapshot_combines_buffer_and_staging_depth() {
        let store = InMemoryStore::new();
        store.push_pending("a").await.unwrap();
        store.push_pending("b").await.unwrap();
        store.set_counter(WORKER_BUFFER_SIZE_KEY, 3).await.unwrap();
        store.set_counter(TOTAL_MESSAGES_KEY, 100).await.unwrap();
        store.set_counter(TOTAL_BATCHES_KEY, 2).await.unwrap();
        store.set_gauge(CURRENT_RPS_KEY, 12.5).await.unwrap();

        let snapshot = collect_snapshot(&store, 50).await.unwrap();

        assert_eq!(snapshot.queue_depth, 5);
        assert_eq!(snapshot.total_messages, 100);
        assert_eq!(snapshot.total_batches, 2);
        assert!((snapshot.avg_batch_size - 50.0).abs() < 1e-9);
        assert!((snapshot.current_rps - 12.5).abs() < 1e-9);
        assert_eq!(snapshot.batch_progress, 3);
        assert!((snapshot.batch_progress_percent - 6.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn snapshot_treats_missing_keys_as_zero() {
        let store = InMemoryStore::new();

        let snapshot = collect_snapshot(&store, 50).await.unwrap();

        assert_eq!(snapshot.total_messages, 0);
        assert_eq!(snapshot.total_batches, 0);
        assert_eq!(snapshot.queue_depth, 0);
        assert!((snapshot.current_rps - 0.0).abs() < 1e-9);
        // Division guards: no batches yet still yields a finite average.
        assert!((snapshot.avg_batch_size - 0.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn snapshot_ignores_batch_start_time_gauge() {
        let store = InMemoryStore::new();
        store.set_gauge(BATCH_START_TIME_KEY, 1_700_000_000.0).await.unwrap();

        // The start-time gauge feeds /queue/status, not the stats frame.
        let snapshot = collect_snapshot(&store, 50).await.unwrap();
        assert_eq!(snapshot.queue_depth, 0);
    }

    #[test]
    fn stats_frame_is_tagged_and_flat() {
        let frame = Frame::StatsUpdate(StatsSnapshot {
            total_messages: 10,
            current_rps: 1.5,
            queue_depth: 2,
            total_batches: 1,
            avg_batch_size: 10.0,
            batch_threshold: 50,
            batch_progress: 2,
            batch_progress_percent: 4.0,
            timestamp: Utc::now(),
        });

        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value.get("type").unwrap(), "stats_update");
        assert_eq!(value.get("total_messages").unwrap(), 10);
        assert_eq!(value.get("batch_threshold").unwrap(), 50);
        assert!(value.get("timestamp").unwrap().is_string());
    }

    #[test]
    fn persistence_event_maps_onto_batch_persisted_frame() {
        let event = PersistenceEvent {
            batch_id: "beef1234".to_string(),
            ids: vec!["aaaa1111".to_string(), "bbbb2222".to_string()],
            batch_size: 2,
            timestamp: Utc::now(),
        };

        let frame = Frame::from_event(event.clone());
        let value: serde_json::Value = serde_json::to_value(&frame).unwrap();

        assert_eq!(value.get("type").unwrap(), "batch_persisted");
        assert_eq!(value.get("batch_id").unwrap(), "beef1234");
        assert_eq!(value.get("batch_size").unwrap(), 2);
        assert_eq!(
            value.get("ids").unwrap().as_array().unwrap().len(),
            event.ids.len()
        );
        assert!(value.get("worker_timestamp").unwrap().is_string());
    }
}
