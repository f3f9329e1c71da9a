//! Metrics store handle: the shared pending buffer, scalar counters, and the
//! batch notification pub/sub channel.
//!
//! The store is process-external state shared by the ingestion endpoint
//! (writer of the pending list), the batch coordinator (consumer of the list,
//! writer of counters, publisher of events), and the telemetry broadcaster
//! (reader of counters, subscriber of events). Components hold it as a
//! [`MetricsStore`] trait object so tests can substitute [`InMemoryStore`].

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use thiserror::Error;
use tokio::sync::{broadcast, Notify};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::records::PersistenceEvent;

/// List key holding enqueued-but-not-yet-staged message records.
pub const PENDING_LIST_KEY: &str = "pending_messages";
/// Lifetime count of committed messages.
pub const TOTAL_MESSAGES_KEY: &str = "total_messages";
/// Lifetime count of committed batches.
pub const TOTAL_BATCHES_KEY: &str = "total_batches";
/// Rolling throughput estimate written by the coordinator.
pub const CURRENT_RPS_KEY: &str = "current_rps";
/// Size of the coordinator's in-process staging area.
pub const WORKER_BUFFER_SIZE_KEY: &str = "worker_buffer_size";
/// Epoch instant of the first message in the current staging area; absent
/// when staging is empty.
pub const BATCH_START_TIME_KEY: &str = "batch_start_time";
/// Pub/sub channel carrying persistence events.
pub const BATCH_CHANNEL: &str = "batch_notifications";

/// Errors from the metrics store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("buffer connection failed: {0}")]
    Connection(#[from] redis::RedisError),
    #[error("failed to encode buffer record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("buffer unavailable: {0}")]
    Unavailable(String),
}

/// Handle to the external key/value service backing the pipeline.
#[async_trait]
pub trait MetricsStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Appends an encoded record to the pending buffer (producer side).
    async fn push_pending(&self, record: &str) -> Result<(), StoreError>;

    /// Re-appends a record at the consuming end of the buffer so it is the
    /// next one popped. Used when a failed batch is returned to the buffer.
    async fn push_pending_front(&self, record: &str) -> Result<(), StoreError>;

    /// Blocking pop of the oldest pending record; `None` on timeout.
    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, StoreError>;

    async fn pending_len(&self) -> Result<u64, StoreError>;

    /// Deletes the pending list, returning how many entries were dropped.
    async fn drain_pending(&self) -> Result<u64, StoreError>;

    /// Reads an integer counter; a missing key reads as zero.
    async fn counter(&self, key: &str) -> Result<u64, StoreError>;

    async fn set_counter(&self, key: &str, value: u64) -> Result<(), StoreError>;

    async fn incr_counter(&self, key: &str, by: u64) -> Result<(), StoreError>;

    /// Initializes a counter to zero only when the key is absent.
    async fn init_counter(&self, key: &str) -> Result<(), StoreError>;

    /// Reads a float gauge; `None` when the key is absent.
    async fn gauge(&self, key: &str) -> Result<Option<f64>, StoreError>;

    async fn set_gauge(&self, key: &str, value: f64) -> Result<(), StoreError>;

    async fn clear_gauge(&self, key: &str) -> Result<(), StoreError>;

    /// Publishes a persistence event on the batch notification channel.
    async fn publish(&self, event: &PersistenceEvent) -> Result<(), StoreError>;

    /// Subscribes to persistence events published after this call. Late
    /// subscribers do not receive historical events.
    fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent>;
}

/// Redis-backed metrics store.
///
/// Commands go through a multiplexed [`ConnectionManager`]; the pub/sub
/// channel requires a dedicated connection, which a background task owns and
/// bridges into a process-local broadcast channel so every observer session
/// gets its own receiver.
pub struct RedisStore {
    manager: ConnectionManager,
    events: broadcast::Sender<PersistenceEvent>,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        let (events, _) = broadcast::channel(256);

        tokio::spawn(Self::pump_events(client, events.clone()));

        info!("Connected to metrics store");
        Ok(Self { manager, events })
    }

    /// Resident task: keep a pub/sub subscription alive and fan incoming
    /// batch notifications into the broadcast channel.
    async fn pump_events(client: redis::Client, events: broadcast::Sender<PersistenceEvent>) {
        loop {
            match client.get_async_pubsub().await {
                Ok(mut pubsub) => match pubsub.subscribe(BATCH_CHANNEL).await {
                    Ok(()) => {
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = stream.next().await {
                            let payload: String = match msg.get_payload() {
                                Ok(payload) => payload,
                                Err(err) => {
                                    warn!(error = %err, "failed to read batch notification payload");
                                    continue;
                                }
                            };
                            match serde_json::from_str::<PersistenceEvent>(&payload) {
                                Ok(event) => {
                                    // send only fails when no session is
                                    // subscribed, which is fine.
                                    let _ = events.send(event);
                                }
                                Err(err) => {
                                    warn!(error = %err, "discarding malformed batch notification");
                                }
                            }
                        }
                        warn!("batch notification subscription ended; reconnecting");
                    }
                    Err(err) => {
                        warn!(error = %err, "failed to subscribe to batch notifications");
                    }
                },
                Err(err) => {
                    warn!(error = %err, "failed to open pub/sub connection");
                }
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    fn conn(&self) -> ConnectionManager {
        self.manager.clone()
    }
}

#[async_trait]
impl MetricsStore for RedisStore {
    async fn ping(&self) -> Result<(), StoreError> {
        let _: String = redis::cmd("PING").query_async(&mut self.conn()).await?;
        Ok(())
    }

    async fn push_pending(&self, record: &str) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("LPUSH")
            .arg(PENDING_LIST_KEY)
            .arg(record)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn push_pending_front(&self, record: &str) -> Result<(), StoreError> {
        // BRPOP consumes from the tail, so the tail is the head of the queue.
        let _: i64 = redis::cmd("RPUSH")
            .arg(PENDING_LIST_KEY)
            .arg(record)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let timeout_secs = timeout.as_secs_f64().max(0.1);
        let popped: Option<(String, String)> = redis::cmd("BRPOP")
            .arg(PENDING_LIST_KEY)
            .arg(timeout_secs)
            .query_async(&mut self.conn())
            .await?;
        Ok(popped.map(|(_, record)| record))
    }

    async fn pending_len(&self) -> Result<u64, StoreError> {
        let len: u64 = redis::cmd("LLEN")
            .arg(PENDING_LIST_KEY)
            .query_async(&mut self.conn())
            .await?;
        Ok(len)
    }

    async fn drain_pending(&self) -> Result<u64, StoreError> {
        let mut conn = self.conn();
        let len: u64 = redis::cmd("LLEN")
            .arg(PENDING_LIST_KEY)
            .query_async(&mut conn)
            .await?;
        let _: i64 = redis::cmd("DEL")
            .arg(PENDING_LIST_KEY)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn counter(&self, key: &str) -> Result<u64, StoreError> {
        let value: Option<u64> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(value.unwrap_or(0))
    }

    async fn set_counter(&self, key: &str, value: u64) -> Result<(), StoreError> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn incr_counter(&self, key: &str, by: u64) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("INCRBY")
            .arg(key)
            .arg(by)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn init_counter(&self, key: &str) -> Result<(), StoreError> {
        let _: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(0)
            .arg("NX")
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn gauge(&self, key: &str) -> Result<Option<f64>, StoreError> {
        let raw: Option<String> = redis::cmd("GET")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(raw.and_then(|v| v.parse().ok()))
    }

    async fn set_gauge(&self, key: &str, value: f64) -> Result<(), StoreError> {
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn clear_gauge(&self, key: &str) -> Result<(), StoreError> {
        let _: i64 = redis::cmd("DEL")
            .arg(key)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    async fn publish(&self, event: &PersistenceEvent) -> Result<(), StoreError> {
        let payload = serde_json::to_string(event)?;
        let _: i64 = redis::cmd("PUBLISH")
            .arg(BATCH_CHANNEL)
            .arg(payload)
            .query_async(&mut self.conn())
            .await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.events.subscribe()
    }
}

/// In-process metrics store used by tests.
///
/// Mirrors the Redis contract: FIFO list with blocking pop, string-encoded
/// scalars, broadcast-based pub/sub without history.
pub struct InMemoryStore {
    inner: Mutex<InMemoryState>,
    arrival: Notify,
    offline: AtomicBool,
    events: broadcast::Sender<PersistenceEvent>,
}

#[derive(Default)]
struct InMemoryState {
    pending: VecDeque<String>,
    values: HashMap<String, String>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Mutex::new(InMemoryState::default()),
            arrival: Notify::new(),
            offline: AtomicBool::new(false),
            events,
        }
    }

    /// Makes every subsequent operation fail, simulating a buffer outage.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store offline".to_string()));
        }
        Ok(())
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsStore for InMemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    async fn push_pending(&self, record: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner
            .lock()
            .unwrap()
            .pending
            .push_back(record.to_string());
        self.arrival.notify_one();
        Ok(())
    }

    async fn push_pending_front(&self, record: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner
            .lock()
            .unwrap()
            .pending
            .push_front(record.to_string());
        self.arrival.notify_one();
        Ok(())
    }

    async fn pop_pending(&self, timeout: Duration) -> Result<Option<String>, StoreError> {
        let deadline = Instant::now() + timeout;
        loop {
            self.check_online()?;
            if let Some(record) = self.inner.lock().unwrap().pending.pop_front() {
                return Ok(Some(record));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, self.arrival.notified()).await;
        }
    }

    async fn pending_len(&self) -> Result<u64, StoreError> {
        self.check_online()?;
        Ok(self.inner.lock().unwrap().pending.len() as u64)
    }

    async fn drain_pending(&self) -> Result<u64, StoreError> {
        self.check_online()?;
        let mut state = self.inner.lock().unwrap();
        let len = state.pending.len() as u64;
        state.pending.clear();
        Ok(len)
    }

    async fn counter(&self, key: &str) -> Result<u64, StoreError> {
        self.check_online()?;
        let state = self.inner.lock().unwrap();
        Ok(state
            .values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0))
    }

    async fn set_counter(&self, key: &str, value: u64) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner
            .lock()
            .unwrap()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn incr_counter(&self, key: &str, by: u64) -> Result<(), StoreError> {
        self.check_online()?;
        let mut state = self.inner.lock().unwrap();
        let current: u64 = state
            .values
            .get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        state
            .values
            .insert(key.to_string(), (current + by).to_string());
        Ok(())
    }

    async fn init_counter(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner
            .lock()
            .unwrap()
            .values
            .entry(key.to_string())
            .or_insert_with(|| "0".to_string());
        Ok(())
    }

    async fn gauge(&self, key: &str) -> Result<Option<f64>, StoreError> {
        self.check_online()?;
        let state = self.inner.lock().unwrap();
        Ok(state.values.get(key).and_then(|v| v.parse().ok()))
    }

    async fn set_gauge(&self, key: &str, value: f64) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner
            .lock()
            .unwrap()
            .values
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn clear_gauge(&self, key: &str) -> Result<(), StoreError> {
        self.check_online()?;
        self.inner.lock().unwrap().values.remove(key);
        Ok(())
    }

    async fn publish(&self, event: &PersistenceEvent) -> Result<(), StoreError> {
        self.check_online()?;
        let _ = self.events.send(event.clone());
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<PersistenceEvent> {
        self.events.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::new_batch_id;
    use chrono::Utc;

    #[tokio::test]
    async fn pending_list_is_fifo() {
        let store = InMemoryStore::new();
        store.push_pending("one").await.unwrap();
        store.push_pending("two").await.unwrap();

        let first = store
            .pop_pending(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "one");
        assert_eq!(store.pending_len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn push_front_is_popped_next() {
        let store = InMemoryStore::new();
        store.push_pending("queued").await.unwrap();
        store.push_pending_front("requeued").await.unwrap();

        let first = store
            .pop_pending(Duration::from_millis(10))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first, "requeued");
    }

    #[tokio::test]
    async fn pop_times_out_on_empty_buffer() {
        let store = InMemoryStore::new();
        let popped = store.pop_pending(Duration::from_millis(20)).await.unwrap();
        assert!(popped.is_none());
    }

    #[tokio::test]
    async fn pop_wakes_on_arrival() {
        let store = std::sync::Arc::new(InMemoryStore::new());
        let consumer = store.clone();
        let handle = tokio::spawn(async move {
            consumer.pop_pending(Duration::from_secs(5)).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        store.push_pending("late").await.unwrap();

        assert_eq!(handle.await.unwrap().as_deref(), Some("late"));
    }

    #[tokio::test]
    async fn counters_default_to_zero_and_accumulate() {
        let store = InMemoryStore::new();
        assert_eq!(store.counter(TOTAL_MESSAGES_KEY).await.unwrap(), 0);

        store.incr_counter(TOTAL_MESSAGES_KEY, 50).await.unwrap();
        store.incr_counter(TOTAL_MESSAGES_KEY, 3).await.unwrap();
        assert_eq!(store.counter(TOTAL_MESSAGES_KEY).await.unwrap(), 53);
    }

    #[tokio::test]
    async fn init_counter_does_not_clobber_existing_value() {
        let store = InMemoryStore::new();
        store.set_counter(TOTAL_BATCHES_KEY, 9).await.unwrap();
        store.init_counter(TOTAL_BATCHES_KEY).await.unwrap();
        assert_eq!(store.counter(TOTAL_BATCHES_KEY).await.unwrap(), 9);
    }

    #[tokio::test]
    async fn gauge_is_absent_after_clear() {
        let store = InMemoryStore::new();
        store.set_gauge(BATCH_START_TIME_KEY, 1234.5).await.unwrap();
        assert_eq!(store.gauge(BATCH_START_TIME_KEY).await.unwrap(), Some(1234.5));

        store.clear_gauge(BATCH_START_TIME_KEY).await.unwrap();
        assert_eq!(store.gauge(BATCH_START_TIME_KEY).await.unwrap(), None);
    }

    #[tokio::test]
    async fn publish_reaches_existing_subscribers_only() {
        let store = InMemoryStore::new();
        let mut early = store.subscribe();

        let event = PersistenceEvent {
            batch_id: new_batch_id(),
            ids: vec!["abc12345".to_string()],
            batch_size: 1,
            timestamp: Utc::now(),
        };
        store.publish(&event).await.unwrap();

        let received = early.recv().await.unwrap();
        assert_eq!(received.batch_id, event.batch_id);

        // A subscription opened after the publish sees nothing.
        let mut late = store.subscribe();
        assert!(matches!(
            late.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn offline_store_rejects_operations() {
        let store = InMemoryStore::new();
        store.set_offline(true);
        assert!(matches!(
            store.push_pending("x").await,
            Err(StoreError::Unavailable(_))
        ));
        assert!(store.ping().await.is_err());
    }
}
