//! # Batch Coordinator
//!
//! Resident consumer of the pending buffer. Messages are staged in memory and
//! flushed under a dual-trigger policy: either the staging area reaches the
//! batch size, or the oldest staged message reaches the batch timeout. Each
//! flush commits the whole batch in one transaction, updates the shared
//! counters, and publishes a persistence event on the notification channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use metrics::{counter, gauge, histogram};
use sea_orm::DatabaseConnection;
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::buffer::{
    BATCH_START_TIME_KEY, CURRENT_RPS_KEY, MetricsStore, StoreError, TOTAL_BATCHES_KEY,
    TOTAL_MESSAGES_KEY, WORKER_BUFFER_SIZE_KEY,
};
use crate::config::AppConfig;
use crate::error::PipelineError;
use crate::records::{PersistenceEvent, QueuedMessage, new_batch_id};
use crate::repositories::MessageRepository;

/// Upper bound on a single blocking pop so the loop re-evaluates the flush
/// condition at least once per second even under a steady message stream.
const MAX_POP_TIMEOUT: Duration = Duration::from_secs(1);

/// Backoff before the single commit retry.
const COMMIT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Sliding-window throughput estimator with O(1) state.
///
/// Committed message counts accumulate against a window-start instant; once
/// the window has elapsed the rate is computed and the state reset.
/// Intermediate reads report `count / elapsed` without resetting.
#[derive(Debug)]
pub struct RpsEstimator {
    window: Duration,
    count: u64,
    window_start: Instant,
}

impl RpsEstimator {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            count: 0,
            window_start: now,
        }
    }

    /// Adds `n` committed messages and returns the current estimate.
    pub fn record(&mut self, n: u64, now: Instant) -> f64 {
        self.count += n;
        let elapsed = now.duration_since(self.window_start);

        if elapsed >= self.window {
            let rate = self.count as f64 / elapsed.as_secs_f64();
            self.count = 0;
            self.window_start = now;
            rate
        } else {
            self.count as f64 / elapsed.as_secs_f64().max(0.1)
        }
    }
}

/// Background batch coordinator service.
pub struct BatchCoordinator {
    config: Arc<AppConfig>,
    db: Arc<DatabaseConnection>,
    store: Arc<dyn MetricsStore>,
    staging: Vec<QueuedMessage>,
    batch_started: Option<Instant>,
    rps: RpsEstimator,
}

impl BatchCoordinator {
    /// Create a new coordinator instance.
    pub fn new(
        config: Arc<AppConfig>,
        db: Arc<DatabaseConnection>,
        store: Arc<dyn MetricsStore>,
    ) -> Self {
        let rps = RpsEstimator::new(config.rps_window(), Instant::now());
        Self {
            config,
            db,
            store,
            staging: Vec::new(),
            batch_started: None,
            rps,
        }
    }

    /// Run the coordinator loop until the provided shutdown token fires.
    ///
    /// A non-empty staging area is flushed once more on the way out so that
    /// an orderly shutdown does not widen the durability boundary.
    #[instrument(skip_all)]
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), PipelineError> {
        info!(
            batch_size = self.config.batch_size,
            batch_timeout_secs = self.config.batch_timeout,
            "Starting batch coordinator"
        );

        self.init_counters().await?;

        loop {
            let pop_timeout = self.pop_timeout();

            let popped = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Batch coordinator shutdown requested");
                    break;
                }
                result = self.store.pop_pending(pop_timeout) => result,
            };

            match popped {
                Ok(Some(raw)) => {
                    if let Err(err) = self.stage(raw).await {
                        warn!(error = %err, "Failed to update staging visibility counters");
                    }
                }
                Ok(None) => {
                    // Pop timeout; fall through to serve the time trigger.
                }
                Err(err) => {
                    warn!(error = %err, "Buffer pop failed");
                    sleep(Duration::from_secs(1)).await;
                    continue;
                }
            }

            if self.should_flush() {
                if let Err(err) = self.flush().await {
                    error!(error = ?err, "Flush failed; batch returned to the buffer");
                }
            }
        }

        if !self.staging.is_empty() {
            info!(
                staged = self.staging.len(),
                "Flushing staged messages before shutdown"
            );
            if let Err(err) = self.flush().await {
                error!(error = ?err, "Final flush failed");
            }
        }

        info!("Batch coordinator stopped");
        Ok(())
    }

    async fn init_counters(&self) -> Result<(), StoreError> {
        self.store.init_counter(TOTAL_MESSAGES_KEY).await?;
        self.store.init_counter(TOTAL_BATCHES_KEY).await?;
        self.store.init_counter(CURRENT_RPS_KEY).await?;
        // Staging is empty at startup; make that observable immediately.
        self.store.set_counter(WORKER_BUFFER_SIZE_KEY, 0).await?;
        self.store.clear_gauge(BATCH_START_TIME_KEY).await?;
        Ok(())
    }

    /// Time budget for the next blocking pop, kept strictly inside the
    /// remaining time-trigger window so the trigger fires even when no
    /// further messages arrive.
    fn pop_timeout(&self) -> Duration {
        match self.batch_started {
            Some(started) => {
                let deadline = started + self.config.batch_timeout_duration();
                deadline
                    .saturating_duration_since(Instant::now())
                    .min(MAX_POP_TIMEOUT)
            }
            None => MAX_POP_TIMEOUT,
        }
    }

    /// Decodes a popped record into the staging area and refreshes the
    /// visibility counters. Malformed entries are discarded and do not touch
    /// the batch timer.
    async fn stage(&mut self, raw: String) -> Result<(), StoreError> {
        let message = match QueuedMessage::decode(&raw) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "Discarding malformed buffer entry");
                counter!("coordinator_malformed_entries_total").increment(1);
                return Ok(());
            }
        };

        if self.staging.is_empty() {
            // The timer anchors on the first message of the batch; later
            // arrivals never advance it.
            self.batch_started = Some(Instant::now());
            self.store
                .set_gauge(BATCH_START_TIME_KEY, epoch_seconds_now())
                .await?;
            debug!("New batch started");
        }

        debug!(
            tracking_id = %message.tracking_id,
            staged = self.staging.len() + 1,
            threshold = self.config.batch_size,
            "Message staged"
        );

        self.staging.push(message);
        gauge!("coordinator_staging_depth").set(self.staging.len() as f64);
        self.store
            .set_counter(WORKER_BUFFER_SIZE_KEY, self.staging.len() as u64)
            .await?;

        Ok(())
    }

    /// Flush when the staging area reaches the batch size, or when the
    /// oldest staged message reaches the batch timeout, whichever comes
    /// first.
    fn should_flush(&self) -> bool {
        if self.staging.len() >= self.config.batch_size {
            info!(
                staged = self.staging.len(),
                threshold = self.config.batch_size,
                "Flush triggered: batch size reached"
            );
            return true;
        }

        if let Some(started) = self.batch_started {
            if !self.staging.is_empty() {
                let age = started.elapsed();
                if age >= self.config.batch_timeout_duration() {
                    info!(
                        age_secs = age.as_secs_f64(),
                        timeout_secs = self.config.batch_timeout,
                        "Flush triggered: batch timeout reached"
                    );
                    return true;
                }
            }
        }

        false
    }

    #[instrument(skip_all, fields(batch_size = self.staging.len()))]
    async fn flush(&mut self) -> Result<(), PipelineError> {
        if self.staging.is_empty() {
            return Ok(());
        }

        let batch: Vec<QueuedMessage> = std::mem::take(&mut self.staging);
        self.batch_started = None;

        // Visibility counters reflect the empty staging area before the
        // commit; in-flight work becomes observable again through either the
        // persistence event or the re-queue.
        if let Err(err) = self.store.set_counter(WORKER_BUFFER_SIZE_KEY, 0).await {
            warn!(error = %err, "Failed to reset staging visibility counter");
        }
        if let Err(err) = self.store.clear_gauge(BATCH_START_TIME_KEY).await {
            warn!(error = %err, "Failed to clear batch start time");
        }
        gauge!("coordinator_staging_depth").set(0.0);

        let started = Instant::now();
        let repository = MessageRepository::new(self.db.as_ref());

        let mut committed = repository.insert_batch(&batch).await;
        if let Err(err) = &committed {
            warn!(error = %err, "Bulk insert failed; retrying once");
            counter!("coordinator_commit_retries_total").increment(1);
            sleep(COMMIT_RETRY_DELAY).await;
            committed = repository.insert_batch(&batch).await;
        }

        match committed {
            Ok(()) => {
                let elapsed = started.elapsed();
                histogram!("coordinator_flush_duration_ms")
                    .record(elapsed.as_secs_f64() * 1_000.0);
                self.after_commit(batch, elapsed).await;
                Ok(())
            }
            Err(err) => {
                counter!("coordinator_commit_failures_total").increment(1);
                self.requeue(batch).await;
                Err(PipelineError::CommitFailed(err))
            }
        }
    }

    /// Post-commit bookkeeping: counters, throughput estimate, and the
    /// persistence event. The commit has already happened, so failures here
    /// are logged and absorbed.
    async fn after_commit(&mut self, batch: Vec<QueuedMessage>, elapsed: Duration) {
        let batch_size = batch.len();
        let ids: Vec<String> = batch
            .into_iter()
            .map(|message| message.tracking_id)
            .collect();

        if let Err(err) = self
            .store
            .incr_counter(TOTAL_MESSAGES_KEY, batch_size as u64)
            .await
        {
            warn!(error = %err, "Failed to increment total_messages");
        }
        if let Err(err) = self.store.incr_counter(TOTAL_BATCHES_KEY, 1).await {
            warn!(error = %err, "Failed to increment total_batches");
        }

        let rate = self.rps.record(batch_size as u64, Instant::now());
        if let Err(err) = self.store.set_gauge(CURRENT_RPS_KEY, rate).await {
            warn!(error = %err, "Failed to update current_rps");
        }

        let event = PersistenceEvent {
            batch_id: new_batch_id(),
            ids,
            batch_size,
            timestamp: Utc::now(),
        };

        match self.store.publish(&event).await {
            Ok(()) => info!(
                batch_id = %event.batch_id,
                batch_size,
                elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                rps = rate,
                "Batch committed and published"
            ),
            // Subscribers reconcile missed events through the read path.
            Err(err) => warn!(
                error = %err,
                batch_id = %event.batch_id,
                "Failed to publish persistence event"
            ),
        }

        counter!("coordinator_messages_committed_total").increment(batch_size as u64);
        counter!("coordinator_batches_committed_total").increment(1);
    }

    /// Returns a failed batch to the consuming end of the buffer, oldest
    /// last, so pop order is preserved. A message that cannot be returned is
    /// dropped; that is the documented at-least-once boundary.
    async fn requeue(&self, batch: Vec<QueuedMessage>) {
        let total = batch.len();
        let mut returned = 0usize;

        for message in batch.iter().rev() {
            let encoded = match message.encode() {
                Ok(encoded) => encoded,
                Err(err) => {
                    error!(
                        error = %err,
                        tracking_id = %message.tracking_id,
                        "Failed to re-encode message for re-queue; dropping"
                    );
                    counter!("coordinator_messages_dropped_total").increment(1);
                    continue;
                }
            };

            match self.store.push_pending_front(&encoded).await {
                Ok(()) => returned += 1,
                Err(err) => {
                    error!(
                        error = %err,
                        tracking_id = %message.tracking_id,
                        "Failed to return message to the buffer; dropping"
                    );
                    counter!("coordinator_messages_dropped_total").increment(1);
                }
            }
        }

        warn!(returned, total, "Batch returned to the buffer after failed commit");
    }
}

/// Wall-clock epoch in fractional seconds, as stored in the start-time gauge.
fn epoch_seconds_now() -> f64 {
    Utc::now().timestamp_millis() as f64 / 1_000.0
}
