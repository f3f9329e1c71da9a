//! Wire records shared by the ingestion endpoint, the pending buffer, the
//! batch coordinator, and the telemetry broadcaster.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A message as it travels through the pending buffer.
///
/// The record is self-describing JSON so the coordinator can recover every
/// field it needs for the bulk insert without consulting any other state. The
/// tracking id assigned here is the one correlation key between the producer's
/// enqueue response and later persistence events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub tracking_id: String,
    pub user_id: i32,
    pub channel_id: i32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl QueuedMessage {
    /// Builds a record with a fresh tracking id, stamping `created_at` when
    /// the producer did not supply one.
    pub fn new(
        user_id: i32,
        channel_id: i32,
        content: String,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            tracking_id: new_tracking_id(),
            user_id,
            channel_id,
            content,
            created_at: created_at.unwrap_or_else(Utc::now),
        }
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn decode(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }
}

/// Event published on the batch notification channel after a commit.
///
/// Ephemeral: late subscribers never see historical events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceEvent {
    pub batch_id: String,
    pub ids: Vec<String>,
    pub batch_size: usize,
    pub timestamp: DateTime<Utc>,
}

/// Short opaque identifier assigned at ingest and carried through buffer,
/// staging, and persistence events.
pub fn new_tracking_id() -> String {
    short_id()
}

/// Fresh identifier for a committed batch; never reused.
pub fn new_batch_id() -> String {
    short_id()
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queued_message_encodes_as_self_describing_json() {
        let msg = QueuedMessage::new(7, 3, "hello".to_string(), None);
        let raw = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();

        assert_eq!(value.get("user_id").unwrap(), 7);
        assert_eq!(value.get("channel_id").unwrap(), 3);
        assert_eq!(value.get("content").unwrap(), "hello");
        assert_eq!(
            value.get("tracking_id").unwrap().as_str().unwrap(),
            msg.tracking_id
        );
        assert!(value.get("created_at").unwrap().is_string());
    }

    #[test]
    fn decode_recovers_the_encoded_record() {
        let msg = QueuedMessage::new(1, 1, "payload".to_string(), None);
        let decoded = QueuedMessage::decode(&msg.encode().unwrap()).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_rejects_malformed_entries() {
        assert!(QueuedMessage::decode("{not json").is_err());
        assert!(QueuedMessage::decode(r#"{"tracking_id":"x"}"#).is_err());
    }

    #[test]
    fn created_at_is_preserved_when_supplied() {
        let stamp = DateTime::parse_from_rfc3339("2026-01-10T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let msg = QueuedMessage::new(1, 1, "stamped".to_string(), Some(stamp));
        assert_eq!(msg.created_at, stamp);
    }

    #[test]
    fn tracking_ids_are_short_and_distinct() {
        let a = new_tracking_id();
        let b = new_tracking_id();
        assert_eq!(a.len(), 8);
        assert_ne!(a, b);
    }

    #[test]
    fn persistence_event_round_trips_through_the_channel_encoding() {
        let event = PersistenceEvent {
            batch_id: new_batch_id(),
            ids: vec![new_tracking_id(), new_tracking_id()],
            batch_size: 2,
            timestamp: Utc::now(),
        };

        let raw = serde_json::to_string(&event).unwrap();
        let decoded: PersistenceEvent = serde_json::from_str(&raw).unwrap();
        assert_eq!(decoded, event);
    }
}
