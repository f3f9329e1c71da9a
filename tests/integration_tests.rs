//! Integration tests for the ingestion HTTP surface and the stats stream.
//!
//! Each test boots the router (and, where the scenario needs persistence, the
//! batch coordinator) against an in-memory metrics store and an in-memory
//! SQLite database, then drives it over real sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use ingestor::buffer::{InMemoryStore, MetricsStore};
use ingestor::config::AppConfig;
use ingestor::server::{AppState, create_app};
use ingestor::worker::BatchCoordinator;
use migration::{Migrator, MigratorTrait};
use reqwest::Client;
use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Pipeline {
    addr: SocketAddr,
    store: Arc<InMemoryStore>,
    shutdown: CancellationToken,
}

impl Pipeline {
    fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    fn ws(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }
}

async fn test_db() -> DatabaseConnection {
    // A single connection keeps every query on the same in-memory database.
    let mut options = ConnectOptions::new("sqlite::memory:");
    options.max_connections(1);
    let db = Database::connect(options).await.expect("connect sqlite");
    Migrator::up(&db, None).await.expect("apply migrations");
    db
}

/// Boots the router and, when `with_worker` is set, the batch coordinator.
async fn start_pipeline(config: AppConfig, with_worker: bool) -> Pipeline {
    let db = test_db().await;
    let store = Arc::new(InMemoryStore::new());

    let state = AppState {
        config: Arc::new(config.clone()),
        db: db.clone(),
        store: store.clone(),
    };
    let app = create_app(state);

    let listener = TcpListener::bind(SocketAddr::from(([127, 0, 0, 1], 0)))
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });

    let shutdown = CancellationToken::new();
    if with_worker {
        let coordinator = BatchCoordinator::new(
            Arc::new(config),
            Arc::new(db.clone()),
            store.clone() as Arc<dyn MetricsStore>,
        );
        tokio::spawn(coordinator.run(shutdown.clone()));
    }

    // Give the listener and worker a moment to start
    tokio::time::sleep(Duration::from_millis(100)).await;

    Pipeline {
        addr,
        store,
        shutdown,
    }
}

/// Reads frames until one of the requested type arrives.
async fn next_frame_of_type(ws: &mut WsStream, frame_type: &str, deadline: Duration) -> Value {
    tokio::time::timeout(deadline, async {
        loop {
            let msg = ws
                .next()
                .await
                .expect("stream open")
                .expect("well-formed frame");
            if let WsMessage::Text(text) = msg {
                let value: Value = serde_json::from_str(text.as_str()).expect("json frame");
                if value.get("type").map(|t| t == frame_type).unwrap_or(false) {
                    return value;
                }
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} frame before deadline", frame_type))
}

#[tokio::test]
async fn root_endpoint_reports_service_and_batch_config() {
    let pipeline = start_pipeline(AppConfig::default(), false).await;
    let client = Client::new();

    let response = client
        .get(pipeline.http("/"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body.get("service").unwrap(), "ingestor");
    assert_eq!(body.get("batch_size").unwrap(), 50);
}

#[tokio::test]
async fn openapi_document_is_served() {
    let pipeline = start_pipeline(AppConfig::default(), false).await;
    let client = Client::new();

    let response = client
        .get(pipeline.http("/openapi.json"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert!(body.get("openapi").is_some());
    assert_eq!(
        body.pointer("/info/title").unwrap().as_str().unwrap(),
        "Message Ingestor API"
    );
}

#[tokio::test]
async fn health_endpoint_reports_buffer_connectivity() {
    let pipeline = start_pipeline(AppConfig::default(), false).await;
    let client = Client::new();

    let response = client
        .get(pipeline.http("/health"))
        .send()
        .await
        .expect("request");

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body.get("status").unwrap(), "healthy");
    assert_eq!(body.get("buffer").unwrap(), "connected");
    assert_eq!(body.get("queue_length").unwrap(), 0);
}

#[tokio::test]
async fn malformed_enqueue_payload_is_rejected_with_400() {
    let pipeline = start_pipeline(AppConfig::default(), false).await;
    let client = Client::new();

    // Missing required fields trips the JSON extractor.
    let response = client
        .post(pipeline.http("/messages"))
        .json(&json!({ "user_id": 1 }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
    let body: Value = response.json().await.expect("json");
    assert_eq!(body.get("code").unwrap(), "INVALID_PAYLOAD");

    // Validation failures use the same taxonomy.
    let response = client
        .post(pipeline.http("/messages"))
        .json(&json!({ "user_id": 0, "channel_id": 1, "content": "hi" }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);

    let response = client
        .post(pipeline.http("/simulate"))
        .json(&json!({ "count": 0 }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn enqueue_is_observable_end_to_end_until_the_volume_trigger() {
    let config = AppConfig {
        batch_size: 3,
        batch_timeout: 30.0,
        broadcast_interval_ms: 100,
        ..Default::default()
    };
    let pipeline = start_pipeline(config, true).await;
    let client = Client::new();

    // Subscribe before producing so no event can be missed.
    let (mut ws, _) = tokio_tungstenite::connect_async(pipeline.ws("/ws/stats"))
        .await
        .expect("ws connect");

    let response = client
        .post(pipeline.http("/messages"))
        .json(&json!({ "user_id": 7, "channel_id": 3, "content": "hello" }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 202);
    let accepted: Value = response.json().await.expect("json");
    let tracking_id = accepted
        .get("tracking_id")
        .and_then(Value::as_str)
        .expect("tracking id")
        .to_string();
    assert!(accepted.get("queued_at").is_some());

    // The message is visible as buffer + staging depth while unpersisted.
    // Staging visibility is eventually consistent within one worker loop
    // iteration, so poll briefly.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        let status: Value = client
            .get(pipeline.http("/queue/status"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        let depth = status.get("buffer_length").unwrap().as_u64().unwrap()
            + status.get("worker_buffer_size").unwrap().as_u64().unwrap();
        if depth == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queue depth never reached 1"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    // A stats frame reflects the same depth.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let stats = next_frame_of_type(&mut ws, "stats_update", Duration::from_secs(5)).await;
        assert_eq!(stats.get("batch_threshold").unwrap(), 3);
        if stats.get("queue_depth").unwrap().as_u64().unwrap() == 1 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "stats never showed the enqueued message"
        );
    }

    // Two more messages complete the batch; the persistence event carries
    // the original tracking id.
    let simulated: Value = client
        .post(pipeline.http("/simulate"))
        .json(&json!({ "count": 2 }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(simulated.get("expected_complete_batches").unwrap(), 0);
    assert_eq!(simulated.get("expected_remaining_queued").unwrap(), 2);

    let persisted = next_frame_of_type(&mut ws, "batch_persisted", Duration::from_secs(5)).await;
    assert_eq!(persisted.get("batch_size").unwrap().as_u64().unwrap(), 3);
    let ids: Vec<&str> = persisted
        .get("ids")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert!(ids.contains(&tracking_id.as_str()));

    // The committed rows are readable, and the queue has drained.
    let rows: Value = client
        .get(pipeline.http("/messages?limit=10"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(rows.as_array().unwrap().len(), 3);

    let status: Value = client
        .get(pipeline.http("/queue/status"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(status.get("buffer_length").unwrap(), 0);
    assert_eq!(status.get("worker_buffer_size").unwrap(), 0);
    assert!(status.get("batch_start_time").unwrap().is_null());

    pipeline.shutdown.cancel();
}

#[tokio::test]
async fn time_trigger_flushes_a_burst_below_the_threshold() {
    let config = AppConfig {
        batch_size: 50,
        batch_timeout: 0.3,
        broadcast_interval_ms: 100,
        ..Default::default()
    };
    let pipeline = start_pipeline(config, true).await;
    let client = Client::new();

    let (mut ws, _) = tokio_tungstenite::connect_async(pipeline.ws("/ws/stats"))
        .await
        .expect("ws connect");

    let simulated: Value = client
        .post(pipeline.http("/simulate"))
        .json(&json!({ "count": 2 }))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    let expected: Vec<String> = simulated
        .get("tracking_ids")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(expected.len(), 2);

    let persisted = next_frame_of_type(&mut ws, "batch_persisted", Duration::from_secs(5)).await;
    assert_eq!(persisted.get("batch_size").unwrap().as_u64().unwrap(), 2);
    let ids: Vec<String> = persisted
        .get("ids")
        .unwrap()
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, expected);

    pipeline.shutdown.cancel();
}

#[tokio::test]
async fn reset_reports_deleted_rows_and_drained_entries() {
    let config = AppConfig {
        batch_size: 2,
        batch_timeout: 30.0,
        broadcast_interval_ms: 100,
        ..Default::default()
    };
    let pipeline = start_pipeline(config, true).await;
    let client = Client::new();

    // Two messages reach the volume trigger and flush immediately.
    let response = client
        .post(pipeline.http("/simulate"))
        .json(&json!({ "count": 2 }))
        .send()
        .await
        .expect("request");
    assert_eq!(response.status(), 202);

    // Wait until the batch lands.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let rows: Value = client
            .get(pipeline.http("/messages"))
            .send()
            .await
            .expect("request")
            .json()
            .await
            .expect("json");
        if rows.as_array().unwrap().len() == 2 {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "batch never persisted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Stop the worker, then strand two entries in the buffer.
    pipeline.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;
    pipeline.store.push_pending("stranded 1").await.unwrap();
    pipeline.store.push_pending("stranded 2").await.unwrap();

    let reset: Value = client
        .delete(pipeline.http("/reset"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(reset.get("deleted_messages").unwrap(), 2);
    assert_eq!(reset.get("cleared_queue").unwrap(), 2);

    let rows: Value = client
        .get(pipeline.http("/messages"))
        .send()
        .await
        .expect("request")
        .json()
        .await
        .expect("json");
    assert_eq!(rows.as_array().unwrap().len(), 0);

    // Lifetime counters survive the reset.
    use ingestor::buffer::TOTAL_MESSAGES_KEY;
    assert_eq!(pipeline.store.counter(TOTAL_MESSAGES_KEY).await.unwrap(), 2);
}
