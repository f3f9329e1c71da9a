//! # Server Configuration
//!
//! This module contains the server setup and configuration for the ingestion
//! API.

use std::sync::Arc;

use axum::{
    Router,
    routing::{delete, get, post},
};
use sea_orm::DatabaseConnection;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::buffer::MetricsStore;
use crate::config::AppConfig;
use crate::handlers;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub db: DatabaseConnection,
    pub store: Arc<dyn MetricsStore>,
}

/// Creates and configures the Axum application router
pub fn create_app(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route(
            "/messages",
            post(handlers::messages::create_message).get(handlers::messages::list_messages),
        )
        .route("/simulate", post(handlers::simulate::simulate))
        .route("/queue/status", get(handlers::queue::queue_status))
        .route("/reset", delete(handlers::queue::reset))
        .route("/ws/stats", get(handlers::ws::stats_ws))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/openapi.json", ApiDoc::openapi()))
}

/// Starts the server with the given configuration
pub async fn run_server(
    config: AppConfig,
    db: DatabaseConnection,
    store: Arc<dyn MetricsStore>,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = config
        .bind_addr()
        .map_err(|e| format!("Invalid server address: {}", e))?;
    let profile = config.profile.clone();

    let state = AppState {
        config: Arc::new(config),
        db,
        store,
    };
    let app = create_app(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, profile = %profile, "Server listening");

    axum::serve(listener, app).await?;

    Ok(())
}

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        crate::handlers::root,
        crate::handlers::health,
        crate::handlers::messages::create_message,
        crate::handlers::messages::list_messages,
        crate::handlers::simulate::simulate,
        crate::handlers::queue::queue_status,
        crate::handlers::queue::reset,
    ),
    components(
        schemas(
            crate::models::ServiceInfo,
            crate::error::ApiError,
            crate::handlers::HealthResponse,
            crate::handlers::messages::CreateMessageRequest,
            crate::handlers::messages::MessageAccepted,
            crate::handlers::messages::MessageRow,
            crate::handlers::simulate::SimulateRequest,
            crate::handlers::simulate::SimulateResponse,
            crate::handlers::queue::QueueStatusResponse,
            crate::handlers::queue::ResetResponse,
        )
    ),
    info(
        title = "Message Ingestor API",
        description = "Elastic message ingestion pipeline with batched persistence",
        version = env!("CARGO_PKG_VERSION"),
    )
)]
pub struct ApiDoc;
