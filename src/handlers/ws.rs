//! # Stats WebSocket Handler
//!
//! Upgrades `/ws/stats` connections and hands each socket to the telemetry
//! broadcaster.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::Response,
};

use crate::broadcaster;
use crate::server::AppState;

/// WebSocket upgrade handler for the stats stream.
pub async fn stats_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| broadcaster::run_session(socket, state))
}
