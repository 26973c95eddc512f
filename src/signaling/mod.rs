#![forbid(unsafe_code)]

// Signaling module - WebSocket signaling server

pub mod broadcast;
pub mod connection;
pub mod protocol;

use crate::room::RoomManager;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

pub use broadcast::Broadcaster;

/// Signaling server state
#[derive(Clone)]
pub struct SignalingServer {
    room_manager: Arc<RoomManager>,
    broadcaster: Broadcaster,
    connection_semaphore: Arc<Semaphore>,
}

impl SignalingServer {
    /// Creates a new signaling server
    pub fn new(room_manager: Arc<RoomManager>, broadcaster: Broadcaster) -> Self {
        let mut max_connections: usize = std::env::var("MAX_CONNECTIONS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(10_000);
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default 10000");
            max_connections = 10_000;
        }
        info!("Max connections: {}", max_connections);

        Self {
            room_manager,
            broadcaster,
            connection_semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    /// Creates the Axum router for the signaling server
    pub fn router(self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/health", get(health_handler))
            .with_state(self)
            .layer(CorsLayer::permissive())
    }

    /// Starts the signaling server on the specified port
    ///
    /// # Errors
    /// Returns an error if the server fails to bind to the port
    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{port}");
        info!("Starting signaling server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await?;
        let app = self.router();

        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Health check handler
async fn health_handler(State(server): State<SignalingServer>) -> Json<serde_json::Value> {
    let rooms = server.room_manager.room_count();
    let members = server.room_manager.total_member_count().await;
    Json(serde_json::json!({
        "status": "ok",
        "rooms": rooms,
        "members": members,
        "connections": server.broadcaster.peer_count(),
    }))
}

/// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> Response {
    // Acquire connection permit (non-blocking)
    let permit = match server.connection_semaphore.clone().try_acquire_owned() {
        Ok(permit) => permit,
        Err(_) => {
            warn!("Connection limit reached, rejecting WebSocket upgrade");
            return (StatusCode::SERVICE_UNAVAILABLE, "Too many connections").into_response();
        }
    };

    ws.max_message_size(65_536)
        .on_failed_upgrade(|error| {
            warn!("WebSocket upgrade failed: {}", error);
        })
        .on_upgrade(move |socket| {
            connection::handle_connection(socket, server.room_manager, server.broadcaster, permit)
        })
}
