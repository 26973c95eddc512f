#![forbid(unsafe_code)]

mod engine;
mod room;
mod signaling;

use anyhow::Result;
use engine::LoopbackEngine;
use room::RoomManager;
use signaling::{Broadcaster, SignalingServer};
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxroom=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("voxroom - Starting signaling coordinator");

    // The loopback engine stands in for an external SFU; it negotiates the
    // full signaling sequence without moving media.
    let media_engine = Arc::new(LoopbackEngine::new());
    let broadcaster = Broadcaster::new();
    let room_manager = Arc::new(RoomManager::new(media_engine, broadcaster.clone()));

    info!("Room manager and media engine initialized");

    let signaling_server = SignalingServer::new(room_manager, broadcaster);
    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(3000);

    info!("Starting signaling server on port {}", port);

    // Run server with graceful shutdown
    tokio::select! {
        result = signaling_server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}
