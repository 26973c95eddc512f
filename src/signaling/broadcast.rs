#![forbid(unsafe_code)]

// Presence broadcaster - fan-out of membership events to connected clients
//
// Broadcasts go to every connected client process-wide, not just the room
// that changed; clients ignore notifications about their own producer.

use super::protocol::ServerMessage;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Registry of per-connection send channels
#[derive(Clone, Default)]
pub struct Broadcaster {
    peers: Arc<StdRwLock<HashMap<String, mpsc::Sender<Arc<String>>>>>,
}

impl Broadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a connection's send channel
    pub fn register(&self, connection_id: String, sender: mpsc::Sender<Arc<String>>) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.insert(connection_id, sender);
    }

    /// Unregisters a connection; idempotent
    pub fn unregister(&self, connection_id: &str) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.remove(connection_id);
    }

    pub fn peer_count(&self) -> usize {
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        peers.len()
    }

    /// Broadcast a message to all connected clients.
    /// Fire-and-forget: serialization or channel failures are logged, never
    /// propagated.
    pub fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        let peers = self.peers.read().unwrap_or_else(|e| e.into_inner());
        for (id, sender) in peers.iter() {
            match sender.try_send(json.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for connection {}, dropping broadcast", id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for connection {} (disconnected)", id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::protocol::ServerMessage;

    #[tokio::test]
    async fn test_broadcast_reaches_all_registered_peers() {
        let broadcaster = Broadcaster::new();
        let (tx_a, mut rx_a) = mpsc::channel(4);
        let (tx_b, mut rx_b) = mpsc::channel(4);
        broadcaster.register("a".into(), tx_a);
        broadcaster.register("b".into(), tx_b);

        broadcaster.broadcast_all(&ServerMessage::DeletedProducer { id: "p1".into() });

        for rx in [&mut rx_a, &mut rx_b] {
            let json = rx.recv().await.unwrap();
            let msg: ServerMessage = serde_json::from_str(&json).unwrap();
            assert!(matches!(msg, ServerMessage::DeletedProducer { id } if id == "p1"));
        }
    }

    #[tokio::test]
    async fn test_unregister_is_idempotent() {
        let broadcaster = Broadcaster::new();
        let (tx, _rx) = mpsc::channel(1);
        broadcaster.register("a".into(), tx);
        assert_eq!(broadcaster.peer_count(), 1);

        broadcaster.unregister("a");
        broadcaster.unregister("a");
        assert_eq!(broadcaster.peer_count(), 0);
    }
}
