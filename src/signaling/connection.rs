#![forbid(unsafe_code)]

// WebSocket connection handler for individual clients

use super::broadcast::Broadcaster;
use super::protocol::{ClientMessage, ErrorKind, ServerMessage};
use crate::room::{RoomManager, SignalError};
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client.
/// Messages queued beyond this are stale — drop them early.
const CHANNEL_CAPACITY: usize = 64;

/// Idle timeout — close connection if no message received within this duration.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Serialize a ServerMessage and send it through the channel as pre-serialized JSON.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) -> anyhow::Result<()> {
    let json = Arc::new(serde_json::to_string(msg)?);
    sender.try_send(json).map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

/// Handles a single WebSocket connection
pub async fn handle_connection(
    socket: WebSocket,
    room_manager: Arc<RoomManager>,
    broadcaster: Broadcaster,
    _permit: OwnedSemaphorePermit,
) {
    let connection_id = Uuid::new_v4().to_string();
    info!("New WebSocket connection: {}", connection_id);

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Bounded channel for sending messages to this client
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    // Presence broadcasts reach this connection from now on
    broadcaster.register(connection_id.clone(), tx.clone());

    // Spawn task to send messages to client
    let connection_id_clone = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for connection: {}", connection_id_clone);
    });

    // Token bucket rate limiter state
    let mut tokens_us: u64 = MAX_TOKENS_US;
    let mut last_refill = Instant::now();
    let mut rate_limit_warned = false;

    loop {
        // Idle timeout: close connection if no message within IDLE_TIMEOUT
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break, // Stream error or closed
            Err(_) => {
                warn!("Idle timeout for connection {}", connection_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                // Token bucket rate limiting
                let now = Instant::now();
                let elapsed_us = now.duration_since(last_refill).as_micros() as u64;
                last_refill = now;
                tokens_us = (tokens_us + elapsed_us * RATE_LIMIT_REFILL_RATE).min(MAX_TOKENS_US);

                if tokens_us >= TOKEN_US {
                    tokens_us -= TOKEN_US;
                    rate_limit_warned = false;
                } else {
                    if !rate_limit_warned {
                        rate_limit_warned = true;
                        warn!("Rate limit exceeded for connection {}", connection_id);
                        let _ = send_json(
                            &tx,
                            &ServerMessage::Error {
                                error: ErrorKind::ConnectionError,
                                message: format!(
                                    "Rate limit exceeded: max {RATE_LIMIT_REFILL_RATE} messages/second"
                                ),
                            },
                        );
                    }
                    continue;
                }

                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let result =
                            handle_client_message(&client_msg, &connection_id, &tx, &room_manager)
                                .await;

                        if let Err(e) = result {
                            debug!("Request failed for connection {}: {}", connection_id, e);
                            // If channel is closed, send task has exited — break
                            if tx.is_closed() {
                                break;
                            }
                            let _ = send_json(
                                &tx,
                                &ServerMessage::Error {
                                    error: e.kind(),
                                    message: e.to_string(),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        warn!("Invalid message format: {}", e);
                        let _ = send_json(
                            &tx,
                            &ServerMessage::Error {
                                error: ErrorKind::ConnectionError,
                                message: format!("Invalid message format: {e}"),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => {
                info!("Client {} closed connection", connection_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            _ => {
                warn!("Unexpected message type from client {}", connection_id);
            }
        }
    }

    // Channel close is the only cancellation signal: stop receiving
    // broadcasts, then clean up room membership and engine transports
    broadcaster.unregister(&connection_id);
    room_manager.disconnect(&connection_id).await;

    // _permit dropped here → release semaphore

    drop(tx);
    let _ = send_task.await;

    info!("Connection handler finished for: {}", connection_id);
}

/// Handle a single client message. Every error resolves to a reply envelope
/// in the caller; nothing unwinds past this boundary.
async fn handle_client_message(
    message: &ClientMessage,
    connection_id: &str,
    sender: &mpsc::Sender<Arc<String>>,
    room_manager: &Arc<RoomManager>,
) -> Result<(), SignalError> {
    match message {
        ClientMessage::CreateProducerTransport { room } => {
            let transport = room_manager
                .create_producer_transport(connection_id, room)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ProducerTransportCreated {
                    id: transport.id,
                    ice_parameters: transport.ice_parameters,
                    ice_candidates: transport.ice_candidates,
                    dtls_parameters: transport.dtls_parameters,
                },
            );
        }

        ClientMessage::ConnectProducerTransport {
            room,
            dtls_parameters,
        } => {
            room_manager
                .connect_producer_transport(connection_id, room, dtls_parameters.clone())
                .await?;
            let _ = send_json(sender, &ServerMessage::ProducerTransportConnected);
        }

        ClientMessage::CreateConsumerTransport { room } => {
            let transport = room_manager
                .create_consumer_transport(connection_id, room)
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ConsumerTransportCreated {
                    id: transport.id,
                    ice_parameters: transport.ice_parameters,
                    ice_candidates: transport.ice_candidates,
                    dtls_parameters: transport.dtls_parameters,
                },
            );
        }

        ClientMessage::ConnectConsumerTransport {
            room,
            dtls_parameters,
        } => {
            room_manager
                .connect_consumer_transport(connection_id, room, dtls_parameters.clone())
                .await?;
            let _ = send_json(sender, &ServerMessage::ConsumerTransportConnected);
        }

        ClientMessage::Produce {
            room,
            kind,
            rtp_parameters,
            username,
        } => {
            let (member, canonical) = room_manager
                .produce(
                    connection_id,
                    room,
                    *kind,
                    rtp_parameters.clone(),
                    username.clone(),
                )
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::Produced {
                    member,
                    room: canonical,
                },
            );
        }

        ClientMessage::Consume {
            room,
            producer_id,
            rtp_capabilities,
        } => {
            let consumer = room_manager
                .consume(connection_id, room, producer_id, rtp_capabilities.clone())
                .await?;
            let _ = send_json(
                sender,
                &ServerMessage::ConsumerCreated {
                    id: consumer.id,
                    producer_id: consumer.producer_id,
                    kind: consumer.kind,
                    rtp_parameters: consumer.rtp_parameters,
                },
            );
        }

        ClientMessage::GetProducers { room } => {
            let producers = room_manager.get_producers(connection_id, room).await?;
            let _ = send_json(sender, &ServerMessage::Producers { producers });
        }

        ClientMessage::GetRoomInfo { room_id } => {
            let info = room_manager.get_room_info(room_id).await;
            let _ = send_json(sender, &ServerMessage::RoomInfo(info));
        }

        ClientMessage::GetRouterRtpCapabilities => {
            let rtp_capabilities = room_manager.router_capabilities().await;
            let _ = send_json(sender, &ServerMessage::RouterRtpCapabilities { rtp_capabilities });
        }
    }

    Ok(())
}
