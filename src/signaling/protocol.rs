#![forbid(unsafe_code)]

// Signaling protocol - Message types for WebSocket communication

use crate::engine::{
    DtlsParameters, IceCandidates, IceParameters, MediaKind, RtpCapabilities, RtpParameters,
};
use serde::{Deserialize, Serialize};

/// Room descriptor carried by every room-scoped request.
/// `name` and `password` only matter on first creation; afterwards the
/// registry's stored values are canonical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomDescriptor {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl RoomDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            password: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }
}

/// A member's public descriptor: its producer id and display name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
}

/// Pre-admission probe result for a room id
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    pub has_name: bool,
    pub has_password: bool,
}

/// Error discriminant carried in the reply envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    InvalidRoomPassword,
    ConnectionError,
    RoomNotInitialized,
    CannotConsume,
    EngineFailure,
}

/// Client-to-Server messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    /// Create the outbound media transport
    CreateProducerTransport { room: RoomDescriptor },
    /// Complete the DTLS handshake on the outbound transport
    #[serde(rename_all = "camelCase")]
    ConnectProducerTransport {
        room: RoomDescriptor,
        dtls_parameters: DtlsParameters,
    },
    /// Create the inbound media transport
    CreateConsumerTransport { room: RoomDescriptor },
    /// Complete the DTLS handshake on the inbound transport
    #[serde(rename_all = "camelCase")]
    ConnectConsumerTransport {
        room: RoomDescriptor,
        dtls_parameters: DtlsParameters,
    },
    /// Start producing media into the room
    #[serde(rename_all = "camelCase")]
    Produce {
        room: RoomDescriptor,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        username: String,
    },
    /// Consume another member's producer
    #[serde(rename_all = "camelCase")]
    Consume {
        room: RoomDescriptor,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    /// List the other members currently producing in the room
    GetProducers { room: RoomDescriptor },
    /// Probe whether a room exists and is password-protected
    #[serde(rename_all = "camelCase")]
    GetRoomInfo { room_id: String },
    /// Get the engine's static codec capability set
    GetRouterRtpCapabilities,
}

/// Server-to-Client messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Producer transport created
    #[serde(rename_all = "camelCase")]
    ProducerTransportCreated {
        id: String,
        ice_parameters: IceParameters,
        ice_candidates: IceCandidates,
        dtls_parameters: DtlsParameters,
    },
    /// Producer transport DTLS handshake completed
    ProducerTransportConnected,
    /// Consumer transport created
    #[serde(rename_all = "camelCase")]
    ConsumerTransportCreated {
        id: String,
        ice_parameters: IceParameters,
        ice_candidates: IceCandidates,
        dtls_parameters: DtlsParameters,
    },
    /// Consumer transport DTLS handshake completed
    ConsumerTransportConnected,
    /// Producing started; `room` carries the canonical name/password so a
    /// joiner adopts the creator's values
    Produced {
        member: MemberInfo,
        room: RoomDescriptor,
    },
    /// Consumer created
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    /// Current producers in the room, excluding the caller
    Producers { producers: Vec<MemberInfo> },
    /// Room existence / protection probe result
    RoomInfo(RoomInfo),
    /// Router RTP capabilities
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities { rtp_capabilities: RtpCapabilities },
    /// A member started producing (broadcast)
    NewProducer {
        #[serde(default)]
        id: Option<String>,
        #[serde(default)]
        username: Option<String>,
    },
    /// A producing member left (broadcast)
    DeletedProducer { id: String },
    /// Error envelope — `error` is the single field clients check
    Error { error: ErrorKind, message: String },
}
