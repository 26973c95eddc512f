#![forbid(unsafe_code)]

// Common types and error handling for the engine boundary

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Custom error type for engine operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Transport not found: {0}")]
    TransportNotFound(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Producer error: {0}")]
    ProducerError(String),

    #[error("Consumer error: {0}")]
    ConsumerError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Which way media flows over a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

/// Media kind carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

/// ICE parameters negotiated by the engine. Opaque to the coordinator —
/// forwarded verbatim between engine and client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceParameters(pub serde_json::Value);

/// ICE candidate list reported by the engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IceCandidates(pub serde_json::Value);

/// DTLS parameters, either engine-generated (transport creation) or
/// client-supplied (transport connect)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DtlsParameters(pub serde_json::Value);

/// RTP send parameters supplied by a producing client
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// RTP capability set — the engine's static codec capabilities, or a
/// consuming client's receive capabilities
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

/// Transport connection parameters for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportHandle {
    pub id: String,
    pub ice_parameters: IceParameters,
    pub ice_candidates: IceCandidates,
    pub dtls_parameters: DtlsParameters,
}

/// Producer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerHandle {
    pub id: String,
}

/// Consumer information for signaling
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerHandle {
    pub id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}
