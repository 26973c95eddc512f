#![forbid(unsafe_code)]

// Engine module - boundary to the external media-routing engine
// The coordinator never moves media; it drives an engine through this trait.

pub mod loopback;
pub mod types;

pub use loopback::LoopbackEngine;
pub use types::{
    ConsumerHandle, DtlsParameters, EngineError, EngineResult, IceCandidates, IceParameters,
    MediaKind, ProducerHandle, RtpCapabilities, RtpParameters, TransportDirection, TransportHandle,
};

use async_trait::async_trait;

/// Asynchronous boundary to the SFU router abstraction.
///
/// Every method is a suspension point for the caller; the engine has its own
/// internal concurrency and may interleave calls from different connections.
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Creates a WebRTC transport and returns its connection parameters
    async fn create_transport(&self, direction: TransportDirection) -> EngineResult<TransportHandle>;

    /// Completes the DTLS handshake on a previously created transport
    async fn connect_transport(
        &self,
        transport_id: &str,
        dtls_parameters: DtlsParameters,
    ) -> EngineResult<()>;

    /// Creates a producer on a send transport
    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerHandle>;

    /// Reports whether a producer can be consumed with the given capabilities
    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool;

    /// Creates a consumer on a recv transport for the given producer
    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> EngineResult<ConsumerHandle>;

    /// The engine's static codec capability set
    async fn router_capabilities(&self) -> RtpCapabilities;

    /// Releases an engine-side transport and everything created on it
    async fn close_transport(&self, transport_id: &str) -> EngineResult<()>;
}
