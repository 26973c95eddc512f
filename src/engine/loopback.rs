#![forbid(unsafe_code)]

// In-process media engine used for standalone operation and tests.
// Mints ids and tracks resource liveness, but moves no media.

use super::types::{
    ConsumerHandle, DtlsParameters, EngineError, EngineResult, IceCandidates, IceParameters,
    MediaKind, ProducerHandle, RtpCapabilities, RtpParameters, TransportDirection, TransportHandle,
};
use super::MediaEngine;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use tracing::debug;
use uuid::Uuid;

struct TransportState {
    direction: TransportDirection,
    connected: bool,
}

struct ProducerState {
    transport_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
}

#[derive(Default)]
struct EngineState {
    transports: HashMap<String, TransportState>,
    producers: HashMap<String, ProducerState>,
}

/// Loopback implementation of [`MediaEngine`]
#[derive(Default)]
pub struct LoopbackEngine {
    state: StdMutex<EngineState>,
}

impl LoopbackEngine {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MediaEngine for LoopbackEngine {
    async fn create_transport(&self, direction: TransportDirection) -> EngineResult<TransportHandle> {
        let id = Uuid::new_v4().to_string();
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.transports.insert(
            id.clone(),
            TransportState {
                direction,
                connected: false,
            },
        );
        debug!("Created {:?} transport {}", direction, id);

        Ok(TransportHandle {
            ice_parameters: IceParameters(json!({
                "usernameFragment": Uuid::new_v4().simple().to_string(),
                "password": Uuid::new_v4().simple().to_string(),
                "iceLite": true,
            })),
            ice_candidates: IceCandidates(json!([])),
            dtls_parameters: DtlsParameters(json!({
                "role": "auto",
                "fingerprints": [],
            })),
            id,
        })
    }

    async fn connect_transport(
        &self,
        transport_id: &str,
        _dtls_parameters: DtlsParameters,
    ) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| EngineError::TransportNotFound(transport_id.to_string()))?;
        transport.connected = true;
        Ok(())
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> EngineResult<ProducerHandle> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.transports.get(transport_id) {
            Some(t) if t.direction == TransportDirection::Send => {}
            Some(_) => {
                return Err(EngineError::ProducerError(format!(
                    "Transport {transport_id} is not a send transport"
                )))
            }
            None => return Err(EngineError::TransportNotFound(transport_id.to_string())),
        }

        let id = Uuid::new_v4().to_string();
        state.producers.insert(
            id.clone(),
            ProducerState {
                transport_id: transport_id.to_string(),
                kind,
                rtp_parameters,
            },
        );
        debug!("Created {:?} producer {} on transport {}", kind, id, transport_id);
        Ok(ProducerHandle { id })
    }

    async fn can_consume(&self, producer_id: &str, rtp_capabilities: &RtpCapabilities) -> bool {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.producers.contains_key(producer_id) && !rtp_capabilities.0.is_null()
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        _rtp_capabilities: RtpCapabilities,
    ) -> EngineResult<ConsumerHandle> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.transports.get(transport_id) {
            Some(t) if t.direction == TransportDirection::Recv => {}
            Some(_) => {
                return Err(EngineError::ConsumerError(format!(
                    "Transport {transport_id} is not a recv transport"
                )))
            }
            None => return Err(EngineError::TransportNotFound(transport_id.to_string())),
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| EngineError::ProducerNotFound(producer_id.to_string()))?;

        Ok(ConsumerHandle {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
        })
    }

    async fn router_capabilities(&self) -> RtpCapabilities {
        // Audio-only router, matching the deployed codec set
        RtpCapabilities(json!({
            "codecs": [{
                "kind": "audio",
                "mimeType": "audio/opus",
                "clockRate": 48000,
                "channels": 2,
            }],
            "headerExtensions": [],
        }))
    }

    async fn close_transport(&self, transport_id: &str) -> EngineResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.transports.remove(transport_id).is_none() {
            return Err(EngineError::TransportNotFound(transport_id.to_string()));
        }
        state
            .producers
            .retain(|_, p| p.transport_id != transport_id);
        debug!("Closed transport {}", transport_id);
        Ok(())
    }
}
