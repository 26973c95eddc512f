#![forbid(unsafe_code)]

// Room module - room registry, per-member session state, and the
// orchestration operations that drive the media engine

use crate::engine::{
    ConsumerHandle, DtlsParameters, EngineError, MediaEngine, MediaKind, RtpCapabilities,
    RtpParameters, TransportDirection, TransportHandle,
};
use crate::signaling::broadcast::Broadcaster;
use crate::signaling::protocol::{ErrorKind, MemberInfo, RoomDescriptor, RoomInfo, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;
use tokio::sync::RwLock as TokioRwLock;
use tracing::{debug, info, warn};

/// Display name given to rooms whose creator didn't supply one
pub const DEFAULT_ROOM_NAME: &str = "Unnamed room";

/// Error returned by orchestration operations. Everything resolves locally
/// to a reply envelope; nothing unwinds past the per-request handler.
#[derive(Error, Debug)]
pub enum SignalError {
    #[error("invalid room password")]
    InvalidRoomPassword,

    #[error("connection state missing: {0}")]
    ConnectionError(&'static str),

    #[error("room has no tracked members")]
    RoomNotInitialized,

    #[error("cannot consume producer {0}")]
    CannotConsume(String),

    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl SignalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::InvalidRoomPassword => ErrorKind::InvalidRoomPassword,
            SignalError::ConnectionError(_) => ErrorKind::ConnectionError,
            SignalError::RoomNotInitialized => ErrorKind::RoomNotInitialized,
            SignalError::CannotConsume(_) => ErrorKind::CannotConsume,
            SignalError::Engine(_) => ErrorKind::EngineFailure,
        }
    }
}

pub type SignalResult<T> = Result<T, SignalError>;

/// A connection's participation record within one room.
///
/// The optional fields are the state machine: which negotiation steps have
/// completed is inferred from which handles are populated, never from a
/// separately maintained state enum.
#[derive(Debug, Default)]
pub struct Member {
    pub producer_transport: Option<TransportHandle>,
    pub consumer_transport: Option<TransportHandle>,
    pub producer_id: Option<String>,
    pub username: Option<String>,
}

impl Member {
    fn info(&self) -> MemberInfo {
        MemberInfo {
            id: self.producer_id.clone(),
            username: self.username.clone(),
        }
    }
}

/// Room state. The registry holds a room iff it has at least one member.
pub struct Room {
    pub id: String,
    pub name: String,
    pub password: String,
    pub members: HashMap<String, Member>,
}

impl Room {
    fn new(descriptor: &RoomDescriptor) -> Self {
        Self {
            id: descriptor.id.clone(),
            name: descriptor
                .name
                .clone()
                .unwrap_or_else(|| DEFAULT_ROOM_NAME.to_string()),
            password: descriptor.password.clone().unwrap_or_default(),
            members: HashMap::new(),
        }
    }

    /// The canonical descriptor: the values the first creator registered
    fn descriptor(&self) -> RoomDescriptor {
        RoomDescriptor {
            id: self.id.clone(),
            name: Some(self.name.clone()),
            password: Some(self.password.clone()),
        }
    }

    /// Returns the member for a connection, creating an empty entry if needed
    fn member_mut(&mut self, connection_id: &str) -> &mut Member {
        self.members.entry(connection_id.to_string()).or_default()
    }
}

/// Owns the room registry and the per-connection room binding, and drives
/// the media engine through the negotiation sequence.
///
/// Locking: the outer HashMap is protected by a std::sync::RwLock held only
/// for brief lookups/inserts (never across await points); each room has its
/// own tokio::sync::RwLock, held across the engine call for mutating
/// operations so the read-handle / await-engine / write-handle section is
/// serialized per room.
pub struct RoomManager {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    /// connection id -> room id, bound at successful produce
    connections: StdRwLock<HashMap<String, String>>,
    engine: Arc<dyn MediaEngine>,
    broadcaster: Broadcaster,
}

impl RoomManager {
    pub fn new(engine: Arc<dyn MediaEngine>, broadcaster: Broadcaster) -> Self {
        Self {
            rooms: StdRwLock::new(HashMap::new()),
            connections: StdRwLock::new(HashMap::new()),
            engine,
            broadcaster,
        }
    }

    pub fn room_count(&self) -> usize {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.len()
    }

    pub async fn total_member_count(&self) -> usize {
        let room_locks: Vec<_> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut total = 0;
        for lock in room_locks {
            total += lock.read().await.members.len();
        }
        total
    }

    pub async fn member_count(&self, room_id: &str) -> Option<usize> {
        let room_lock = self.get_room(room_id)?;
        let room = room_lock.read().await;
        Some(room.members.len())
    }

    /// Admission check: passes when no room with that id exists yet (the
    /// incoming password will become canonical) or the stored password
    /// matches. Never mutates state.
    pub async fn check_password(&self, descriptor: &RoomDescriptor) -> bool {
        let room_lock = match self.get_room(&descriptor.id) {
            Some(lock) => lock,
            None => return true,
        };
        let room = room_lock.read().await;
        room.password == descriptor.password.clone().unwrap_or_default()
    }

    async fn admit(&self, descriptor: &RoomDescriptor) -> SignalResult<()> {
        if self.check_password(descriptor).await {
            Ok(())
        } else {
            Err(SignalError::InvalidRoomPassword)
        }
    }

    /// Gets a room lock by id (brief outer read lock, no await)
    fn get_room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Gets or creates a room. Existing rooms keep their first creator's
    /// name and password; the incoming descriptor is ignored for them.
    fn get_or_create_room(&self, descriptor: &RoomDescriptor) -> Arc<TokioRwLock<Room>> {
        {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(&descriptor.id) {
                return room.clone();
            }
        }

        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        rooms
            .entry(descriptor.id.clone())
            .or_insert_with(|| {
                info!("Creating room {}", descriptor.id);
                Arc::new(TokioRwLock::new(Room::new(descriptor)))
            })
            .clone()
    }

    /// Removes a room from the registry if it has no members. Uses try_write
    /// so a room currently being mutated is left alone.
    fn remove_room_if_empty(&self, room_id: &str) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(room_lock) = rooms.get(room_id) {
            if room_lock
                .try_write()
                .map_or(false, |room| room.members.is_empty())
            {
                rooms.remove(room_id);
                info!("Room {} is empty, removing", room_id);
            }
        }
    }

    async fn create_transport(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        direction: TransportDirection,
    ) -> SignalResult<TransportHandle> {
        self.admit(descriptor).await?;

        let room_lock = self.get_or_create_room(descriptor);
        let (handle, old) = {
            let mut room = room_lock.write().await;
            let handle = match self.engine.create_transport(direction).await {
                Ok(handle) => handle,
                Err(e) => {
                    // Never leave a memberless room behind a failed creation
                    drop(room);
                    self.remove_room_if_empty(&descriptor.id);
                    return Err(e.into());
                }
            };

            let member = room.member_mut(connection_id);
            let old = match direction {
                TransportDirection::Send => member.producer_transport.replace(handle.clone()),
                TransportDirection::Recv => member.consumer_transport.replace(handle.clone()),
            };
            debug!(
                "Stored {:?} transport {} for connection {} in room {}",
                direction, handle.id, connection_id, descriptor.id
            );
            (handle, old)
        };

        if let Some(old) = old {
            // Duplicate create: release the superseded engine transport
            if let Err(e) = self.engine.close_transport(&old.id).await {
                warn!("Failed to close replaced transport {}: {}", old.id, e);
            }
        }
        Ok(handle)
    }

    pub async fn create_producer_transport(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
    ) -> SignalResult<TransportHandle> {
        self.create_transport(connection_id, descriptor, TransportDirection::Send)
            .await
    }

    pub async fn create_consumer_transport(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
    ) -> SignalResult<TransportHandle> {
        self.create_transport(connection_id, descriptor, TransportDirection::Recv)
            .await
    }

    async fn connect_transport(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        direction: TransportDirection,
        dtls_parameters: DtlsParameters,
    ) -> SignalResult<()> {
        self.admit(descriptor).await?;

        let room_lock = self
            .get_room(&descriptor.id)
            .ok_or(SignalError::ConnectionError("room does not exist"))?;

        // Write lock held across the engine call: serializes with any
        // concurrent handle mutation for this room
        let room = room_lock.write().await;
        let member = room
            .members
            .get(connection_id)
            .ok_or(SignalError::ConnectionError("no session in this room"))?;
        let transport = match direction {
            TransportDirection::Send => member.producer_transport.as_ref(),
            TransportDirection::Recv => member.consumer_transport.as_ref(),
        }
        .ok_or(SignalError::ConnectionError("transport not created"))?;
        let transport_id = transport.id.clone();

        self.engine
            .connect_transport(&transport_id, dtls_parameters)
            .await?;
        debug!(
            "Connected {:?} transport {} for connection {}",
            direction, transport_id, connection_id
        );
        Ok(())
    }

    pub async fn connect_producer_transport(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        dtls_parameters: DtlsParameters,
    ) -> SignalResult<()> {
        self.connect_transport(
            connection_id,
            descriptor,
            TransportDirection::Send,
            dtls_parameters,
        )
        .await
    }

    pub async fn connect_consumer_transport(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        dtls_parameters: DtlsParameters,
    ) -> SignalResult<()> {
        self.connect_transport(
            connection_id,
            descriptor,
            TransportDirection::Recv,
            dtls_parameters,
        )
        .await
    }

    /// Creates a producer on the member's producer transport, binds the
    /// connection to the room, and announces the new producer to all
    /// connected clients.
    ///
    /// Returns the member's public descriptor and the canonical room
    /// descriptor so the caller adopts server-side name/password when it
    /// joined an existing room.
    pub async fn produce(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        username: String,
    ) -> SignalResult<(MemberInfo, RoomDescriptor)> {
        self.admit(descriptor).await?;

        let room_lock = self
            .get_room(&descriptor.id)
            .ok_or(SignalError::ConnectionError("room does not exist"))?;

        let (member_info, canonical) = {
            let mut room = room_lock.write().await;
            let transport_id = room
                .members
                .get(connection_id)
                .and_then(|m| m.producer_transport.as_ref())
                .ok_or(SignalError::ConnectionError("producer transport not created"))?
                .id
                .clone();

            let producer = self
                .engine
                .produce(&transport_id, kind, rtp_parameters)
                .await?;

            // Handles are only written once the engine call has succeeded
            let member = room.member_mut(connection_id);
            member.producer_id = Some(producer.id.clone());
            member.username = Some(username);
            let member_info = member.info();
            info!(
                "Connection {} producing {} in room {}",
                connection_id, producer.id, room.id
            );
            (member_info, room.descriptor())
        };

        {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.insert(connection_id.to_string(), descriptor.id.clone());
        }

        self.broadcaster.broadcast_all(&ServerMessage::NewProducer {
            id: member_info.id.clone(),
            username: member_info.username.clone(),
        });

        Ok((member_info, canonical))
    }

    /// Creates a consumer for another member's producer. The caller must
    /// have produced already and may not consume its own stream.
    pub async fn consume(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        producer_id: &str,
        rtp_capabilities: RtpCapabilities,
    ) -> SignalResult<ConsumerHandle> {
        self.admit(descriptor).await?;

        let room_lock = self
            .get_room(&descriptor.id)
            .ok_or(SignalError::ConnectionError("room does not exist"))?;

        let (transport_id, own_producer_id) = {
            let room = room_lock.read().await;
            let member = room
                .members
                .get(connection_id)
                .ok_or(SignalError::ConnectionError("no session in this room"))?;
            let transport_id = member
                .consumer_transport
                .as_ref()
                .ok_or(SignalError::ConnectionError("consumer transport not created"))?
                .id
                .clone();
            let own_producer_id = member
                .producer_id
                .clone()
                .ok_or(SignalError::ConnectionError("not producing yet"))?;
            (transport_id, own_producer_id)
        };

        if own_producer_id == producer_id {
            return Err(SignalError::CannotConsume(producer_id.to_string()));
        }
        if !self.engine.can_consume(producer_id, &rtp_capabilities).await {
            return Err(SignalError::CannotConsume(producer_id.to_string()));
        }

        let consumer = self
            .engine
            .consume(&transport_id, producer_id, rtp_capabilities)
            .await?;
        debug!(
            "Connection {} consuming producer {} via consumer {}",
            connection_id, producer_id, consumer.id
        );
        Ok(consumer)
    }

    /// Lists every other member that has produced in the room
    pub async fn get_producers(
        &self,
        connection_id: &str,
        descriptor: &RoomDescriptor,
    ) -> SignalResult<Vec<MemberInfo>> {
        self.admit(descriptor).await?;

        let room_lock = self
            .get_room(&descriptor.id)
            .ok_or(SignalError::RoomNotInitialized)?;
        let room = room_lock.read().await;
        if room.members.is_empty() {
            return Err(SignalError::RoomNotInitialized);
        }

        Ok(room
            .members
            .iter()
            .filter(|(id, member)| id.as_str() != connection_id && member.producer_id.is_some())
            .map(|(_, member)| member.info())
            .collect())
    }

    /// Pre-admission probe: no password required. A missing room reports
    /// `has_password: true` so a prospective creator is made to set one.
    pub async fn get_room_info(&self, room_id: &str) -> RoomInfo {
        match self.get_room(room_id) {
            Some(room_lock) => {
                let room = room_lock.read().await;
                RoomInfo {
                    has_name: true,
                    has_password: !room.password.is_empty(),
                }
            }
            None => RoomInfo {
                has_name: false,
                has_password: true,
            },
        }
    }

    pub async fn router_capabilities(&self) -> RtpCapabilities {
        self.engine.router_capabilities().await
    }

    /// Cleanup on channel close. Idempotent: a connection that never
    /// produced, or was already cleaned up, is a no-op.
    pub async fn disconnect(&self, connection_id: &str) {
        let room_id = {
            let mut connections = self.connections.write().unwrap_or_else(|e| e.into_inner());
            connections.remove(connection_id)
        };
        let Some(room_id) = room_id else {
            debug!("Disconnect for unbound connection {}", connection_id);
            return;
        };

        let Some(room_lock) = self.get_room(&room_id) else {
            return;
        };

        let (removed, room_empty) = {
            let mut room = room_lock.write().await;
            let removed = room.members.remove(connection_id);
            (removed, room.members.is_empty())
        };

        let Some(member) = removed else {
            return;
        };
        info!("Connection {} left room {}", connection_id, room_id);

        if room_empty {
            self.remove_room_if_empty(&room_id);
        }

        if let Some(producer_id) = member.producer_id {
            self.broadcaster
                .broadcast_all(&ServerMessage::DeletedProducer { id: producer_id });
        }

        // Release engine-side transports now that the member is gone.
        // Complete-then-discard: failures are logged, never propagated.
        for transport in [member.producer_transport, member.consumer_transport]
            .into_iter()
            .flatten()
        {
            if let Err(e) = self.engine.close_transport(&transport.id).await {
                warn!("Failed to close transport {}: {}", transport.id, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::LoopbackEngine;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn manager() -> Arc<RoomManager> {
        let engine = Arc::new(LoopbackEngine::new());
        Arc::new(RoomManager::new(engine, Broadcaster::new()))
    }

    fn manager_with_broadcaster() -> (Arc<RoomManager>, Broadcaster) {
        let engine = Arc::new(LoopbackEngine::new());
        let broadcaster = Broadcaster::new();
        let manager = Arc::new(RoomManager::new(engine, broadcaster.clone()));
        (manager, broadcaster)
    }

    fn caps() -> RtpCapabilities {
        RtpCapabilities(json!({"codecs": []}))
    }

    async fn produce_as(
        manager: &RoomManager,
        connection_id: &str,
        descriptor: &RoomDescriptor,
        username: &str,
    ) -> (MemberInfo, RoomDescriptor) {
        manager
            .create_producer_transport(connection_id, descriptor)
            .await
            .unwrap();
        manager
            .connect_producer_transport(connection_id, descriptor, DtlsParameters::default())
            .await
            .unwrap();
        manager
            .produce(
                connection_id,
                descriptor,
                MediaKind::Audio,
                RtpParameters::default(),
                username.to_string(),
            )
            .await
            .unwrap()
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(json) = rx.try_recv() {
            out.push(serde_json::from_str(&json).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_room_removed_when_last_member_leaves() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");

        produce_as(&manager, "conn-a", &desc, "alice").await;
        assert_eq!(manager.room_count(), 1);

        manager.disconnect("conn-a").await;
        assert_eq!(manager.room_count(), 0);
        assert_eq!(manager.member_count("r1").await, None);
    }

    #[tokio::test]
    async fn test_check_password_is_pure_and_repeatable() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1").with_password("secret");

        // Unknown room: any password passes, and probing creates nothing
        for _ in 0..3 {
            assert!(manager.check_password(&desc).await);
        }
        assert_eq!(manager.room_count(), 0);

        produce_as(&manager, "conn-a", &desc, "alice").await;

        let wrong = RoomDescriptor::new("r1").with_password("wrong");
        for _ in 0..3 {
            assert!(manager.check_password(&desc).await);
            assert!(!manager.check_password(&wrong).await);
        }
    }

    #[tokio::test]
    async fn test_first_creator_values_persist() {
        let manager = manager();
        let creator = RoomDescriptor {
            id: "r1".into(),
            name: Some("The room".into()),
            password: Some("".into()),
        };
        produce_as(&manager, "conn-a", &creator, "alice").await;

        // A joiner's name is ignored; the canonical descriptor comes back
        let joiner = RoomDescriptor {
            id: "r1".into(),
            name: Some("Renamed".into()),
            password: Some("".into()),
        };
        let (_, canonical) = produce_as(&manager, "conn-b", &joiner, "bob").await;
        assert_eq!(canonical.name.as_deref(), Some("The room"));
        assert_eq!(canonical.password.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn test_default_room_name() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        let (_, canonical) = produce_as(&manager, "conn-a", &desc, "alice").await;
        assert_eq!(canonical.name.as_deref(), Some(DEFAULT_ROOM_NAME));
    }

    #[tokio::test]
    async fn test_connect_before_create_is_connection_error() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");

        let result = manager
            .connect_producer_transport("conn-a", &desc, DtlsParameters::default())
            .await;
        assert!(matches!(result, Err(SignalError::ConnectionError(_))));

        // No room or member state was created along the way
        assert_eq!(manager.room_count(), 0);
        let info = manager.get_room_info("r1").await;
        assert!(!info.has_name);
    }

    #[tokio::test]
    async fn test_produce_before_transport_is_connection_error() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");

        // The room exists (consumer transport created) but no producer
        // transport does
        manager
            .create_consumer_transport("conn-a", &desc)
            .await
            .unwrap();
        let result = manager
            .produce(
                "conn-a",
                &desc,
                MediaKind::Audio,
                RtpParameters::default(),
                "alice".into(),
            )
            .await;
        assert!(matches!(result, Err(SignalError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_room_info_transitions() {
        let manager = manager();

        let fresh = manager.get_room_info("r1").await;
        assert!(!fresh.has_name);
        assert!(fresh.has_password);

        let desc = RoomDescriptor::new("r1").with_password("");
        produce_as(&manager, "conn-a", &desc, "alice").await;

        let open = manager.get_room_info("r1").await;
        assert!(open.has_name);
        assert!(!open.has_password);

        let protected_desc = RoomDescriptor::new("r2").with_password("secret");
        produce_as(&manager, "conn-b", &protected_desc, "bob").await;
        let protected = manager.get_room_info("r2").await;
        assert!(protected.has_name);
        assert!(protected.has_password);
    }

    #[tokio::test]
    async fn test_wrong_password_rejected_without_side_effects() {
        let manager = manager();
        let desc = RoomDescriptor::new("r2").with_password("secret");
        produce_as(&manager, "conn-a", &desc, "alice").await;

        let wrong = RoomDescriptor::new("r2").with_password("wrong");
        let result = manager.create_producer_transport("conn-b", &wrong).await;
        assert!(matches!(result, Err(SignalError::InvalidRoomPassword)));

        // The intruder got no member entry
        assert_eq!(manager.member_count("r2").await, Some(1));
    }

    #[tokio::test]
    async fn test_consume_own_producer_rejected() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        let (member, _) = produce_as(&manager, "conn-a", &desc, "alice").await;
        manager
            .create_consumer_transport("conn-a", &desc)
            .await
            .unwrap();
        manager
            .connect_consumer_transport("conn-a", &desc, DtlsParameters::default())
            .await
            .unwrap();

        let own_id = member.id.unwrap();
        let result = manager.consume("conn-a", &desc, &own_id, caps()).await;
        assert!(matches!(result, Err(SignalError::CannotConsume(_))));
    }

    #[tokio::test]
    async fn test_consume_requires_own_production_first() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        let (alice, _) = produce_as(&manager, "conn-a", &desc, "alice").await;

        // conn-b sets up a consumer transport but never produces
        manager
            .create_consumer_transport("conn-b", &desc)
            .await
            .unwrap();
        manager
            .connect_consumer_transport("conn-b", &desc, DtlsParameters::default())
            .await
            .unwrap();

        let result = manager
            .consume("conn-b", &desc, &alice.id.unwrap(), caps())
            .await;
        assert!(matches!(result, Err(SignalError::ConnectionError(_))));
    }

    #[tokio::test]
    async fn test_consume_peer_succeeds() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        let (alice, _) = produce_as(&manager, "conn-a", &desc, "alice").await;
        produce_as(&manager, "conn-b", &desc, "bob").await;
        manager
            .create_consumer_transport("conn-b", &desc)
            .await
            .unwrap();
        manager
            .connect_consumer_transport("conn-b", &desc, DtlsParameters::default())
            .await
            .unwrap();

        let alice_id = alice.id.unwrap();
        let consumer = manager
            .consume("conn-b", &desc, &alice_id, caps())
            .await
            .unwrap();
        assert_eq!(consumer.producer_id, alice_id);
        assert_eq!(consumer.kind, MediaKind::Audio);
    }

    #[tokio::test]
    async fn test_consume_incompatible_capabilities() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        let (alice, _) = produce_as(&manager, "conn-a", &desc, "alice").await;
        produce_as(&manager, "conn-b", &desc, "bob").await;
        manager
            .create_consumer_transport("conn-b", &desc)
            .await
            .unwrap();

        // The loopback engine rejects null capabilities
        let result = manager
            .consume(
                "conn-b",
                &desc,
                &alice.id.unwrap(),
                RtpCapabilities(serde_json::Value::Null),
            )
            .await;
        assert!(matches!(result, Err(SignalError::CannotConsume(_))));
    }

    #[tokio::test]
    async fn test_get_producers_excludes_caller() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        let (alice, _) = produce_as(&manager, "conn-a", &desc, "alice").await;

        // conn-b has joined (transport created) but not produced yet
        manager
            .create_producer_transport("conn-b", &desc)
            .await
            .unwrap();

        let listed = manager.get_producers("conn-b", &desc).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, alice.id);
        assert_eq!(listed[0].username.as_deref(), Some("alice"));

        // The producing caller sees no one else
        let for_alice = manager.get_producers("conn-a", &desc).await.unwrap();
        assert!(for_alice.is_empty());
    }

    #[tokio::test]
    async fn test_get_producers_on_unknown_room() {
        let manager = manager();
        let desc = RoomDescriptor::new("nowhere");
        let result = manager.get_producers("conn-a", &desc).await;
        assert!(matches!(result, Err(SignalError::RoomNotInitialized)));
    }

    #[tokio::test]
    async fn test_presence_scenario() {
        let (manager, broadcaster) = manager_with_broadcaster();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        broadcaster.register("conn-a".into(), tx_a);
        broadcaster.register("conn-b".into(), tx_b);

        let desc = RoomDescriptor::new("r1");
        let (alice, _) = produce_as(&manager, "conn-a", &desc, "alice").await;
        let alice_id = alice.id.clone().unwrap();

        // newProducer fanned out to every connected client
        for rx in [&mut rx_a, &mut rx_b] {
            let msgs = drain(rx);
            assert!(msgs.iter().any(|m| matches!(
                m,
                ServerMessage::NewProducer { id: Some(id), username: Some(u) }
                    if *id == alice_id && u == "alice"
            )));
        }

        produce_as(&manager, "conn-b", &desc, "bob").await;
        drain(&mut rx_a);
        drain(&mut rx_b);

        manager.disconnect("conn-a").await;
        let msgs = drain(&mut rx_b);
        assert!(msgs.iter().any(|m| matches!(
            m,
            ServerMessage::DeletedProducer { id } if *id == alice_id
        )));
        assert_eq!(manager.member_count("r1").await, Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let (manager, broadcaster) = manager_with_broadcaster();
        let (tx, mut rx) = mpsc::channel(8);
        broadcaster.register("observer".into(), tx);

        let desc = RoomDescriptor::new("r1");
        produce_as(&manager, "conn-a", &desc, "alice").await;
        produce_as(&manager, "conn-b", &desc, "bob").await;
        drain(&mut rx);

        manager.disconnect("conn-a").await;
        let first = drain(&mut rx);
        assert_eq!(
            first
                .iter()
                .filter(|m| matches!(m, ServerMessage::DeletedProducer { .. }))
                .count(),
            1
        );

        manager.disconnect("conn-a").await;
        assert!(drain(&mut rx).is_empty());
        assert_eq!(manager.member_count("r1").await, Some(1));
    }

    #[tokio::test]
    async fn test_disconnect_before_produce_is_noop() {
        let manager = manager();
        let desc = RoomDescriptor::new("r1");
        manager
            .create_producer_transport("conn-a", &desc)
            .await
            .unwrap();

        // The connection never produced, so no room binding exists yet
        manager.disconnect("conn-a").await;
        assert_eq!(manager.member_count("r1").await, Some(1));
    }
}
