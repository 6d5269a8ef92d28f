//! One protocol session over one transport connection.
//!
//! The session owns the handshake state machine, a local property registry
//! used to validate outbound updates, and the per-tag dispatch of inbound
//! frames to user callbacks. Application sends are gated on `Ready`.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::{ComponentTypeHash, PropertyHash};
use crate::net::manager::{ConnectionHandle, ConnectionManager};
use crate::property::{EntityId, PropertyMetadata, PropertyValue};
use crate::property_registry::PropertyRegistry;
use crate::proto::{Message, PropertyBatch, PROTOCOL_VERSION};
use crate::schema::ComponentSchema;
use crate::schema_registry::ComponentSchemaRegistry;
use crate::session::LOCAL_CAPABILITIES;
use enthalpy::logging::{self, Logger};
use enthalpy::time;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

/// Session lifecycle. Only `Ready` admits application sends.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum SessionState {
    Init = 0,
    HandshakeInProgress = 1,
    Ready = 2,
    Disconnected = 3,
}

impl SessionState {
    fn from_u8(raw: u8) -> SessionState {
        match raw {
            1 => SessionState::HandshakeInProgress,
            2 => SessionState::Ready,
            3 => SessionState::Disconnected,
            _ => SessionState::Init,
        }
    }
}

pub type HandshakeCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type EntityCreatedCallback = Arc<dyn Fn(EntityId, &str, &str, EntityId) + Send + Sync>;
pub type EntityDestroyedCallback = Arc<dyn Fn(EntityId) + Send + Sync>;
pub type EntityParentChangedCallback = Arc<dyn Fn(EntityId, EntityId) + Send + Sync>;
pub type PropertyRegisteredCallback = Arc<dyn Fn(PropertyHash, &PropertyMetadata) + Send + Sync>;
pub type PropertyChangedCallback = Arc<dyn Fn(PropertyHash, &PropertyValue) + Send + Sync>;
pub type SchemaAdvertisementCallback = Arc<dyn Fn(&ComponentSchema) + Send + Sync>;
pub type SchemaUnpublishedCallback = Arc<dyn Fn(ComponentTypeHash) + Send + Sync>;
pub type SessionErrorCallback = Arc<dyn Fn(ErrorKind, &str) + Send + Sync>;

#[derive(Default)]
struct SessionCallbacks {
    handshake: Mutex<Option<HandshakeCallback>>,
    entity_created: Mutex<Option<EntityCreatedCallback>>,
    entity_destroyed: Mutex<Option<EntityDestroyedCallback>>,
    entity_parent_changed: Mutex<Option<EntityParentChangedCallback>>,
    property_registered: Mutex<Option<PropertyRegisteredCallback>>,
    property_changed: Mutex<Option<PropertyChangedCallback>>,
    schema_advertisement: Mutex<Option<SchemaAdvertisementCallback>>,
    schema_unpublished: Mutex<Option<SchemaUnpublishedCallback>>,
    error: Mutex<Option<SessionErrorCallback>>,
}

#[derive(Default)]
struct PeerInfo {
    client_type: String,
    client_id: String,
    negotiated_capabilities: u32,
    peer_protocol_version: u32,
}

#[derive(Default)]
struct SessionStats {
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    protocol_errors: AtomicU64,
}

pub struct Session {
    manager: Arc<ConnectionManager>,
    conn: ConnectionHandle,
    state: AtomicU8,
    peer: Mutex<PeerInfo>,
    callbacks: SessionCallbacks,
    properties: PropertyRegistry,
    advert_registry: Option<Arc<ComponentSchemaRegistry>>,
    stats: SessionStats,
    log: Logger,
}

impl Session {
    /// Builds a session over an existing connection. When a schema registry
    /// is bound, every currently-public schema is advertised to the peer the
    /// moment the session reaches `Ready`.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        manager: Arc<ConnectionManager>,
        conn: ConnectionHandle,
        advert_registry: Option<Arc<ComponentSchemaRegistry>>,
        log: L,
    ) -> Session {
        let log = logging::child(log);
        Session {
            manager,
            conn,
            state: AtomicU8::new(SessionState::Init as u8),
            peer: Mutex::new(PeerInfo::default()),
            callbacks: SessionCallbacks::default(),
            properties: PropertyRegistry::new(&log),
            advert_registry,
            stats: SessionStats::default(),
            log,
        }
    }

    #[inline]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn is_ready(&self) -> bool {
        self.state() == SessionState::Ready
    }

    pub fn connection(&self) -> ConnectionHandle {
        self.conn
    }

    /// The session's local property registry, used to validate outbound
    /// property updates.
    pub fn property_registry(&self) -> &PropertyRegistry {
        &self.properties
    }

    /// Negotiated capability set; zero until the handshake completes.
    pub fn negotiated_capabilities(&self) -> u32 {
        self.peer.lock().unwrap().negotiated_capabilities
    }

    /// Peer identity as stored during the handshake.
    pub fn peer_identity(&self) -> (String, String) {
        let peer = self.peer.lock().unwrap();
        (peer.client_type.clone(), peer.client_id.clone())
    }

    /// Counters for frames sent, frames received, and protocol errors.
    pub fn frame_stats(&self) -> (u64, u64, u64) {
        (
            self.stats.frames_sent.load(Ordering::Relaxed),
            self.stats.frames_received.load(Ordering::Relaxed),
            self.stats.protocol_errors.load(Ordering::Relaxed),
        )
    }

    // Callback installation ------------------------------------------------

    pub fn set_handshake_callback(&self, callback: HandshakeCallback) {
        *self.callbacks.handshake.lock().unwrap() = Some(callback);
    }

    pub fn set_entity_created_callback(&self, callback: EntityCreatedCallback) {
        *self.callbacks.entity_created.lock().unwrap() = Some(callback);
    }

    pub fn set_entity_destroyed_callback(&self, callback: EntityDestroyedCallback) {
        *self.callbacks.entity_destroyed.lock().unwrap() = Some(callback);
    }

    pub fn set_entity_parent_changed_callback(&self, callback: EntityParentChangedCallback) {
        *self.callbacks.entity_parent_changed.lock().unwrap() = Some(callback);
    }

    pub fn set_property_registered_callback(&self, callback: PropertyRegisteredCallback) {
        *self.callbacks.property_registered.lock().unwrap() = Some(callback);
    }

    pub fn set_property_changed_callback(&self, callback: PropertyChangedCallback) {
        *self.callbacks.property_changed.lock().unwrap() = Some(callback);
    }

    pub fn set_schema_advertisement_callback(&self, callback: SchemaAdvertisementCallback) {
        *self.callbacks.schema_advertisement.lock().unwrap() = Some(callback);
    }

    pub fn set_schema_unpublished_callback(&self, callback: SchemaUnpublishedCallback) {
        *self.callbacks.schema_unpublished.lock().unwrap() = Some(callback);
    }

    pub fn set_error_callback(&self, callback: SessionErrorCallback) {
        *self.callbacks.error.lock().unwrap() = Some(callback);
    }

    // Handshake ------------------------------------------------------------

    /// Client side: sends `HandshakeInit` and moves to
    /// `HandshakeInProgress`. Completion is signalled through the handshake
    /// callback when the response arrives.
    pub fn perform_handshake(&self, client_type: &str, client_id: &str) -> NetResult<()> {
        let flipped = self.state.compare_exchange(
            SessionState::Init as u8,
            SessionState::HandshakeInProgress as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        if flipped.is_err() {
            return Err(Error::invalid_parameter("Handshake already started"));
        }

        {
            let mut peer = self.peer.lock().unwrap();
            peer.client_type = client_type.to_string();
            peer.client_id = client_id.to_string();
        }

        logging::debug!(self.log, "handshake initiated";
                        "client_type" => client_type,
                        "client_id" => client_id);

        let init = Message::HandshakeInit {
            protocol_version: PROTOCOL_VERSION,
            client_type: client_type.to_string(),
            client_id: client_id.to_string(),
            capabilities: LOCAL_CAPABILITIES,
        };

        if let Err(err) = self.send_frame(&init) {
            self.state.store(SessionState::Disconnected as u8, Ordering::Release);
            return Err(err);
        }

        Ok(())
    }

    // Application sends ----------------------------------------------------

    pub fn send_entity_created(
        &self,
        entity_id: EntityId,
        app_id: &str,
        type_name: &str,
        parent_id: EntityId,
    ) -> NetResult<()> {
        self.ensure_ready()?;
        self.send_frame(&Message::EntityCreated {
            entity_id,
            app_id: app_id.to_string(),
            type_name: type_name.to_string(),
            parent_id,
        })
    }

    pub fn send_entity_destroyed(&self, entity_id: EntityId) -> NetResult<()> {
        self.ensure_ready()?;
        self.send_frame(&Message::EntityDestroyed { entity_id })
    }

    pub fn send_entity_parent_changed(&self, entity_id: EntityId, new_parent_id: EntityId) -> NetResult<()> {
        self.ensure_ready()?;
        self.send_frame(&Message::EntityParentChanged {
            entity_id,
            new_parent_id,
        })
    }

    /// Registers the property in the session's local registry, then
    /// announces it to the peer.
    pub fn send_property_registered(&self, hash: PropertyHash, metadata: PropertyMetadata) -> NetResult<()> {
        self.ensure_ready()?;
        self.properties.register_property(metadata.clone())?;
        self.send_frame(&Message::PropertyRegistered { hash, metadata })
    }

    /// Sends one property update, validating the value against the local
    /// registry first.
    pub fn send_property_changed(&self, hash: PropertyHash, value: PropertyValue) -> NetResult<()> {
        self.ensure_ready()?;
        self.properties.validate_property_value(hash, &value)?;
        self.send_frame(&Message::PropertyChanged { hash, value })
    }

    /// Sends a batch of property updates as one atomic frame. Every entry is
    /// validated before anything is sent.
    pub fn send_property_batch(&self, entries: Vec<(PropertyHash, PropertyValue)>) -> NetResult<()> {
        self.ensure_ready()?;
        for (hash, value) in &entries {
            self.properties.validate_property_value(*hash, value)?;
        }

        self.send_frame(&Message::PropertyBatch(PropertyBatch {
            timestamp: time::timestamp_millis(),
            entries,
            decode_error: None,
        }))
    }

    pub fn send_schema_advertisement(&self, schema: &ComponentSchema) -> NetResult<()> {
        self.ensure_ready()?;
        self.send_frame(&Message::SchemaAdvertisement {
            schema: schema.clone(),
        })
    }

    pub fn send_schema_unpublished(&self, type_hash: ComponentTypeHash) -> NetResult<()> {
        self.ensure_ready()?;
        self.send_frame(&Message::SchemaUnpublished { type_hash })
    }

    // Inbound dispatch -----------------------------------------------------

    /// Entry point for the connection's message callback: parses one frame
    /// payload and dispatches it.
    pub fn handle_frame(&self, payload: &[u8]) {
        self.stats.frames_received.fetch_add(1, Ordering::Relaxed);

        match Message::decode(payload) {
            Ok(message) => self.dispatch(message),
            Err(err) => {
                logging::warn!(self.log, "malformed frame"; "error" => %err);
                self.protocol_error(err.kind(), &err.message, false);
            }
        }
    }

    fn dispatch(&self, message: Message) {
        match message {
            Message::HandshakeInit {
                protocol_version,
                client_type,
                client_id,
                capabilities,
            } => self.on_handshake_init(protocol_version, client_type, client_id, capabilities),
            Message::HandshakeResponse {
                protocol_version,
                capabilities,
            } => self.on_handshake_response(protocol_version, capabilities),
            Message::EntityCreated {
                entity_id,
                app_id,
                type_name,
                parent_id,
            } => {
                let callback = self.callbacks.entity_created.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(entity_id, &app_id, &type_name, parent_id);
                }
            }
            Message::EntityDestroyed { entity_id } => {
                let callback = self.callbacks.entity_destroyed.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(entity_id);
                }
            }
            Message::EntityParentChanged {
                entity_id,
                new_parent_id,
            } => {
                let callback = self.callbacks.entity_parent_changed.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(entity_id, new_parent_id);
                }
            }
            Message::PropertyRegistered { hash, metadata } => {
                // Mirror the peer's registration so inbound updates can be
                // validated and diagnosed locally.
                if let Err(err) = self.properties.register_property(metadata.clone()) {
                    logging::warn!(self.log, "peer property registration rejected"; "error" => %err);
                }
                let callback = self.callbacks.property_registered.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(hash, &metadata);
                }
            }
            Message::PropertyChanged { hash, value } => {
                let callback = self.callbacks.property_changed.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(hash, &value);
                }
            }
            Message::PropertyBatch(batch) => {
                let callback = self.callbacks.property_changed.lock().unwrap().clone();
                if let Some(callback) = callback {
                    for (hash, value) in &batch.entries {
                        callback(*hash, value);
                    }
                }

                if let Some(err) = batch.decode_error {
                    self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);
                    self.fire_error(err.kind(), &err.message);
                }
            }
            Message::SchemaAdvertisement { schema } => {
                if !self.is_ready() {
                    logging::debug!(self.log, "schema advertisement dropped before ready";
                                    "component" => &schema.component_name);
                    return;
                }
                let callback = self.callbacks.schema_advertisement.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(&schema);
                }
            }
            Message::SchemaUnpublished { type_hash } => {
                let callback = self.callbacks.schema_unpublished.lock().unwrap().clone();
                if let Some(callback) = callback {
                    callback(type_hash);
                }
            }
            Message::Error { kind, message } => {
                logging::warn!(self.log, "peer reported error";
                               "kind" => kind.as_str(),
                               "message" => &message);
                let during_handshake = self.state() == SessionState::HandshakeInProgress;
                if during_handshake {
                    self.state.store(SessionState::Disconnected as u8, Ordering::Release);
                }
                self.fire_error(kind, &message);
            }
        }
    }

    fn on_handshake_init(&self, protocol_version: u32, client_type: String, client_id: String, capabilities: u32) {
        if self.state() != SessionState::Init {
            // Duplicate init, or an init where a response belongs.
            self.protocol_error(ErrorKind::HandshakeFailed, "Unexpected HandshakeInit", true);
            return;
        }

        if protocol_version != PROTOCOL_VERSION {
            self.protocol_error(
                ErrorKind::HandshakeFailed,
                &format!("Unsupported protocol version {}", protocol_version),
                true,
            );
            return;
        }

        let negotiated = capabilities & LOCAL_CAPABILITIES;
        {
            let mut peer = self.peer.lock().unwrap();
            peer.client_type = client_type.clone();
            peer.client_id = client_id.clone();
            peer.negotiated_capabilities = negotiated;
            peer.peer_protocol_version = protocol_version;
        }

        let response = Message::HandshakeResponse {
            protocol_version: PROTOCOL_VERSION,
            capabilities: negotiated,
        };
        if let Err(err) = self.send_frame(&response) {
            self.protocol_error(ErrorKind::NetworkError, &err.message, false);
            return;
        }

        self.state.store(SessionState::Ready as u8, Ordering::Release);
        logging::info!(self.log, "handshake accepted";
                       "client_type" => &client_type,
                       "client_id" => &client_id,
                       "capabilities" => negotiated);

        let callback = self.callbacks.handshake.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&client_type, &client_id);
        }

        self.advertise_public_schemas();
    }

    fn on_handshake_response(&self, protocol_version: u32, capabilities: u32) {
        if self.state() != SessionState::HandshakeInProgress {
            self.protocol_error(ErrorKind::HandshakeFailed, "Unexpected HandshakeResponse", true);
            return;
        }

        let (client_type, client_id) = {
            let mut peer = self.peer.lock().unwrap();
            peer.negotiated_capabilities = capabilities;
            peer.peer_protocol_version = protocol_version;
            (peer.client_type.clone(), peer.client_id.clone())
        };

        self.state.store(SessionState::Ready as u8, Ordering::Release);
        logging::info!(self.log, "handshake complete";
                       "server_version" => protocol_version,
                       "capabilities" => capabilities);

        let callback = self.callbacks.handshake.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(&client_type, &client_id);
        }

        self.advertise_public_schemas();
    }

    /// Sends one advertisement per currently-public schema of the bound
    /// registry. Order is whatever the registry snapshot yields.
    fn advertise_public_schemas(&self) {
        let registry = match &self.advert_registry {
            Some(registry) => registry,
            None => return,
        };

        for schema in registry.public_schemas() {
            if let Err(err) = self.send_schema_advertisement(&schema) {
                logging::warn!(self.log, "schema auto-advertisement failed";
                               "component" => &schema.component_name,
                               "error" => %err);
            }
        }
    }

    fn ensure_ready(&self) -> NetResult<()> {
        if self.state() != SessionState::Ready {
            return Err(Error::handshake_failed("Handshake not complete"));
        }
        Ok(())
    }

    /// Encodes and sends one message. Transport failures surface as
    /// `NetworkError` results; the session state is left to the connection's
    /// state callback.
    fn send_frame(&self, message: &Message) -> NetResult<()> {
        let payload = message.encode()?;
        self.manager
            .send(&self.conn, &payload)
            .map_err(|err| Error::network(err.to_string()))?;
        self.stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn fire_error(&self, kind: ErrorKind, message: &str) {
        let callback = self.callbacks.error.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(kind, message);
        }
    }

    /// Handles an unrecoverable protocol violation: optionally notifies the
    /// peer, fires the error callback, and tears the session down.
    fn protocol_error(&self, kind: ErrorKind, message: &str, notify_peer: bool) {
        self.stats.protocol_errors.fetch_add(1, Ordering::Relaxed);

        if notify_peer {
            let frame = Message::Error {
                kind,
                message: message.to_string(),
            };
            if let Err(err) = self.send_frame(&frame) {
                logging::debug!(self.log, "error notification not sent"; "error" => %err);
            }
        }

        self.fire_error(kind, message);
        self.state.store(SessionState::Disconnected as u8, Ordering::Release);
        let _ = self.manager.disconnect(&self.conn);
    }
}
