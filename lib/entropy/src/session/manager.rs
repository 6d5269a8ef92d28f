//! Slot-based session manager, parallel in shape to the connection manager.
//!
//! Sessions are reached through generation-stamped handles. The transport's
//! message callback carries only a weak manager reference plus (index,
//! generation); inbound dispatch re-validates through the slot table, so no
//! strong ownership cycle runs through the backend. When a schema registry
//! is bound, publish/unpublish events are broadcast to every `Ready`
//! session.

use crate::error::{Error, ErrorKind, NetResult};
use crate::hash::{ComponentTypeHash, PropertyHash};
use crate::net::manager::{ConnectionHandle, ConnectionManager};
use crate::property::{EntityId, PropertyMetadata, PropertyValue};
use crate::schema::ComponentSchema;
use crate::schema_registry::ComponentSchemaRegistry;
use crate::session::session::{
    EntityCreatedCallback, EntityDestroyedCallback, EntityParentChangedCallback, HandshakeCallback,
    PropertyChangedCallback, PropertyRegisteredCallback, SchemaAdvertisementCallback,
    SchemaUnpublishedCallback, Session, SessionErrorCallback, SessionState,
};
use crate::slots::{FreeList, INVALID_INDEX};
use enthalpy::logging::{self, Logger};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_SESSION_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Generation-stamped reference to a session slot.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct SessionHandle {
    owner: u64,
    index: u32,
    generation: u32,
}

impl SessionHandle {
    pub fn invalid() -> SessionHandle {
        SessionHandle {
            owner: 0,
            index: INVALID_INDEX,
            generation: 0,
        }
    }

    #[inline]
    pub fn valid(&self) -> bool {
        self.owner != 0 && self.index != INVALID_INDEX
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl Default for SessionHandle {
    fn default() -> SessionHandle {
        SessionHandle::invalid()
    }
}

struct SessionSlot {
    generation: AtomicU32,
    next_free: AtomicU32,
    session: Mutex<Option<Arc<Session>>>,
}

struct SessionTable {
    id: u64,
    conn_manager: Arc<ConnectionManager>,
    registry: Option<Arc<ComponentSchemaRegistry>>,
    capacity: usize,
    slots: Vec<SessionSlot>,
    free: FreeList,
    active: AtomicUsize,
    log: Logger,
}

impl SessionTable {
    /// Resolves (index, generation) to a live session, if the slot has not
    /// been reused since the reference was taken.
    fn session_at(&self, index: u32, generation: u32) -> Option<Arc<Session>> {
        if index >= self.capacity as u32 {
            return None;
        }

        let slot = &self.slots[index as usize];
        if slot.generation.load(Ordering::Acquire) != generation {
            return None;
        }

        let session = slot.session.lock().unwrap().clone();
        // Re-check after cloning: a concurrent close may have bumped the
        // generation while the lock was being taken.
        if slot.generation.load(Ordering::Acquire) != generation {
            return None;
        }
        session
    }

    /// Sends one frame-producing action to every Ready session, revalidating
    /// each slot's generation around the send.
    fn for_each_ready<F: Fn(&Session)>(&self, action: F) {
        for slot in &self.slots {
            let generation = slot.generation.load(Ordering::Acquire);
            let session = slot.session.lock().unwrap().clone();

            if let Some(session) = session {
                if slot.generation.load(Ordering::Acquire) == generation && session.is_ready() {
                    action(&session);
                }
            }
        }
    }

    fn broadcast_advertisement(&self, schema: &ComponentSchema) {
        logging::debug!(self.log, "broadcasting schema advertisement";
                        "component" => &schema.component_name);
        self.for_each_ready(|session| {
            if let Err(err) = session.send_schema_advertisement(schema) {
                logging::warn!(self.log, "schema broadcast failed"; "error" => %err);
            }
        });
    }

    fn broadcast_unpublished(&self, type_hash: ComponentTypeHash) {
        logging::debug!(self.log, "broadcasting schema unpublish"; "type_hash" => %type_hash);
        self.for_each_ready(|session| {
            if let Err(err) = session.send_schema_unpublished(type_hash) {
                logging::warn!(self.log, "unpublish broadcast failed"; "error" => %err);
            }
        });
    }
}

pub struct SessionManager {
    table: Arc<SessionTable>,
}

impl SessionManager {
    /// Builds a manager with `capacity` session slots over the given
    /// connection manager. When `registry` is supplied the manager
    /// subscribes to its publish/unpublish events and broadcasts them to
    /// every Ready session; sessions created here also auto-advertise the
    /// registry's public schemas when their handshake completes.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(
        conn_manager: Arc<ConnectionManager>,
        capacity: usize,
        registry: Option<Arc<ComponentSchemaRegistry>>,
        log: L,
    ) -> SessionManager {
        let slots = (0..capacity)
            .map(|i| SessionSlot {
                generation: AtomicU32::new(1),
                next_free: AtomicU32::new(if i + 1 < capacity { (i + 1) as u32 } else { INVALID_INDEX }),
                session: Mutex::new(None),
            })
            .collect();

        let table = Arc::new(SessionTable {
            id: NEXT_SESSION_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            conn_manager,
            registry: registry.clone(),
            capacity,
            slots,
            free: FreeList::with_all_free(capacity),
            active: AtomicUsize::new(0),
            log: logging::child(log),
        });

        if let Some(registry) = registry {
            let weak = Arc::downgrade(&table);
            registry.set_schema_published_callback(Arc::new(move |_type_hash, schema: &ComponentSchema| {
                if let Some(table) = weak.upgrade() {
                    table.broadcast_advertisement(schema);
                }
            }));

            let weak = Arc::downgrade(&table);
            registry.set_schema_unpublished_callback(Arc::new(move |type_hash| {
                if let Some(table) = weak.upgrade() {
                    table.broadcast_unpublished(type_hash);
                }
            }));
        }

        SessionManager { table }
    }

    pub fn schema_registry(&self) -> Option<&Arc<ComponentSchemaRegistry>> {
        self.table.registry.as_ref()
    }

    /// Wraps a connection in a new session and wires the connection's
    /// message callback to the session's frame dispatch.
    pub fn create_session(&self, conn: &ConnectionHandle) -> NetResult<SessionHandle> {
        if !self.table.conn_manager.is_valid_handle(conn) {
            return Err(Error::invalid_parameter("Invalid connection handle"));
        }

        let index = self
            .table
            .free
            .pop(|i| self.table.slots[i as usize].next_free.load(Ordering::Acquire))
            .ok_or_else(|| Error::new(ErrorKind::ResourceLimitExceeded, "Session table is full"))?;
        self.table.active.fetch_add(1, Ordering::AcqRel);

        let slot = &self.table.slots[index as usize];
        let generation = slot.generation.load(Ordering::Acquire);

        let session = Arc::new(Session::new(
            self.table.conn_manager.clone(),
            *conn,
            self.table.registry.clone(),
            &self.table.log,
        ));
        *slot.session.lock().unwrap() = Some(session);

        // The transport callback holds only (weak table, index, generation);
        // dispatch re-validates through the slot table.
        let weak = Arc::downgrade(&self.table);
        let wired = self.table.conn_manager.set_message_callback(
            conn,
            Arc::new(move |payload: &[u8]| {
                if let Some(table) = weak.upgrade() {
                    if let Some(session) = table.session_at(index, generation) {
                        session.handle_frame(payload);
                    }
                }
            }),
        );

        if let Err(err) = wired {
            *slot.session.lock().unwrap() = None;
            self.return_slot(index);
            return Err(err);
        }

        logging::debug!(self.table.log, "session created"; "slot" => index);

        Ok(SessionHandle {
            owner: self.table.id,
            index,
            generation,
        })
    }

    /// Drops the session and frees its slot. The underlying connection is
    /// left open; closing it is the application's responsibility.
    pub fn close_session(&self, handle: &SessionHandle) -> NetResult<()> {
        self.checked_slot(handle)?;

        let slot = &self.table.slots[handle.index as usize];
        let session = slot.session.lock().unwrap().take();
        if session.is_none() {
            return Ok(()); // another closer won the race
        }
        drop(session);

        self.return_slot(handle.index);
        logging::debug!(self.table.log, "session closed"; "slot" => handle.index);
        Ok(())
    }

    pub fn is_valid_handle(&self, handle: &SessionHandle) -> bool {
        self.checked_slot(handle).is_ok()
    }

    /// The session behind a handle, for direct use of the full session API.
    pub fn session(&self, handle: &SessionHandle) -> NetResult<Arc<Session>> {
        self.checked_slot(handle)?;
        self.table
            .session_at(handle.index, handle.generation)
            .ok_or_else(|| Error::invalid_parameter("Invalid session handle"))
    }

    pub fn session_state(&self, handle: &SessionHandle) -> SessionState {
        match self.session(handle) {
            Ok(session) => session.state(),
            Err(_) => SessionState::Disconnected,
        }
    }

    pub fn is_ready(&self, handle: &SessionHandle) -> bool {
        self.session_state(handle) == SessionState::Ready
    }

    pub fn get_connection(&self, handle: &SessionHandle) -> NetResult<ConnectionHandle> {
        Ok(self.session(handle)?.connection())
    }

    pub fn perform_handshake(&self, handle: &SessionHandle, client_type: &str, client_id: &str) -> NetResult<()> {
        self.session(handle)?.perform_handshake(client_type, client_id)
    }

    // Per-tag user callbacks ----------------------------------------------

    pub fn set_handshake_callback(&self, handle: &SessionHandle, callback: HandshakeCallback) -> NetResult<()> {
        self.session(handle)?.set_handshake_callback(callback);
        Ok(())
    }

    pub fn set_entity_created_callback(
        &self,
        handle: &SessionHandle,
        callback: EntityCreatedCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_entity_created_callback(callback);
        Ok(())
    }

    pub fn set_entity_destroyed_callback(
        &self,
        handle: &SessionHandle,
        callback: EntityDestroyedCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_entity_destroyed_callback(callback);
        Ok(())
    }

    pub fn set_entity_parent_changed_callback(
        &self,
        handle: &SessionHandle,
        callback: EntityParentChangedCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_entity_parent_changed_callback(callback);
        Ok(())
    }

    pub fn set_property_registered_callback(
        &self,
        handle: &SessionHandle,
        callback: PropertyRegisteredCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_property_registered_callback(callback);
        Ok(())
    }

    pub fn set_property_changed_callback(
        &self,
        handle: &SessionHandle,
        callback: PropertyChangedCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_property_changed_callback(callback);
        Ok(())
    }

    pub fn set_schema_advertisement_callback(
        &self,
        handle: &SessionHandle,
        callback: SchemaAdvertisementCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_schema_advertisement_callback(callback);
        Ok(())
    }

    pub fn set_schema_unpublished_callback(
        &self,
        handle: &SessionHandle,
        callback: SchemaUnpublishedCallback,
    ) -> NetResult<()> {
        self.session(handle)?.set_schema_unpublished_callback(callback);
        Ok(())
    }

    pub fn set_error_callback(&self, handle: &SessionHandle, callback: SessionErrorCallback) -> NetResult<()> {
        self.session(handle)?.set_error_callback(callback);
        Ok(())
    }

    // Send passthroughs ----------------------------------------------------

    pub fn send_entity_created(
        &self,
        handle: &SessionHandle,
        entity_id: EntityId,
        app_id: &str,
        type_name: &str,
        parent_id: EntityId,
    ) -> NetResult<()> {
        self.session(handle)?
            .send_entity_created(entity_id, app_id, type_name, parent_id)
    }

    pub fn send_entity_destroyed(&self, handle: &SessionHandle, entity_id: EntityId) -> NetResult<()> {
        self.session(handle)?.send_entity_destroyed(entity_id)
    }

    pub fn send_entity_parent_changed(
        &self,
        handle: &SessionHandle,
        entity_id: EntityId,
        new_parent_id: EntityId,
    ) -> NetResult<()> {
        self.session(handle)?.send_entity_parent_changed(entity_id, new_parent_id)
    }

    pub fn send_property_registered(
        &self,
        handle: &SessionHandle,
        hash: PropertyHash,
        metadata: PropertyMetadata,
    ) -> NetResult<()> {
        self.session(handle)?.send_property_registered(hash, metadata)
    }

    pub fn send_property_changed(
        &self,
        handle: &SessionHandle,
        hash: PropertyHash,
        value: PropertyValue,
    ) -> NetResult<()> {
        self.session(handle)?.send_property_changed(hash, value)
    }

    pub fn send_property_batch(
        &self,
        handle: &SessionHandle,
        entries: Vec<(PropertyHash, PropertyValue)>,
    ) -> NetResult<()> {
        self.session(handle)?.send_property_batch(entries)
    }

    pub fn active_count(&self) -> usize {
        self.table.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.table.capacity
    }

    fn checked_slot(&self, handle: &SessionHandle) -> NetResult<()> {
        if handle.owner != self.table.id || handle.index >= self.table.capacity as u32 {
            return Err(Error::invalid_parameter("Invalid session handle"));
        }

        let slot = &self.table.slots[handle.index as usize];
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return Err(Error::invalid_parameter("Invalid session handle"));
        }

        Ok(())
    }

    fn return_slot(&self, index: u32) {
        let slot = &self.table.slots[index as usize];
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.table.active.fetch_sub(1, Ordering::AcqRel);
        self.table.free.push(index, |i, next| {
            self.table.slots[i as usize].next_free.store(next, Ordering::Release)
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ConnectionType};
    use crate::hash::compute_property_hash;
    use crate::net::unix::UnixSocketConnection;
    use crate::property::{PropertyType, Vec3};
    use crate::schema::PropertyDefinition;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::Duration;

    fn wait_for<F: Fn() -> bool>(predicate: F) -> bool {
        for _ in 0..200 {
            if predicate() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        predicate()
    }

    struct Rig {
        conn_mgr: Arc<ConnectionManager>,
        server_sessions: SessionManager,
        client_sessions: SessionManager,
        server_session: SessionHandle,
        client_session: SessionHandle,
    }

    /// Builds two sessions over a connected socket pair: the "server" side
    /// carries the supplied schema registry.
    fn rig(registry: Option<Arc<ComponentSchemaRegistry>>) -> Rig {
        let conn_mgr = Arc::new(ConnectionManager::new(8, None));

        let (a, b) = UnixStream::pair().unwrap();
        let config = ConnectionConfig::local("pair");
        let server_backend = UnixSocketConnection::from_accepted(a.into_raw_fd(), "server", &config, None).unwrap();
        let client_backend = UnixSocketConnection::from_accepted(b.into_raw_fd(), "client", &config, None).unwrap();

        let server_conn = conn_mgr
            .adopt_connection(Box::new(server_backend), ConnectionType::Local)
            .unwrap();
        let client_conn = conn_mgr
            .adopt_connection(Box::new(client_backend), ConnectionType::Local)
            .unwrap();

        let server_sessions = SessionManager::new(conn_mgr.clone(), 8, registry, None);
        let client_sessions = SessionManager::new(conn_mgr.clone(), 8, None, None);

        let server_session = server_sessions.create_session(&server_conn).unwrap();
        let client_session = client_sessions.create_session(&client_conn).unwrap();

        Rig {
            conn_mgr,
            server_sessions,
            client_sessions,
            server_session,
            client_session,
        }
    }

    fn handshake(rig: &Rig) {
        rig.client_sessions
            .perform_handshake(&rig.client_session, "TestClient", "client-001")
            .unwrap();

        assert!(wait_for(|| {
            rig.client_sessions.is_ready(&rig.client_session) && rig.server_sessions.is_ready(&rig.server_session)
        }));
    }

    fn test_schema(name: &str) -> ComponentSchema {
        ComponentSchema::create(
            "TestSchemaApp",
            name,
            1,
            vec![
                PropertyDefinition::new("position", PropertyType::Vec3, 0, 12),
                PropertyDefinition::new("rotation", PropertyType::Quat, 12, 16),
            ],
            28,
            false,
        )
        .unwrap()
    }

    #[test]
    fn test_client_handshake_server_auto_responds() {
        let rig = rig(None);

        let completions = Arc::new(AtomicUsize::new(0));
        let c = completions.clone();
        rig.server_sessions
            .set_handshake_callback(
                &rig.server_session,
                Arc::new(move |client_type: &str, client_id: &str| {
                    assert_eq!(client_type, "TestClient");
                    assert_eq!(client_id, "client-001");
                    c.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        handshake(&rig);
        assert_eq!(completions.load(Ordering::SeqCst), 1);

        // The server stored the client identity from the init frame.
        let session = rig.server_sessions.session(&rig.server_session).unwrap();
        assert_eq!(session.peer_identity(), ("TestClient".to_string(), "client-001".to_string()));
    }

    #[test]
    fn test_messages_blocked_before_handshake() {
        let rig = rig(None);

        let delivered = Arc::new(AtomicUsize::new(0));
        let d = delivered.clone();
        rig.server_sessions
            .set_entity_created_callback(
                &rig.server_session,
                Arc::new(move |_, _: &str, _: &str, _| {
                    d.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let err = rig
            .client_sessions
            .send_entity_created(&rig.client_session, 123, "TestApp", "TestEntity", 0)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::HandshakeFailed);

        thread::sleep(Duration::from_millis(100));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_bidirectional_entity_messages_after_handshake() {
        let rig = rig(None);

        let server_seen = Arc::new(Mutex::new(Vec::new()));
        let client_seen = Arc::new(Mutex::new(Vec::new()));

        let s = server_seen.clone();
        rig.server_sessions
            .set_entity_created_callback(
                &rig.server_session,
                Arc::new(move |entity_id, _: &str, _: &str, _| {
                    s.lock().unwrap().push(entity_id);
                }),
            )
            .unwrap();
        let c = client_seen.clone();
        rig.client_sessions
            .set_entity_created_callback(
                &rig.client_session,
                Arc::new(move |entity_id, _: &str, _: &str, _| {
                    c.lock().unwrap().push(entity_id);
                }),
            )
            .unwrap();

        handshake(&rig);

        rig.client_sessions
            .send_entity_created(&rig.client_session, 1001, "ClientApp", "ClientEntity", 0)
            .unwrap();
        rig.server_sessions
            .send_entity_created(&rig.server_session, 2002, "ServerApp", "ServerEntity", 0)
            .unwrap();

        assert!(wait_for(|| {
            !server_seen.lock().unwrap().is_empty() && !client_seen.lock().unwrap().is_empty()
        }));
        assert_eq!(server_seen.lock().unwrap()[0], 1001);
        assert_eq!(client_seen.lock().unwrap()[0], 2002);
    }

    #[test]
    fn test_schema_broadcast_on_handshake() {
        let registry = Arc::new(ComponentSchemaRegistry::new(None));

        // Register and publish before any client connects.
        let schema = test_schema("Broadcast");
        registry.register_schema(schema.clone()).unwrap();
        registry.publish_schema(schema.type_hash).unwrap();

        let rig = rig(Some(registry));

        let advertised = Arc::new(Mutex::new(Vec::new()));
        let a = advertised.clone();
        rig.client_sessions
            .set_schema_advertisement_callback(
                &rig.client_session,
                Arc::new(move |schema: &ComponentSchema| {
                    a.lock().unwrap().push(schema.type_hash);
                }),
            )
            .unwrap();

        handshake(&rig);

        assert!(wait_for(|| !advertised.lock().unwrap().is_empty()));
        thread::sleep(Duration::from_millis(100));

        // Exactly one advertisement, carrying the registered type hash.
        let advertised = advertised.lock().unwrap();
        assert_eq!(advertised.len(), 1);
        assert_eq!(advertised[0], schema.type_hash);
    }

    #[test]
    fn test_publish_broadcasts_to_ready_sessions() {
        let registry = Arc::new(ComponentSchemaRegistry::new(None));
        let rig = rig(Some(registry.clone()));

        let advertised = Arc::new(Mutex::new(Vec::new()));
        let unpublished = Arc::new(Mutex::new(Vec::new()));

        let a = advertised.clone();
        rig.client_sessions
            .set_schema_advertisement_callback(
                &rig.client_session,
                Arc::new(move |schema: &ComponentSchema| {
                    a.lock().unwrap().push(schema.type_hash);
                }),
            )
            .unwrap();
        let u = unpublished.clone();
        rig.client_sessions
            .set_schema_unpublished_callback(
                &rig.client_session,
                Arc::new(move |type_hash| {
                    u.lock().unwrap().push(type_hash);
                }),
            )
            .unwrap();

        handshake(&rig);

        let schema = test_schema("LiveBroadcast");
        registry.register_schema(schema.clone()).unwrap();
        registry.publish_schema(schema.type_hash).unwrap();

        assert!(wait_for(|| !advertised.lock().unwrap().is_empty()));
        assert_eq!(advertised.lock().unwrap()[0], schema.type_hash);

        registry.unpublish_schema(schema.type_hash).unwrap();
        assert!(wait_for(|| !unpublished.lock().unwrap().is_empty()));
        assert_eq!(unpublished.lock().unwrap()[0], schema.type_hash);

        // One broadcast per event: the idempotent re-publish is silent.
        registry.publish_schema(schema.type_hash).unwrap();
        registry.publish_schema(schema.type_hash).unwrap();
        assert!(wait_for(|| advertised.lock().unwrap().len() == 2));
        thread::sleep(Duration::from_millis(100));
        assert_eq!(advertised.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_property_flow_with_validation() {
        let rig = rig(None);
        handshake(&rig);

        let hash = compute_property_hash(42, "Transform", "position");
        let metadata = PropertyMetadata::new(hash, 42, "Transform", "position", PropertyType::Vec3, 1);

        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        rig.server_sessions
            .set_property_changed_callback(
                &rig.server_session,
                Arc::new(move |hash, value: &PropertyValue| {
                    c.lock().unwrap().push((hash, value.clone()));
                }),
            )
            .unwrap();

        // Unregistered sends are rejected locally.
        let err = rig
            .client_sessions
            .send_property_changed(&rig.client_session, hash, PropertyValue::Vec3(Vec3::new(1.0, 2.0, 3.0)))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::UnknownProperty);

        rig.client_sessions
            .send_property_registered(&rig.client_session, hash, metadata)
            .unwrap();

        // A mistyped value is rejected locally.
        let err = rig
            .client_sessions
            .send_property_changed(&rig.client_session, hash, PropertyValue::Int32(1))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TypeMismatch);

        rig.client_sessions
            .send_property_changed(&rig.client_session, hash, PropertyValue::Vec3(Vec3::new(1.0, 2.0, 3.0)))
            .unwrap();

        assert!(wait_for(|| !changes.lock().unwrap().is_empty()));
        let changes = changes.lock().unwrap();
        assert_eq!(changes[0].0, hash);
        assert_eq!(changes[0].1, PropertyValue::Vec3(Vec3::new(1.0, 2.0, 3.0)));
    }

    #[test]
    fn test_property_batch_flow() {
        let rig = rig(None);
        handshake(&rig);

        let x = compute_property_hash(7, "Player", "x");
        let y = compute_property_hash(7, "Player", "y");
        rig.client_sessions
            .send_property_registered(
                &rig.client_session,
                x,
                PropertyMetadata::new(x, 7, "Player", "x", PropertyType::Float32, 1),
            )
            .unwrap();
        rig.client_sessions
            .send_property_registered(
                &rig.client_session,
                y,
                PropertyMetadata::new(y, 7, "Player", "y", PropertyType::Float32, 1),
            )
            .unwrap();

        let changes = Arc::new(Mutex::new(Vec::new()));
        let c = changes.clone();
        rig.server_sessions
            .set_property_changed_callback(
                &rig.server_session,
                Arc::new(move |hash, value: &PropertyValue| {
                    c.lock().unwrap().push((hash, value.clone()));
                }),
            )
            .unwrap();

        rig.client_sessions
            .send_property_batch(
                &rig.client_session,
                vec![
                    (x, PropertyValue::Float32(1.0)),
                    (y, PropertyValue::Float32(2.0)),
                ],
            )
            .unwrap();

        assert!(wait_for(|| changes.lock().unwrap().len() == 2));
        let changes = changes.lock().unwrap();
        assert_eq!(changes[0], (x, PropertyValue::Float32(1.0)));
        assert_eq!(changes[1], (y, PropertyValue::Float32(2.0)));
    }

    #[test]
    fn test_duplicate_handshake_init_is_protocol_error() {
        let rig = rig(None);
        handshake(&rig);

        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = errors.clone();
        rig.server_sessions
            .set_error_callback(
                &rig.server_session,
                Arc::new(move |kind, _: &str| {
                    e.lock().unwrap().push(kind);
                }),
            )
            .unwrap();

        // Fire a second init at the server over the raw connection.
        let client_conn = rig.client_sessions.get_connection(&rig.client_session).unwrap();
        let dup = crate::proto::Message::HandshakeInit {
            protocol_version: crate::proto::PROTOCOL_VERSION,
            client_type: "TestClient".into(),
            client_id: "client-001".into(),
            capabilities: 0,
        };
        rig.conn_mgr.send(&client_conn, &dup.encode().unwrap()).unwrap();

        assert!(wait_for(|| !errors.lock().unwrap().is_empty()));
        assert_eq!(errors.lock().unwrap()[0], ErrorKind::HandshakeFailed);
        assert!(wait_for(|| {
            rig.server_sessions.session_state(&rig.server_session) == SessionState::Disconnected
        }));
    }

    #[test]
    fn test_close_session_invalidates_handle_but_keeps_connection() {
        let rig = rig(None);
        handshake(&rig);

        let conn = rig.client_sessions.get_connection(&rig.client_session).unwrap();
        assert_eq!(rig.client_sessions.active_count(), 1);

        rig.client_sessions.close_session(&rig.client_session).unwrap();

        assert!(!rig.client_sessions.is_valid_handle(&rig.client_session));
        assert_eq!(rig.client_sessions.active_count(), 0);
        assert!(rig.client_sessions.session(&rig.client_session).is_err());

        // The transport connection stays open and valid.
        assert!(rig.conn_mgr.is_valid_handle(&conn));
        assert!(rig.conn_mgr.is_connected(&conn));
    }

    #[test]
    fn test_create_session_rejects_invalid_connection() {
        let conn_mgr = Arc::new(ConnectionManager::new(4, None));
        let sessions = SessionManager::new(conn_mgr, 4, None, None);

        let err = sessions.create_session(&ConnectionHandle::invalid()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);
    }

    #[test]
    fn test_session_capacity_limit() {
        let conn_mgr = Arc::new(ConnectionManager::new(8, None));
        let sessions = SessionManager::new(conn_mgr.clone(), 1, None, None);

        let (a, b) = UnixStream::pair().unwrap();
        let config = ConnectionConfig::local("pair");
        let backend_a = UnixSocketConnection::from_accepted(a.into_raw_fd(), "a", &config, None).unwrap();
        let backend_b = UnixSocketConnection::from_accepted(b.into_raw_fd(), "b", &config, None).unwrap();
        let conn_a = conn_mgr.adopt_connection(Box::new(backend_a), ConnectionType::Local).unwrap();
        let conn_b = conn_mgr.adopt_connection(Box::new(backend_b), ConnectionType::Local).unwrap();

        let first = sessions.create_session(&conn_a).unwrap();
        let err = sessions.create_session(&conn_b).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceLimitExceeded);

        sessions.close_session(&first).unwrap();
        assert!(sessions.create_session(&conn_b).is_ok());
    }
}
