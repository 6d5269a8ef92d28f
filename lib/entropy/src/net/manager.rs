//! Slot-based connection manager.
//!
//! Owns every transport backend in a fixed-capacity slot table and hands out
//! generation-stamped handles. Slot allocation is lock-free (see
//! [`crate::slots`]); per-slot operations serialize on the slot's backend
//! mutex; observed connection state lives in an atomic the manager mirrors
//! from backend state callbacks.

use crate::config::{ConnectionBackend, ConnectionConfig, ConnectionType, SignalingCallbacks, WebRtcConfig};
use crate::error::{Error, ErrorKind, NetResult};
use crate::net::connection::{
    ConnectionState, ConnectionStats, MessageCallback, NetworkConnection, StateCallback,
};
use crate::slots::{FreeList, INVALID_INDEX};
use enthalpy::logging::{self, Logger};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

/// Generation-stamped reference to a connection slot. Copies stay cheap;
/// every copy is invalidated together when the connection closes.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct ConnectionHandle {
    owner: u64,
    index: u32,
    generation: u32,
}

impl ConnectionHandle {
    pub(crate) fn new(owner: u64, index: u32, generation: u32) -> ConnectionHandle {
        ConnectionHandle {
            owner,
            index,
            generation,
        }
    }

    pub fn invalid() -> ConnectionHandle {
        ConnectionHandle {
            owner: 0,
            index: INVALID_INDEX,
            generation: 0,
        }
    }

    /// Structural validity only; a true liveness check goes through
    /// [`ConnectionManager::is_valid_handle`].
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

    #[inline]
    pub(crate) fn owner(&self) -> u64 {
        self.owner
    }
}

impl Default for ConnectionHandle {
    fn default() -> ConnectionHandle {
        ConnectionHandle::invalid()
    }
}

/// Aggregate metrics snapshot across all connections of one manager.
/// Byte totals count message payloads.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ManagerMetrics {
    pub total_bytes_sent: u64,
    pub total_bytes_received: u64,
    pub total_messages_sent: u64,
    pub total_messages_received: u64,
    pub connections_opened: u64,
    pub connections_failed: u64,
    pub connections_closed: u64,
    pub would_block_sends: u64,
}

#[derive(Default)]
struct MetricsCounters {
    total_bytes_sent: AtomicU64,
    total_bytes_received: AtomicU64,
    total_messages_sent: AtomicU64,
    total_messages_received: AtomicU64,
    connections_opened: AtomicU64,
    connections_failed: AtomicU64,
    connections_closed: AtomicU64,
    would_block_sends: AtomicU64,
}

impl MetricsCounters {
    fn snapshot(&self) -> ManagerMetrics {
        ManagerMetrics {
            total_bytes_sent: self.total_bytes_sent.load(Ordering::Relaxed),
            total_bytes_received: self.total_bytes_received.load(Ordering::Relaxed),
            total_messages_sent: self.total_messages_sent.load(Ordering::Relaxed),
            total_messages_received: self.total_messages_received.load(Ordering::Relaxed),
            connections_opened: self.connections_opened.load(Ordering::Relaxed),
            connections_failed: self.connections_failed.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            would_block_sends: self.would_block_sends.load(Ordering::Relaxed),
        }
    }
}

/// State shared between a slot and the callbacks installed on its backend.
/// Callbacks hold only this shared cell, never the manager, so no ownership
/// cycle runs through the transport.
struct SlotShared {
    state: AtomicU8,
    message_cb: Mutex<Option<MessageCallback>>,
    state_cb: Mutex<Option<StateCallback>>,
}

impl SlotShared {
    fn new() -> SlotShared {
        SlotShared {
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            message_cb: Mutex::new(None),
            state_cb: Mutex::new(None),
        }
    }

    fn reset(&self) {
        self.state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
        *self.message_cb.lock().unwrap() = None;
        *self.state_cb.lock().unwrap() = None;
    }
}

struct Slot {
    generation: AtomicU32,
    next_free: AtomicU32,
    conn_type: AtomicU8,
    shared: Arc<SlotShared>,
    backend: Mutex<Option<Box<dyn NetworkConnection>>>,
}

pub struct ConnectionManager {
    id: u64,
    capacity: usize,
    slots: Vec<Slot>,
    free: FreeList,
    active: AtomicUsize,
    metrics: Arc<MetricsCounters>,
    log: Logger,
}

impl ConnectionManager {
    /// Builds a manager with all `capacity` slots pre-allocated for
    /// lock-free handout.
    pub fn new<'a, L: Into<Option<&'a Logger>>>(capacity: usize, log: L) -> ConnectionManager {
        let slots = (0..capacity)
            .map(|i| Slot {
                generation: AtomicU32::new(1),
                next_free: AtomicU32::new(if i + 1 < capacity { (i + 1) as u32 } else { INVALID_INDEX }),
                conn_type: AtomicU8::new(ConnectionType::Local as u8),
                shared: Arc::new(SlotShared::new()),
                backend: Mutex::new(None),
            })
            .collect();

        ConnectionManager {
            id: NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed),
            capacity,
            slots,
            free: FreeList::with_all_free(capacity),
            active: AtomicUsize::new(0),
            metrics: Arc::new(MetricsCounters::default()),
            log: logging::child(log),
        }
    }

    pub(crate) fn logger(&self) -> &Logger {
        &self.log
    }

    /// Opens a local connection with the platform-appropriate backend.
    pub fn open_local_connection(&self, endpoint: impl Into<String>) -> ConnectionHandle {
        self.open_connection(ConnectionConfig::local(endpoint))
    }

    /// Opens a remote peer-to-peer connection through the given signaling
    /// server.
    pub fn open_remote_connection(
        &self,
        signaling_server: impl Into<String>,
        config: WebRtcConfig,
        callbacks: SignalingCallbacks,
    ) -> ConnectionHandle {
        self.open_connection(ConnectionConfig::remote(signaling_server, config, callbacks))
    }

    /// Opens a connection with explicit configuration. Returns an invalid
    /// handle when the table is full (backpressure) or the backend cannot
    /// be constructed.
    pub fn open_connection(&self, config: ConnectionConfig) -> ConnectionHandle {
        let index = match self.allocate_slot() {
            Some(index) => index,
            None => return ConnectionHandle::invalid(),
        };

        let slot = &self.slots[index as usize];
        let generation = slot.generation.load(Ordering::Acquire);

        let backend = match self.create_backend(&config) {
            Ok(backend) => backend,
            Err(err) => {
                logging::warn!(self.log, "backend construction failed";
                               "endpoint" => &config.endpoint,
                               "error" => %err);
                self.metrics.connections_failed.fetch_add(1, Ordering::Relaxed);
                self.return_slot(index);
                return ConnectionHandle::invalid();
            }
        };

        self.install_backend(index, backend, config.connection_type);
        self.metrics.connections_opened.fetch_add(1, Ordering::Relaxed);

        ConnectionHandle::new(self.id, index, generation)
    }

    /// Installs a pre-constructed backend (used by `LocalServer::accept`)
    /// and returns its handle.
    pub fn adopt_connection(
        &self,
        backend: Box<dyn NetworkConnection>,
        conn_type: ConnectionType,
    ) -> NetResult<ConnectionHandle> {
        let index = self
            .allocate_slot()
            .ok_or_else(|| Error::new(ErrorKind::ResourceLimitExceeded, "Connection table is full"))?;

        let slot = &self.slots[index as usize];
        let generation = slot.generation.load(Ordering::Acquire);

        self.install_backend(index, backend, conn_type);
        self.metrics.connections_opened.fetch_add(1, Ordering::Relaxed);

        Ok(ConnectionHandle::new(self.id, index, generation))
    }

    /// Initiates the backend's connection. The state mirror installed at
    /// open time tracks every transition into the slot's atomic state.
    pub fn connect(&self, handle: &ConnectionHandle) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;

        let guard = slot.backend.lock().unwrap();
        let backend = guard
            .as_ref()
            .ok_or_else(|| Error::invalid_parameter("Connection not initialized"))?;

        let result = backend.connect();
        slot.shared.state.store(backend.state() as u8, Ordering::Release);

        if result.is_err() {
            self.metrics.connections_failed.fetch_add(1, Ordering::Relaxed);
        }

        result
    }

    pub fn disconnect(&self, handle: &ConnectionHandle) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;

        let guard = slot.backend.lock().unwrap();
        let backend = match guard.as_ref() {
            Some(backend) => backend,
            None => return Ok(()), // already torn down
        };

        let result = backend.disconnect();
        slot.shared
            .state
            .store(ConnectionState::Disconnected as u8, Ordering::Release);
        result
    }

    /// Closes the connection and frees the slot, invalidating every copy of
    /// the handle.
    ///
    /// Must not be called from inside this connection's own callbacks: the
    /// backend teardown waits for in-flight callbacks to drain.
    pub fn close_connection(&self, handle: &ConnectionHandle) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;

        // Take the backend out under the slot mutex; tear it down outside so
        // its state callbacks and thread join never run under the lock.
        let backend = slot.backend.lock().unwrap().take();

        let backend = match backend {
            Some(backend) => backend,
            // Another closer won the race; the slot is theirs to return.
            None => return Ok(()),
        };

        let _ = backend.disconnect();
        drop(backend);

        slot.shared.reset();
        self.metrics.connections_closed.fetch_add(1, Ordering::Relaxed);
        self.return_slot(handle.index);

        logging::debug!(self.log, "connection closed"; "slot" => handle.index);

        Ok(())
    }

    pub fn send(&self, handle: &ConnectionHandle, data: &[u8]) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;

        let guard = slot.backend.lock().unwrap();
        let backend = guard
            .as_ref()
            .ok_or_else(|| Error::connection_closed("Connection not initialized"))?;

        let result = backend.send(data);
        if result.is_ok() {
            self.metrics.total_bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
            self.metrics.total_messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    pub fn send_unreliable(&self, handle: &ConnectionHandle, data: &[u8]) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;

        let guard = slot.backend.lock().unwrap();
        let backend = guard
            .as_ref()
            .ok_or_else(|| Error::connection_closed("Connection not initialized"))?;

        let result = backend.send_unreliable(data);
        if result.is_ok() {
            self.metrics.total_bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
            self.metrics.total_messages_sent.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    /// Non-blocking send; `WouldBlock` results are counted in the manager
    /// metrics.
    pub fn try_send(&self, handle: &ConnectionHandle, data: &[u8]) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;

        let guard = slot.backend.lock().unwrap();
        let backend = guard
            .as_ref()
            .ok_or_else(|| Error::connection_closed("Connection not initialized"))?;

        let result = backend.try_send(data);
        match &result {
            Ok(()) => {
                self.metrics.total_bytes_sent.fetch_add(data.len() as u64, Ordering::Relaxed);
                self.metrics.total_messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                self.metrics.would_block_sends.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
        result
    }

    pub fn is_connected(&self, handle: &ConnectionHandle) -> bool {
        self.get_state(handle) == ConnectionState::Connected
    }

    /// Observed state from the slot's atomic mirror; `Disconnected` for an
    /// invalid handle.
    pub fn get_state(&self, handle: &ConnectionHandle) -> ConnectionState {
        match self.checked_slot(handle) {
            Ok(slot) => ConnectionState::from_u8(slot.shared.state.load(Ordering::Acquire)),
            Err(_) => ConnectionState::Disconnected,
        }
    }

    pub fn get_stats(&self, handle: &ConnectionHandle) -> NetResult<ConnectionStats> {
        let slot = self.checked_slot(handle)?;

        let guard = slot.backend.lock().unwrap();
        let backend = guard
            .as_ref()
            .ok_or_else(|| Error::connection_closed("Connection not initialized"))?;
        Ok(backend.stats())
    }

    pub fn get_connection_type(&self, handle: &ConnectionHandle) -> NetResult<ConnectionType> {
        let slot = self.checked_slot(handle)?;
        Ok(match slot.conn_type.load(Ordering::Acquire) {
            1 => ConnectionType::Remote,
            _ => ConnectionType::Local,
        })
    }

    /// Constant-time handle validation: owner, bounds, generation.
    pub fn is_valid_handle(&self, handle: &ConnectionHandle) -> bool {
        self.checked_slot(handle).is_ok()
    }

    /// Installs the user message callback. The manager's fan-out stays in
    /// place; user callbacks are invoked from it.
    pub fn set_message_callback(&self, handle: &ConnectionHandle, callback: MessageCallback) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;
        *slot.shared.message_cb.lock().unwrap() = Some(callback);
        Ok(())
    }

    /// Installs the user state callback, composed after the manager's state
    /// mirror.
    pub fn set_state_callback(&self, handle: &ConnectionHandle, callback: StateCallback) -> NetResult<()> {
        let slot = self.checked_slot(handle)?;
        *slot.shared.state_cb.lock().unwrap() = Some(callback);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn metrics(&self) -> ManagerMetrics {
        self.metrics.snapshot()
    }

    fn checked_slot(&self, handle: &ConnectionHandle) -> NetResult<&Slot> {
        if handle.owner() != self.id || handle.index >= self.capacity as u32 {
            return Err(Error::invalid_parameter("Invalid connection handle"));
        }

        let slot = &self.slots[handle.index as usize];
        if slot.generation.load(Ordering::Acquire) != handle.generation {
            return Err(Error::invalid_parameter("Invalid connection handle"));
        }

        Ok(slot)
    }

    fn allocate_slot(&self) -> Option<u32> {
        let index = self
            .free
            .pop(|i| self.slots[i as usize].next_free.load(Ordering::Acquire))?;
        self.active.fetch_add(1, Ordering::AcqRel);
        Some(index)
    }

    fn return_slot(&self, index: u32) {
        let slot = &self.slots[index as usize];
        slot.generation.fetch_add(1, Ordering::AcqRel);
        self.active.fetch_sub(1, Ordering::AcqRel);
        self.free.push(index, |i, next| {
            self.slots[i as usize].next_free.store(next, Ordering::Release)
        });
    }

    /// Wires the manager-owned fan-out callbacks into the backend and
    /// installs it. The fan-outs capture only the slot's shared cell and the
    /// metrics counters.
    fn install_backend(&self, index: u32, backend: Box<dyn NetworkConnection>, conn_type: ConnectionType) {
        let slot = &self.slots[index as usize];

        slot.shared.reset();
        slot.conn_type.store(conn_type as u8, Ordering::Release);

        let shared = slot.shared.clone();
        backend.set_state_callback(Arc::new(move |state| {
            shared.state.store(state as u8, Ordering::Release);
            let user = shared.state_cb.lock().unwrap().clone();
            if let Some(user) = user {
                user(state);
            }
        }));

        let shared = slot.shared.clone();
        let metrics = self.metrics.clone();
        backend.set_message_callback(Arc::new(move |payload: &[u8]| {
            metrics.total_bytes_received.fetch_add(payload.len() as u64, Ordering::Relaxed);
            metrics.total_messages_received.fetch_add(1, Ordering::Relaxed);
            let user = shared.message_cb.lock().unwrap().clone();
            if let Some(user) = user {
                user(payload);
            }
        }));

        slot.shared.state.store(backend.state() as u8, Ordering::Release);
        *slot.backend.lock().unwrap() = Some(backend);
    }

    fn create_backend(&self, config: &ConnectionConfig) -> NetResult<Box<dyn NetworkConnection>> {
        match config.connection_type {
            ConnectionType::Local => self.create_local_backend(config),
            ConnectionType::Remote => self.create_remote_backend(config),
        }
    }

    #[cfg(unix)]
    fn create_local_backend(&self, config: &ConnectionConfig) -> NetResult<Box<dyn NetworkConnection>> {
        use crate::net::unix::UnixSocketConnection;

        match config.backend {
            ConnectionBackend::Auto | ConnectionBackend::UnixSocket => {
                Ok(Box::new(UnixSocketConnection::new(config, &self.log)))
            }
            ConnectionBackend::NamedPipe => {
                Err(Error::invalid_parameter("Named pipe backend is not available on this platform"))
            }
            ConnectionBackend::Xpc => Err(Error::invalid_parameter("XPC backend is not built in")),
            ConnectionBackend::WebRtc => {
                Err(Error::invalid_parameter("WebRTC backend requires a remote connection type"))
            }
        }
    }

    #[cfg(not(unix))]
    fn create_local_backend(&self, _config: &ConnectionConfig) -> NetResult<Box<dyn NetworkConnection>> {
        Err(Error::invalid_parameter("No local backend available for this platform"))
    }

    fn create_remote_backend(&self, _config: &ConnectionConfig) -> NetResult<Box<dyn NetworkConnection>> {
        // Remote data-channel backends are external collaborators; this
        // build carries the configuration surface without their bodies.
        Err(Error::network("WebRTC backend is not built into this configuration"))
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        for slot in &self.slots {
            if let Some(backend) = slot.backend.lock().unwrap().take() {
                let _ = backend.disconnect();
            }
        }
    }
}
