//! The abstract connection contract every transport backend implements, and
//! the callback plumbing that makes teardown safe while callbacks may be
//! firing on other threads.

use crate::config::ConnectionType;
use crate::error::{Error, NetResult};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

/// Connection lifecycle states.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Disconnecting = 3,
    Failed = 4,
}

impl ConnectionState {
    pub fn from_u8(raw: u8) -> ConnectionState {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            3 => ConnectionState::Disconnecting,
            4 => ConnectionState::Failed,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// Cumulative transfer statistics for one connection.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct ConnectionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Milliseconds since the epoch at connection establishment.
    pub connect_time: u64,
    /// Milliseconds since the epoch at the last send or receive.
    pub last_activity_time: u64,
}

/// Shared atomic counters behind [`ConnectionStats`] snapshots. Backends
/// update these from both the send path and the receive thread.
#[derive(Default)]
pub struct StatCounters {
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub connect_time: AtomicU64,
    pub last_activity_time: AtomicU64,
}

impl StatCounters {
    pub fn snapshot(&self) -> ConnectionStats {
        ConnectionStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connect_time: self.connect_time.load(Ordering::Relaxed),
            last_activity_time: self.last_activity_time.load(Ordering::Relaxed),
        }
    }

    pub fn touch(&self, now_millis: u64) {
        self.last_activity_time.store(now_millis, Ordering::Relaxed);
    }
}

pub type MessageCallback = Arc<dyn Fn(&[u8]) + Send + Sync>;
pub type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;

/// Callback dispatch with teardown safety.
///
/// Dispatch checks the shutdown flag, increments the in-flight counter with
/// an RAII decrement, re-checks the flag, copies the callback under the
/// lock, and invokes outside the lock. [`CallbackHub::shutdown`] sets the
/// flag and spin-yields until in-flight invocations drain; after it returns,
/// no user callback is executing and none can start, which is the
/// precondition for destroying state the callbacks could touch.
#[derive(Default)]
pub struct CallbackHub {
    message_cb: Mutex<Option<MessageCallback>>,
    state_cb: Mutex<Option<StateCallback>>,
    in_flight: AtomicU32,
    shutdown: AtomicBool,
}

struct InFlightGuard<'a> {
    counter: &'a AtomicU32,
}

impl<'a> Drop for InFlightGuard<'a> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Release);
    }
}

impl CallbackHub {
    pub fn new() -> CallbackHub {
        CallbackHub::default()
    }

    pub fn set_message_callback(&self, callback: MessageCallback) {
        *self.message_cb.lock().unwrap() = Some(callback);
    }

    pub fn set_state_callback(&self, callback: StateCallback) {
        *self.state_cb.lock().unwrap() = Some(callback);
    }

    pub fn dispatch_message(&self, payload: &[u8]) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlightGuard {
            counter: &self.in_flight,
        };

        // The flag may have been raised between the first check and the
        // counter increment.
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let callback = self.message_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(payload);
        }
    }

    pub fn dispatch_state(&self, state: ConnectionState) {
        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        self.in_flight.fetch_add(1, Ordering::Relaxed);
        let _guard = InFlightGuard {
            counter: &self.in_flight,
        };

        if self.shutdown.load(Ordering::Acquire) {
            return;
        }

        let callback = self.state_cb.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(state);
        }
    }

    /// Stops new dispatches and waits for in-flight ones to finish.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        while self.in_flight.load(Ordering::Acquire) > 0 {
            thread::yield_now();
        }
    }
}

/// Atomic [`ConnectionState`] cell that notifies the hub on every
/// transition.
pub struct StateCell {
    state: AtomicU8,
}

impl StateCell {
    pub fn new(initial: ConnectionState) -> StateCell {
        StateCell {
            state: AtomicU8::new(initial as u8),
        }
    }

    #[inline]
    pub fn get(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Stores the new state and delivers it through the hub.
    pub fn transition(&self, state: ConnectionState, hub: &CallbackHub) {
        self.set(state);
        hub.dispatch_state(state);
    }
}

/// Capabilities every transport backend exposes. Backends own their OS
/// handles and internal threads; all methods are callable from any thread.
pub trait NetworkConnection: Send + Sync {
    /// Initiates the connection. May block up to the configured connect
    /// timeout.
    fn connect(&self) -> NetResult<()>;

    /// Tears the connection down, stopping internal threads. Idempotent.
    fn disconnect(&self) -> NetResult<()>;

    fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    fn state(&self) -> ConnectionState;

    fn connection_type(&self) -> ConnectionType;

    fn stats(&self) -> ConnectionStats;

    /// Reliable ordered send. Blocks with poll-and-timeout under transport
    /// backpressure.
    fn send(&self, data: &[u8]) -> NetResult<()>;

    /// Unreliable send; backends without an unreliable channel fall back to
    /// the reliable one.
    fn send_unreliable(&self, data: &[u8]) -> NetResult<()>;

    /// Non-blocking send. Backends that cannot support it report
    /// `InvalidParameter`; supported-but-backpressured is `WouldBlock`.
    fn try_send(&self, data: &[u8]) -> NetResult<()> {
        let _ = data;
        Err(Error::invalid_parameter("trySend not supported by this backend"))
    }

    fn set_message_callback(&self, callback: MessageCallback);

    fn set_state_callback(&self, callback: StateCallback);

    /// Stops callback dispatch and drains in-flight invocations. Must be
    /// called before destroying state the callbacks could touch.
    fn shutdown_callbacks(&self);
}
