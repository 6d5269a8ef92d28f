//! Session layer: the structured protocol conversation carried over one
//! transport connection, and the slot-based session manager that binds
//! sessions to a schema registry.

pub mod manager;
pub mod session;

pub use manager::{SessionHandle, SessionManager};
pub use session::{Session, SessionState};

/// Capability bit: the peer understands schema advertisement frames.
pub const CAP_SCHEMA_DISCOVERY: u32 = 1 << 0;
/// Capability bit: the peer accepts batched property updates.
pub const CAP_PROPERTY_BATCH: u32 = 1 << 1;
/// Capability bit: the peer can receive on an unreliable channel.
pub const CAP_UNRELIABLE_TRANSPORT: u32 = 1 << 2;

/// Capabilities this implementation advertises as a client and grants as a
/// server; the negotiated set is the intersection with the peer's.
pub const LOCAL_CAPABILITIES: u32 = CAP_SCHEMA_DISCOVERY | CAP_PROPERTY_BATCH;
