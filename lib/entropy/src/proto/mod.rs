//! Wire codec for the structured protocol: primitive readers/writers and the
//! tagged message set carried inside length-framed transport payloads.

pub mod message;
pub mod wire;

pub use message::{Message, MessageTag, PropertyBatch};

/// Protocol version carried in both handshake messages. Bump when the tag
/// set or any message layout changes.
pub const PROTOCOL_VERSION: u32 = 1;
