//! Entropy networking toolkit.
//!
//! A structured, schema-aware application protocol (entities, properties,
//! component schemas) carried over pluggable local IPC and remote
//! peer-to-peer transports. The crate is organized around three cooperating
//! subsystems: the slot-based [`net::ConnectionManager`] over transport
//! backends, the [`session`] layer with its handshake and typed message
//! dispatch, and the content-addressed [`schema_registry`].

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod config;
pub mod error;
pub mod hash;
pub mod net;
pub mod property;
pub mod property_registry;
pub mod proto;
pub mod schema;
pub mod schema_registry;
pub mod session;
pub mod slots;

pub use config::{
    ConnectionBackend, ConnectionConfig, ConnectionType, LocalServerConfig, SignalingCallbacks, WebRtcConfig,
};
pub use error::{Error, ErrorKind, NetResult};
pub use hash::{compute_property_hash, ComponentTypeHash, Hash128, PropertyHash};
pub use net::{
    create_local_server, create_local_server_with_config, ConnectionHandle, ConnectionManager, ConnectionState,
    ConnectionStats, LocalServer, ManagerMetrics, NetworkConnection,
};
pub use property::{EntityId, PropertyMetadata, PropertyType, PropertyValue, Quat, Vec2, Vec3, Vec4, ROOT_ENTITY};
pub use property_registry::PropertyRegistry;
pub use schema::{ComponentSchema, PropertyDefinition};
pub use schema_registry::ComponentSchemaRegistry;
pub use session::{Session, SessionHandle, SessionManager, SessionState};
