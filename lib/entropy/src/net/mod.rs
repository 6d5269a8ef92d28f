//! Transport layer: the connection contract, length framing, the Unix
//! domain socket backend, the local server, and the slot-based connection
//! manager.

pub mod connection;
pub mod framing;
pub mod manager;
pub mod server;
#[cfg(unix)]
pub mod unix;

pub use connection::{
    ConnectionState, ConnectionStats, MessageCallback, NetworkConnection, StateCallback,
};
pub use manager::{ConnectionHandle, ConnectionManager, ManagerMetrics};
pub use server::{create_local_server, create_local_server_with_config, LocalServer};
