//! Connection and server configuration records.
//!
//! Everything here is serde-friendly and loads from TOML, except the
//! signaling callbacks which only exist at runtime.

use crate::error::NetResult;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Default maximum payload for local stream transports.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;
/// Default maximum payload for XPC transports.
pub const DEFAULT_XPC_MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;
/// Default maximum payload for WebRTC data channels.
pub const DEFAULT_WEBRTC_MAX_MESSAGE_SIZE: u64 = 256 * 1024;

/// High-level connection category. Local picks a platform IPC backend,
/// Remote a peer-to-peer data channel.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    Local,
    Remote,
}

/// Explicit backend selection for advanced use; `Auto` lets the platform
/// pick.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionBackend {
    Auto,
    UnixSocket,
    NamedPipe,
    Xpc,
    WebRtc,
}

/// WebRTC-specific knobs, used only by remote connections.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebRtcConfig {
    pub ice_servers: Vec<String>,
    pub proxy_server: String,
    pub bind_address: String,
    pub port_range_begin: u16,
    pub port_range_end: u16,
    pub max_message_size: u64,
    pub enable_ice_tcp: bool,
    /// Perfect negotiation: the polite peer yields during offer glare.
    pub polite: bool,
}

impl Default for WebRtcConfig {
    fn default() -> WebRtcConfig {
        WebRtcConfig {
            ice_servers: Vec::new(),
            proxy_server: String::new(),
            bind_address: String::new(),
            port_range_begin: 0,
            port_range_end: 0,
            max_message_size: DEFAULT_WEBRTC_MAX_MESSAGE_SIZE,
            enable_ice_tcp: false,
            polite: false,
        }
    }
}

pub type LocalDescriptionCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;
pub type LocalCandidateCallback = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Application-supplied callbacks that carry SDP descriptions and ICE
/// candidates over the signaling channel.
#[derive(Default, Clone)]
pub struct SignalingCallbacks {
    pub on_local_description: Option<LocalDescriptionCallback>,
    pub on_local_candidate: Option<LocalCandidateCallback>,
}

impl fmt::Debug for SignalingCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("SignalingCallbacks")
            .field("on_local_description", &self.on_local_description.is_some())
            .field("on_local_candidate", &self.on_local_candidate.is_some())
            .finish()
    }
}

/// Unified connection configuration covering local and remote transports.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
    pub backend: ConnectionBackend,

    /// Socket path, pipe name, or signaling server URL.
    pub endpoint: String,

    pub connect_timeout_ms: i32,
    pub send_poll_timeout_ms: i32,
    pub send_max_polls: i32,
    /// If >= 0, idle receive waits poll for readability with this timeout
    /// instead of a fixed sleep.
    pub recv_idle_poll_ms: i32,
    pub max_message_size: u64,

    /// SO_SNDBUF / SO_RCVBUF sizing on Unix; 0 leaves the OS default.
    pub socket_send_buf: i32,
    pub socket_recv_buf: i32,

    pub webrtc: WebRtcConfig,
    #[serde(skip)]
    pub signaling_callbacks: SignalingCallbacks,
    pub data_channel_label: String,

    pub xpc_max_message_size: u64,
    pub xpc_reply_timeout_ms: i32,
    pub xpc_service_name: Option<String>,
}

impl Default for ConnectionConfig {
    fn default() -> ConnectionConfig {
        ConnectionConfig {
            connection_type: ConnectionType::Local,
            backend: ConnectionBackend::Auto,
            endpoint: String::new(),
            connect_timeout_ms: 5000,
            send_poll_timeout_ms: 1000,
            send_max_polls: 100,
            recv_idle_poll_ms: -1,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            socket_send_buf: 0,
            socket_recv_buf: 0,
            webrtc: WebRtcConfig::default(),
            signaling_callbacks: SignalingCallbacks::default(),
            data_channel_label: "entropy-data".to_string(),
            xpc_max_message_size: DEFAULT_XPC_MAX_MESSAGE_SIZE,
            xpc_reply_timeout_ms: 5000,
            xpc_service_name: None,
        }
    }
}

impl ConnectionConfig {
    /// Configuration for a local connection to the given endpoint with all
    /// defaults.
    pub fn local(endpoint: impl Into<String>) -> ConnectionConfig {
        ConnectionConfig {
            connection_type: ConnectionType::Local,
            endpoint: endpoint.into(),
            ..ConnectionConfig::default()
        }
    }

    /// Configuration for a remote connection through the given signaling
    /// server.
    pub fn remote(signaling_server: impl Into<String>, webrtc: WebRtcConfig, callbacks: SignalingCallbacks) -> ConnectionConfig {
        ConnectionConfig {
            connection_type: ConnectionType::Remote,
            backend: ConnectionBackend::WebRtc,
            endpoint: signaling_server.into(),
            webrtc,
            signaling_callbacks: callbacks,
            ..ConnectionConfig::default()
        }
    }

    /// Loads a configuration from a TOML string.
    pub fn from_toml_str(toml: &str) -> NetResult<ConnectionConfig> {
        serdeconv::from_toml_str(toml)
            .map_err(|err| crate::error::Error::invalid_parameter(format!("Bad connection config: {}", err)))
    }
}

/// Platform-agnostic local server options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalServerConfig {
    pub backlog: i32,
    /// Poll interval in the accept loop; bounds how long `close()` may take
    /// to unblock a pending `accept()`.
    pub accept_poll_interval_ms: i32,
    /// If >= 0, chmod the socket path to this mode after bind (Unix).
    pub chmod_mode: i32,
    /// Unlink the socket path before bind (Unix).
    pub unlink_on_start: bool,
    pub pipe_out_buffer_size: u64,
    pub pipe_in_buffer_size: u64,
}

impl Default for LocalServerConfig {
    fn default() -> LocalServerConfig {
        LocalServerConfig {
            backlog: 128,
            accept_poll_interval_ms: 500,
            chmod_mode: -1,
            unlink_on_start: true,
            pipe_out_buffer_size: 1024 * 1024,
            pipe_in_buffer_size: 1024 * 1024,
        }
    }
}
