use std::time::Duration;

use tokio_tungstenite::tungstenite;

use crate::protocol::{InstanceId, SessionId};

/// Failure to establish the physical connection. Always transient: the
/// reconnect loop backs off and dials again.
#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error("dial to {target} timed out after {timeout:?}")]
    Timeout { target: String, timeout: Duration },

    #[error("dial to {target} failed: {source}")]
    Handshake {
        target: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("{target} is unavailable: {reason}")]
    Unavailable { target: String, reason: String },
}

/// Read or write failure on an established connection, or no connection at
/// all. The frame involved is lost; the connection manager reconnects.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("connection was retired before the frame was written")]
    Retired,

    #[error("write did not complete within {0:?}")]
    WriteTimeout(Duration),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// A session's process could not be started. Nothing is registered.
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn session {session_id}: {reason}")]
pub struct ProcessSpawnError {
    pub session_id: SessionId,
    pub reason: String,
}

impl ProcessSpawnError {
    pub fn new(session_id: SessionId, reason: impl Into<String>) -> Self {
        Self {
            session_id,
            reason: reason.into(),
        }
    }
}

/// An inbound frame that could not be understood. The frame is dropped and
/// the read loop continues.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolDecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unsupported data encoding {0:?}")]
    UnsupportedEncoding(String),
}

/// Outcome of handling one inbound event that did not result in an action.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// Addressed to another instance. Expected when the router fans out.
    #[error("event addressed to instance {received}, local identity is {local}")]
    IdentityMismatch {
        received: InstanceId,
        local: InstanceId,
    },

    #[error("session {0} not found")]
    SessionNotFound(SessionId),

    #[error(transparent)]
    Spawn(#[from] ProcessSpawnError),

    #[error(transparent)]
    Decode(#[from] ProtocolDecodeError),

    #[error("connection manager is closed")]
    Closed,
}

/// The agent cannot describe itself to the router. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("failed to resolve local hostname: {0}")]
    Hostname(#[source] std::io::Error),

    #[error("invalid target url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },

    #[error("failed to build TLS configuration: {0}")]
    Tls(#[from] rustls::Error),
}
