//! Webshell instance agent.
//!
//! Keeps one persistent WebSocket open to a routing server and multiplexes
//! any number of interactive shell sessions over it. The routing server
//! forwards `shell/create` and `shell/data` envelopes from operators; this
//! crate spawns a process-backed session per `clientId`, feeds it input, and
//! pumps its output back as `shell/data` frames through a single writer.
//!
//! Entry point is [`ConnectionManager`]. Everything below it is wired
//! together through two seams so it can run without a real network or PTY:
//! [`Dialer`] for the physical connection and [`SessionSpawner`] for
//! sessions.

pub mod config;
mod dispatcher;
pub mod error;
pub mod identity;
pub mod manager;
pub mod protocol;
mod pump;
mod registry;
pub mod session;
pub mod transport;
mod writer;

#[cfg(test)]
mod test_helpers;

pub use error::{
    DialError, DispatchError, ProcessSpawnError, ProtocolDecodeError, SetupError, TransportError,
};
pub use manager::{ConnectionManager, ConnectionState, ManagerSettings};
pub use protocol::{DataEncoding, Envelope, InstanceId, SessionId, ShellCreate, ShellData};
pub use session::{OutputStream, PtySpawner, Session, SessionSpawner, SpawnedSession};
pub use transport::{Dialer, DialerConfig, FrameSink, FrameStream, Link, WsDialer};
