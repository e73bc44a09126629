//! Session seam: the process-backed terminal as seen by the connection
//! manager.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use pty_manager::{PtyConfig, PtySession};
use tracing::debug;

use crate::error::ProcessSpawnError;
use crate::protocol::SessionId;

/// Lazy sequence of output chunks. Ends when the process exits or the
/// session is closed; it is never restarted.
pub type OutputStream = BoxStream<'static, Vec<u8>>;

/// One interactive shell.
///
/// At most one caller writes at a time (the session's input feeder);
/// `close` may race with anything and must be idempotent.
#[async_trait]
pub trait Session: Send + Sync + 'static {
    async fn write(&self, data: &[u8]) -> io::Result<usize>;

    async fn close(&self);
}

pub struct SpawnedSession {
    pub session: Arc<dyn Session>,
    pub output: OutputStream,
}

/// Creates sessions on demand.
#[async_trait]
pub trait SessionSpawner: Send + Sync + 'static {
    async fn spawn(&self, id: &SessionId) -> Result<SpawnedSession, ProcessSpawnError>;
}

#[async_trait]
impl Session for PtySession {
    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        PtySession::write(self, data).await.map_err(io::Error::other)
    }

    async fn close(&self) {
        PtySession::close(self).await
    }
}

/// Spawns a shell on a fresh PTY for every session.
#[derive(Clone, Debug, Default)]
pub struct PtySpawner {
    config: PtyConfig,
}

impl PtySpawner {
    pub fn new(config: PtyConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionSpawner for PtySpawner {
    async fn spawn(&self, id: &SessionId) -> Result<SpawnedSession, ProcessSpawnError> {
        let config = self.config.clone();
        debug!(session_id = %id, command = %config.command, "spawning shell");

        // openpty and fork/exec are blocking syscalls
        let spawned = tokio::task::spawn_blocking(move || PtySession::spawn(config))
            .await
            .map_err(|e| ProcessSpawnError::new(id.clone(), e.to_string()))?
            .map_err(|e| ProcessSpawnError::new(id.clone(), e.to_string()))?;

        let (session, output) = spawned;
        Ok(SpawnedSession {
            session: Arc::new(session),
            output: output.boxed(),
        })
    }
}
