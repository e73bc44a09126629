//! Connection manager: owns the physical connection, the session registry
//! and the outbound writer, and keeps the connection alive.
//!
//! ```text
//! reconnect loop ──dial──▶ Link ──sink──▶ writer task ◀── pumps
//!                           └──stream──▶ dispatcher ──▶ create / feeder
//! ```
//!
//! The reconnect loop is the only place a connection is installed or
//! retired. Sessions are not tied to a connection: they stay registered
//! across reconnects and their pumps write through whichever connection is
//! current.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::dispatcher;
use crate::error::{DispatchError, ProcessSpawnError, SetupError};
use crate::protocol::{ChunkEncoder, DataEncoding, InstanceId, SessionId, ShellCreate, ShellData};
use crate::pump::{self, PumpExit};
use crate::registry::{Insert, SessionEntry, SessionRegistry};
use crate::session::{Session, SessionSpawner, SpawnedSession};
use crate::transport::{Dialer, DialerConfig, WsDialer, handshake_headers};
use crate::writer::OutboundWriter;

/// Connection lifecycle as observed from outside.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Dialing; `attempt` counts consecutive failures plus one.
    Connecting { attempt: u32 },
    /// `generation` increments with every successful dial.
    Connected { generation: u64 },
    Closed,
}

#[derive(Clone, Debug)]
pub struct ManagerSettings {
    pub identity: InstanceId,
    /// Wait between failed dials.
    pub backoff: Duration,
    /// Bound on a single outbound frame, queueing included.
    pub write_timeout: Duration,
    /// Frames that may queue for the writer task.
    pub outbound_queue: usize,
    pub encoding: DataEncoding,
}

impl ManagerSettings {
    pub fn new(identity: InstanceId) -> Self {
        Self {
            identity,
            backoff: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
            outbound_queue: 256,
            encoding: DataEncoding::default(),
        }
    }
}

/// Handle to the agent's connection. Cheap to clone; every clone drives the
/// same connection and sessions. Call [`ConnectionManager::close`] to stop.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    settings: ManagerSettings,
    dialer: Arc<dyn Dialer>,
    spawner: Arc<dyn SessionSpawner>,
    registry: SessionRegistry,
    writer: Arc<OutboundWriter>,
    state: watch::Sender<ConnectionState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ConnectionManager {
    /// Dial `url` over WebSocket, identifying as `settings.identity`.
    ///
    /// Returns as soon as the handshake headers are built; dialing happens
    /// in the background and never fails this call.
    pub fn connect(
        url: &str,
        headers: &[(String, String)],
        dialer_config: &DialerConfig,
        settings: ManagerSettings,
        spawner: Arc<dyn SessionSpawner>,
    ) -> Result<Self, SetupError> {
        let headers = handshake_headers(&settings.identity, headers)?;
        let dialer = WsDialer::new(url, &headers, dialer_config)?;
        Ok(Self::with_dialer(Arc::new(dialer), settings, spawner))
    }

    /// Start the reconnect loop over an arbitrary [`Dialer`]. Must be called
    /// from within a tokio runtime.
    pub fn with_dialer(
        dialer: Arc<dyn Dialer>,
        settings: ManagerSettings,
        spawner: Arc<dyn SessionSpawner>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let manager = Self {
            inner: Arc::new(Inner {
                writer: Arc::new(OutboundWriter::new(
                    settings.outbound_queue,
                    settings.write_timeout,
                )),
                settings,
                dialer,
                spawner,
                registry: SessionRegistry::new(),
                state,
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        };

        let span = info_span!("connection", url = %manager.inner.dialer.target());
        manager
            .inner
            .tracker
            .spawn(manager.clone().reconnect_loop().instrument(span));
        manager
    }

    pub fn identity(&self) -> &InstanceId {
        &self.inner.settings.identity
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.ids()
    }

    pub fn session_count(&self) -> usize {
        self.inner.registry.len()
    }

    fn set_state(&self, state: ConnectionState) {
        self.inner.state.send_if_modified(|current| {
            if *current == ConnectionState::Closed || *current == state {
                return false;
            }
            *current = state;
            true
        });
    }

    async fn reconnect_loop(self) {
        let inner = &self.inner;
        let mut generation = 0u64;
        let mut attempt = 0u32;

        while !inner.shutdown.is_cancelled() {
            attempt += 1;
            self.set_state(ConnectionState::Connecting { attempt });

            let dialed = tokio::select! {
                biased;
                _ = inner.shutdown.cancelled() => break,
                dialed = inner.dialer.dial() => dialed,
            };

            let link = match dialed {
                Ok(link) => link,
                Err(e) => {
                    warn!(attempt, error = %e, backoff = ?inner.settings.backoff, "dial failed");
                    tokio::select! {
                        _ = inner.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(inner.settings.backoff) => {}
                    }
                    continue;
                }
            };

            attempt = 0;
            generation += 1;
            let link_cancel = inner.shutdown.child_token();
            inner
                .writer
                .install(link.sink, generation, link_cancel.clone(), &inner.tracker);
            self.set_state(ConnectionState::Connected { generation });
            info!(generation, sessions = inner.registry.len(), "connected");

            dispatcher::run(&self, link.stream, link_cancel.clone())
                .instrument(info_span!("link", generation))
                .await;

            // Pending sends against this connection fail from here on
            link_cancel.cancel();
            inner.writer.retire();
            if inner.shutdown.is_cancelled() {
                break;
            }
            self.set_state(ConnectionState::Disconnected);
            warn!(generation, "connection lost, reconnecting");
        }

        inner.writer.retire();
        debug!("reconnect loop stopped");
    }

    /// Return the session registered under `session_id`, spawning it first
    /// if needed.
    pub async fn new_session(
        &self,
        session_id: &SessionId,
    ) -> Result<Arc<dyn Session>, ProcessSpawnError> {
        let inner = &self.inner;
        if let Some(existing) = inner.registry.get(session_id) {
            return Ok(existing.session);
        }
        if inner.shutdown.is_cancelled() {
            return Err(ProcessSpawnError::new(
                session_id.clone(),
                "connection manager is closed",
            ));
        }

        let SpawnedSession { session, output } = inner.spawner.spawn(session_id).await?;
        let cancel = inner.shutdown.child_token();
        let (input, input_rx) = mpsc::unbounded_channel();
        let epoch = inner.registry.next_epoch();
        let entry = SessionEntry {
            session: session.clone(),
            input,
            cancel: cancel.clone(),
            epoch,
        };

        match inner.registry.insert_if_absent(session_id.clone(), entry) {
            Insert::Inserted => {}
            Insert::Occupied { existing, rejected } => {
                debug!(%session_id, "lost creation race, closing duplicate");
                rejected.session.close().await;
                return Ok(existing.session);
            }
            Insert::Closed { rejected } => {
                rejected.session.close().await;
                return Err(ProcessSpawnError::new(
                    session_id.clone(),
                    "connection manager is closed",
                ));
            }
        }

        let span = info_span!("session", %session_id);
        let encoder = ChunkEncoder::new(
            inner.settings.encoding,
            inner.settings.identity.clone(),
            session_id.clone(),
        );
        let manager = self.clone();
        let id = session_id.clone();
        let writer = inner.writer.clone();
        let pump_cancel = cancel.clone();
        inner.tracker.spawn(
            async move {
                let exit = pump::pump_output(output, encoder, writer, pump_cancel).await;
                manager.on_pump_exit(&id, epoch, exit).await;
            }
            .instrument(span.clone()),
        );
        inner.tracker.spawn(
            pump::feed_input(session_id.clone(), session.clone(), input_rx, cancel)
                .instrument(span),
        );

        info!(%session_id, sessions = inner.registry.len(), "session created");
        Ok(session)
    }

    async fn on_pump_exit(&self, session_id: &SessionId, epoch: u64, exit: PumpExit) {
        match exit {
            PumpExit::StreamEnded => {
                info!("session output ended");
                self.retire_session(session_id, epoch).await;
            }
            PumpExit::TransportFailed(e) => {
                warn!(error = %e, "output lost, closing session");
                self.retire_session(session_id, epoch).await;
            }
            // Whoever cancelled owns the close
            PumpExit::Cancelled => debug!("output pump cancelled"),
        }
    }

    /// Remove and close one incarnation of a session.
    async fn retire_session(&self, session_id: &SessionId, epoch: u64) {
        if let Some(entry) = self.inner.registry.remove_if_epoch(session_id, epoch) {
            entry.cancel.cancel();
            entry.session.close().await;
            debug!(%session_id, "session removed");
        }
    }

    /// Close and forget `session_id`. No-op if it is not registered.
    pub async fn remove_session(&self, session_id: &SessionId) {
        if let Some(entry) = self.inner.registry.remove(session_id) {
            entry.cancel.cancel();
            entry.session.close().await;
            info!(%session_id, "session removed");
        }
    }

    fn check_identity(&self, instance_id: &InstanceId) -> Result<(), DispatchError> {
        if instance_id == self.identity() {
            Ok(())
        } else {
            Err(DispatchError::IdentityMismatch {
                received: instance_id.clone(),
                local: self.identity().clone(),
            })
        }
    }

    /// Handle a `shell/create` event.
    pub async fn dispatch_create(&self, event: ShellCreate) -> Result<(), DispatchError> {
        self.check_identity(&event.instance_id)?;
        if self.inner.shutdown.is_cancelled() {
            return Err(DispatchError::Closed);
        }
        self.new_session(&event.client_id).await?;
        Ok(())
    }

    /// Handle a `shell/data` event. Never waits on the session: the bytes are
    /// queued for its input feeder.
    pub fn dispatch_data(&self, event: ShellData) -> Result<(), DispatchError> {
        self.check_identity(&event.instance_id)?;
        let payload = event.payload()?;
        let entry = self
            .inner
            .registry
            .get(&event.client_id)
            .ok_or_else(|| DispatchError::SessionNotFound(event.client_id.clone()))?;
        entry
            .input
            .send(payload)
            .map_err(|_| DispatchError::SessionNotFound(event.client_id))
    }

    /// Run `task` on the manager's tracker so [`close`](Self::close) waits
    /// for it.
    pub(crate) fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.inner.tracker.spawn(task.in_current_span());
    }

    /// Shut everything down: stop reconnecting, close every session, drop
    /// the connection and wait for all background tasks. Safe to call more
    /// than once and from several tasks at a time.
    pub async fn close(&self) {
        let inner = &self.inner;
        if !inner.shutdown.is_cancelled() {
            info!(sessions = inner.registry.len(), "closing connection manager");
        }
        inner.shutdown.cancel();

        for (session_id, entry) in inner.registry.drain() {
            entry.cancel.cancel();
            entry.session.close().await;
            debug!(%session_id, "session closed on shutdown");
        }
        inner.writer.retire();

        inner.tracker.close();
        inner.tracker.wait().await;
        self.set_state(ConnectionState::Closed);
    }
}
