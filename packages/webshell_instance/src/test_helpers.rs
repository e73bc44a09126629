//! In-memory stand-ins for the PTY and the network.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures::{SinkExt, StreamExt};
use tokio::sync::{Notify, mpsc};

use crate::error::{DialError, ProcessSpawnError, TransportError};
use crate::protocol::SessionId;
use crate::session::{OutputStream, Session, SessionSpawner, SpawnedSession};
use crate::transport::{Dialer, Link};

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Await `fut` with a generous timeout.
pub async fn within<T>(fut: impl Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), fut)
        .await
        .expect("timed out")
}

pub struct FakeSession {
    writes: Mutex<Vec<Vec<u8>>>,
    wrote: Notify,
    closes: AtomicUsize,
    output: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl FakeSession {
    pub fn new() -> (Arc<Self>, OutputStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = Arc::new(Self {
            writes: Mutex::new(Vec::new()),
            wrote: Notify::new(),
            closes: AtomicUsize::new(0),
            output: Mutex::new(Some(tx)),
        });
        let output = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        })
        .boxed();
        (session, output)
    }

    /// Make the process produce `chunk`.
    pub fn emit(&self, chunk: &[u8]) {
        if let Some(tx) = self.output.lock().unwrap().as_ref() {
            let _ = tx.send(chunk.to_vec());
        }
    }

    /// Make the process exit.
    pub fn end_output(&self) {
        self.output.lock().unwrap().take();
    }

    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.writes.lock().unwrap().clone()
    }

    /// Everything written so far, concatenated.
    pub fn input(&self) -> Vec<u8> {
        self.writes().concat()
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub async fn wait_for_input(&self, expected: &[u8]) {
        within(async {
            loop {
                let notified = self.wrote.notified();
                if self.input() == expected {
                    return;
                }
                notified.await;
            }
        })
        .await
    }
}

#[async_trait]
impl Session for FakeSession {
    async fn write(&self, data: &[u8]) -> io::Result<usize> {
        self.writes.lock().unwrap().push(data.to_vec());
        self.wrote.notify_waiters();
        Ok(data.len())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.end_output();
    }
}

/// Hands out [`FakeSession`]s and remembers every one it created.
#[derive(Default)]
pub struct FakeSpawner {
    spawned: Mutex<HashMap<SessionId, Vec<Arc<FakeSession>>>>,
    count: AtomicUsize,
    fail: AtomicBool,
    delay: Mutex<Option<Duration>>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_spawns(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Make every spawn take `delay`, to widen race windows.
    pub fn slow_spawns(&self, delay: Duration) {
        *self.delay.lock().unwrap() = Some(delay);
    }

    pub fn spawn_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// Most recent session spawned for `id`.
    pub fn session(&self, id: &str) -> Arc<FakeSession> {
        self.spawned
            .lock()
            .unwrap()
            .get(&SessionId::from(id))
            .and_then(|all| all.last().cloned())
            .unwrap_or_else(|| panic!("no session spawned for {id}"))
    }

    pub fn all_sessions(&self) -> Vec<Arc<FakeSession>> {
        self.spawned
            .lock()
            .unwrap()
            .values()
            .flatten()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SessionSpawner for FakeSpawner {
    async fn spawn(&self, id: &SessionId) -> Result<SpawnedSession, ProcessSpawnError> {
        let delay = *self.delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(ProcessSpawnError::new(id.clone(), "spawning disabled"));
        }
        let (session, output) = FakeSession::new();
        self.spawned
            .lock()
            .unwrap()
            .entry(id.clone())
            .or_default()
            .push(session.clone());
        self.count.fetch_add(1, Ordering::SeqCst);
        Ok(SpawnedSession { session, output })
    }
}

/// The router's side of one fake connection.
pub struct PeerEnd {
    inbound: fmpsc::UnboundedSender<Result<Vec<u8>, TransportError>>,
    outbound: fmpsc::UnboundedReceiver<String>,
}

impl PeerEnd {
    /// Deliver a frame to the agent.
    pub fn send(&self, frame: impl Into<String>) {
        let _ = self.inbound.unbounded_send(Ok(frame.into().into_bytes()));
    }

    pub fn send_json(&self, value: serde_json::Value) {
        self.send(value.to_string());
    }

    /// Break the connection with a read error.
    pub fn fail(&self) {
        let _ = self.inbound.unbounded_send(Err(TransportError::Closed));
    }

    /// Stop reading what the agent writes; its next write fails.
    pub fn close_outbound(&mut self) {
        self.outbound.close();
    }

    /// Next frame the agent wrote, parsed.
    pub async fn recv(&mut self) -> Option<serde_json::Value> {
        let text = within(self.outbound.next()).await?;
        Some(serde_json::from_str(&text).expect("agent wrote invalid json"))
    }
}

/// Fails the first `failures` dials, then hands each new connection's far
/// end to the test.
pub struct FakeDialer {
    failures: AtomicUsize,
    attempts: AtomicUsize,
    peers: mpsc::UnboundedSender<PeerEnd>,
}

impl FakeDialer {
    pub fn new(failures: usize) -> (Arc<Self>, mpsc::UnboundedReceiver<PeerEnd>) {
        let (peers, rx) = mpsc::unbounded_channel();
        let dialer = Arc::new(Self {
            failures: AtomicUsize::new(failures),
            attempts: AtomicUsize::new(0),
            peers,
        });
        (dialer, rx)
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Dialer for FakeDialer {
    fn target(&self) -> &str {
        "fake://router"
    }

    async fn dial(&self) -> Result<Link, DialError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            return Err(DialError::Unavailable {
                target: self.target().to_string(),
                reason: "connection refused".into(),
            });
        }

        let (inbound_tx, inbound_rx) = fmpsc::unbounded();
        let (outbound_tx, outbound_rx) = fmpsc::unbounded::<String>();
        let _ = self.peers.send(PeerEnd {
            inbound: inbound_tx,
            outbound: outbound_rx,
        });

        let sink = outbound_tx.sink_map_err(|_| TransportError::Closed);
        Ok(Link {
            sink: Box::pin(sink),
            stream: inbound_rx.boxed(),
        })
    }
}
