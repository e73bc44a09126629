//! Single writer for the shared connection.
//!
//! Every outbound frame goes through one task per physical connection, so
//! frames from concurrent sessions are written whole and never interleave.
//! Senders wait for the write to complete (or fail) and get the result
//! back, bounded by the write timeout.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use futures::SinkExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::protocol::Envelope;
use crate::transport::FrameSink;

struct OutboundFrame {
    text: String,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

#[derive(Clone)]
struct LinkHandle {
    tx: mpsc::Sender<OutboundFrame>,
    generation: u64,
}

pub(crate) struct OutboundWriter {
    current: Mutex<Option<LinkHandle>>,
    queue: usize,
    write_timeout: Duration,
}

impl OutboundWriter {
    pub fn new(queue: usize, write_timeout: Duration) -> Self {
        Self {
            current: Mutex::new(None),
            queue: queue.max(1),
            write_timeout,
        }
    }

    fn handle(&self) -> Option<LinkHandle> {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Serialize `envelope` and write it as one frame.
    pub async fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let text = serde_json::to_string(envelope)?;
        Self::deliver(self.handle(), text, self.write_timeout).await
    }

    #[cfg(test)]
    pub async fn send_frame(&self, text: String) -> Result<(), TransportError> {
        Self::deliver(self.handle(), text, self.write_timeout).await
    }

    async fn deliver(
        handle: Option<LinkHandle>,
        text: String,
        write_timeout: Duration,
    ) -> Result<(), TransportError> {
        let handle = handle.ok_or(TransportError::NotConnected)?;
        let (ack, done) = oneshot::channel();
        let delivery = async {
            handle
                .tx
                .send(OutboundFrame { text, ack })
                .await
                .map_err(|_| TransportError::Retired)?;
            done.await.map_err(|_| TransportError::Retired)?
        };
        tokio::time::timeout(write_timeout, delivery)
            .await
            .map_err(|_| TransportError::WriteTimeout(write_timeout))?
    }

    /// Start writing to a new connection. A failed write cancels
    /// `link_cancel` so the reconnect loop notices.
    pub fn install(
        &self,
        sink: FrameSink,
        generation: u64,
        link_cancel: CancellationToken,
        tracker: &TaskTracker,
    ) {
        let (tx, rx) = mpsc::channel(self.queue);
        tracker.spawn(write_loop(
            sink,
            rx,
            generation,
            link_cancel,
            self.write_timeout,
        ));
        *self.current.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(LinkHandle { tx, generation });
    }

    /// Stop accepting frames for the current connection. Callers that
    /// already queued a frame get `Retired` once the writer task exits.
    pub fn retire(&self) {
        let old = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(old) = old {
            debug!(generation = old.generation, "retired outbound writer");
        }
    }

    #[cfg(test)]
    pub fn is_connected(&self) -> bool {
        self.handle().is_some()
    }
}

async fn write_loop(
    mut sink: FrameSink,
    mut rx: mpsc::Receiver<OutboundFrame>,
    generation: u64,
    link_cancel: CancellationToken,
    write_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            _ = link_cancel.cancelled() => break,
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        match tokio::time::timeout(write_timeout, sink.send(frame.text)).await {
            Ok(Ok(())) => {
                let _ = frame.ack.send(Ok(()));
            }
            Ok(Err(e)) => {
                warn!(generation, error = %e, "write failed, dropping connection");
                let _ = frame.ack.send(Err(e));
                link_cancel.cancel();
                break;
            }
            Err(_) => {
                warn!(generation, ?write_timeout, "write timed out, dropping connection");
                let _ = frame.ack.send(Err(TransportError::WriteTimeout(write_timeout)));
                link_cancel.cancel();
                break;
            }
        }
    }

    // Queued senders learn of the failure now, not after the close below
    drop(rx);
    if tokio::time::timeout(write_timeout, sink.close()).await.is_err() {
        debug!(generation, "timed out closing connection");
    }
    debug!(generation, "writer task exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use futures::channel::mpsc as fmpsc;

    fn sink_pair() -> (FrameSink, fmpsc::UnboundedReceiver<String>) {
        let (tx, rx) = fmpsc::unbounded::<String>();
        (Box::pin(tx.sink_map_err(|_| TransportError::Closed)), rx)
    }

    #[tokio::test]
    async fn send_without_connection_fails_promptly() {
        let writer = OutboundWriter::new(8, Duration::from_secs(5));
        assert!(!writer.is_connected());
        assert!(matches!(
            writer.send_frame("x".into()).await,
            Err(TransportError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn frames_arrive_whole_and_in_order() {
        let writer = OutboundWriter::new(8, Duration::from_secs(5));
        let tracker = TaskTracker::new();
        let (sink, mut rx) = sink_pair();
        writer.install(sink, 1, CancellationToken::new(), &tracker);
        assert!(writer.is_connected());

        writer.send_frame("one".into()).await.unwrap();
        writer.send_frame("two".into()).await.unwrap();
        assert_eq!(rx.next().await.as_deref(), Some("one"));
        assert_eq!(rx.next().await.as_deref(), Some("two"));
    }

    #[tokio::test]
    async fn write_failure_drops_the_connection() {
        let writer = OutboundWriter::new(8, Duration::from_secs(5));
        let tracker = TaskTracker::new();
        let (sink, rx) = sink_pair();
        drop(rx);
        let link_cancel = CancellationToken::new();
        writer.install(sink, 1, link_cancel.clone(), &tracker);

        assert!(matches!(
            writer.send_frame("lost".into()).await,
            Err(TransportError::Closed)
        ));
        assert!(link_cancel.is_cancelled());

        // The writer task is gone; later sends fail instead of hanging
        assert!(matches!(
            writer.send_frame("also lost".into()).await,
            Err(TransportError::Retired)
        ));
    }

    /// Rejects every frame and never finishes closing.
    struct StuckSink;

    impl futures::Sink<String> for StuckSink {
        type Error = TransportError;

        fn poll_ready(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn start_send(self: std::pin::Pin<&mut Self>, _item: String) -> Result<(), Self::Error> {
            Err(TransportError::Closed)
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_close(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<Result<(), Self::Error>> {
            std::task::Poll::Pending
        }
    }

    #[tokio::test]
    async fn queued_frames_fail_without_waiting_for_close() {
        let writer = OutboundWriter::new(8, Duration::from_secs(30));
        let tracker = TaskTracker::new();
        writer.install(Box::pin(StuckSink), 1, CancellationToken::new(), &tracker);

        let (first, second) = tokio::time::timeout(Duration::from_secs(2), async {
            tokio::join!(
                writer.send_frame("first".into()),
                writer.send_frame("second".into())
            )
        })
        .await
        .expect("queued sends should fail promptly");
        assert!(matches!(first, Err(TransportError::Closed)));
        assert!(matches!(second, Err(TransportError::Retired)));
    }

    #[tokio::test]
    async fn retired_writer_rejects_sends() {
        let writer = OutboundWriter::new(8, Duration::from_secs(5));
        let tracker = TaskTracker::new();
        let (sink, _rx) = sink_pair();
        let link_cancel = CancellationToken::new();
        writer.install(sink, 1, link_cancel.clone(), &tracker);

        writer.retire();
        link_cancel.cancel();
        assert!(!writer.is_connected());
        assert!(matches!(
            writer.send_frame("x".into()).await,
            Err(TransportError::NotConnected)
        ));

        tracker.close();
        tracker.wait().await;
    }
}
