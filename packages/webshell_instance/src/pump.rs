//! Per-session tasks: the output pump (process to router) and the input
//! feeder (router to process).

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::TransportError;
use crate::protocol::{ChunkEncoder, Envelope, SessionId};
use crate::session::{OutputStream, Session};
use crate::writer::OutboundWriter;

#[derive(Debug)]
pub(crate) enum PumpExit {
    /// The process exited or the session was closed.
    StreamEnded,
    /// A chunk could not be written; it is lost.
    TransportFailed(TransportError),
    /// The session was removed or the manager is shutting down.
    Cancelled,
}

/// Forward every output chunk as a `shell/data` frame until the stream
/// ends, a write fails, or `cancel` fires.
pub(crate) async fn pump_output(
    mut output: OutputStream,
    mut encoder: ChunkEncoder,
    writer: Arc<OutboundWriter>,
    cancel: CancellationToken,
) -> PumpExit {
    loop {
        let chunk = tokio::select! {
            biased;
            _ = cancel.cancelled() => return PumpExit::Cancelled,
            chunk = output.next() => chunk,
        };

        let envelope = match chunk {
            Some(chunk) => {
                trace!(len = chunk.len(), "session output");
                match encoder.encode(&chunk) {
                    Some(envelope) => envelope,
                    None => continue,
                }
            }
            None => match encoder.finish() {
                Some(envelope) => {
                    if let Err(exit) = send(&writer, &envelope, &cancel).await {
                        return exit;
                    }
                    return PumpExit::StreamEnded;
                }
                None => return PumpExit::StreamEnded,
            },
        };

        if let Err(exit) = send(&writer, &envelope, &cancel).await {
            return exit;
        }
    }
}

async fn send(
    writer: &OutboundWriter,
    envelope: &Envelope,
    cancel: &CancellationToken,
) -> Result<(), PumpExit> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PumpExit::Cancelled),
        result = writer.send(envelope) => result.map_err(PumpExit::TransportFailed),
    }
}

/// Write queued input to the session in arrival order.
pub(crate) async fn feed_input(
    session_id: SessionId,
    session: Arc<dyn Session>,
    mut input: mpsc::UnboundedReceiver<Vec<u8>>,
    cancel: CancellationToken,
) {
    loop {
        let data = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            data = input.recv() => match data {
                Some(data) => data,
                None => break,
            },
        };
        if let Err(e) = session.write(&data).await {
            warn!(%session_id, error = %e, len = data.len(), "failed to write session input");
        }
    }
    debug!(%session_id, "input feeder stopped");
}
