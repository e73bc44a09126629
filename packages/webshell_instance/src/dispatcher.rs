//! Inbound side of one connection: read frames, decode, route.

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::DispatchError;
use crate::manager::ConnectionManager;
use crate::protocol::{self, Decoded, Envelope};
use crate::transport::FrameStream;

/// Read frames until the connection fails, the peer closes it, or
/// `link_cancel` fires.
pub(crate) async fn run(
    manager: &ConnectionManager,
    mut stream: FrameStream,
    link_cancel: CancellationToken,
) {
    loop {
        let frame = tokio::select! {
            biased;
            _ = link_cancel.cancelled() => {
                debug!("connection retired");
                return;
            }
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(frame)) => dispatch_frame(manager, &frame),
            Some(Err(e)) => {
                warn!(error = %e, "read failed");
                return;
            }
            None => {
                info!("connection closed by peer");
                return;
            }
        }
    }
}

/// Route one frame. Creation runs on a tracked task; data is queued for the
/// session without waiting on it.
pub(crate) fn dispatch_frame(manager: &ConnectionManager, frame: &[u8]) {
    let header = match protocol::peek(frame) {
        Ok(header) => header,
        Err(e) => {
            warn!(error = %e, len = frame.len(), "dropping malformed frame");
            return;
        }
    };

    // Filter on the cheap header before decoding the rest
    if let Some(instance_id) = &header.instance_id {
        if instance_id != manager.identity() {
            debug!(received = %instance_id, kind = %header.kind, "event for another instance");
            return;
        }
    }

    let envelope = match protocol::decode(&header, frame) {
        Ok(Decoded::Event(envelope)) => envelope,
        Ok(Decoded::Unknown { kind }) => {
            debug!(%kind, "ignoring unknown event type");
            return;
        }
        Err(e) => {
            warn!(kind = %header.kind, error = %e, "dropping undecodable event");
            return;
        }
    };

    match envelope {
        Envelope::Create(event) => {
            let creator = manager.clone();
            manager.spawn_tracked(async move {
                if let Err(e) = creator.dispatch_create(event).await {
                    report(&e);
                }
            });
        }
        Envelope::Data(event) => {
            if let Err(e) = manager.dispatch_data(event) {
                report(&e);
            }
        }
    }
}

fn report(err: &DispatchError) {
    match err {
        DispatchError::IdentityMismatch { .. } | DispatchError::Closed => {
            debug!(error = %err, "event dropped")
        }
        DispatchError::SessionNotFound(session_id) => {
            warn!(%session_id, "data for unknown session dropped")
        }
        DispatchError::Decode(e) => warn!(error = %e, "undecodable payload dropped"),
        DispatchError::Spawn(e) => {
            error!(session_id = %e.session_id, error = %e.reason, "failed to create session")
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::manager::ManagerSettings;
    use crate::protocol::{InstanceId, SessionId};
    use crate::test_helpers::{FakeDialer, FakeSpawner, wait_for};

    fn manager() -> (ConnectionManager, Arc<FakeSpawner>) {
        let (dialer, _peers) = FakeDialer::new(usize::MAX);
        let spawner = FakeSpawner::new();
        let manager = ConnectionManager::with_dialer(
            dialer,
            ManagerSettings::new(InstanceId::new("I1")),
            spawner.clone(),
        );
        (manager, spawner)
    }

    #[tokio::test]
    async fn garbage_and_unknown_frames_are_dropped() {
        let (manager, spawner) = manager();
        dispatch_frame(&manager, b"\x00\x01 not json");
        dispatch_frame(&manager, br#"{"type":"shell/resize","instanceId":"I1","cols":80}"#);
        dispatch_frame(&manager, br#"{"type":"shell/create","instanceId":"I1"}"#);
        dispatch_frame(
            &manager,
            br#"{"type":"shell/data","instanceId":"I1","clientId":"S1","data":"!","encoding":"base64"}"#,
        );
        assert_eq!(manager.session_count(), 0);
        assert_eq!(spawner.spawn_count(), 0);
        manager.close().await;
    }

    #[tokio::test]
    async fn create_frame_spawns_on_a_tracked_task() {
        let (manager, spawner) = manager();
        dispatch_frame(&manager, br#"{"type":"shell/create","instanceId":"I1","clientId":"S1"}"#);
        dispatch_frame(&manager, br#"{"type":"shell/create","instanceId":"I9","clientId":"S2"}"#);

        let registered = manager.clone();
        wait_for("S1", || registered.session_count() == 1).await;
        assert_eq!(manager.session_ids(), vec![SessionId::from("S1")]);
        assert_eq!(spawner.spawn_count(), 1);
        manager.close().await;
    }
}
