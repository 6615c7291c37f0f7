//! Control bus — low-latency broadcast of small state deltas.
//!
//! Every delta travels two ways:
//! 1. immediately over every open control data channel (best effort, lost on
//!    disconnect), and
//! 2. via a debounced durable room state event (eventually consistent, read
//!    by late joiners and on reconnect).
//!
//! The debounce coalesces bursts of participant/stage mutations into one
//! durable write; the channel sends cover the latency gap in between.

use crate::peer::{ChannelKind, PeerManager};
use crate::registry::ParticipantRegistry;
use crate::transport::RoomTransport;
use crate::CallEvent;
use chrono::Utc;
use conclave_common::control::{ControlEnvelope, ControlMessage};
use conclave_common::error::{CallError, CallResult};
use conclave_common::events::{
    CallStateContent, ParticipantsStateContent, GROUP_CALL_CONTROL_EVENT_TYPE,
    GROUP_CALL_PARTICIPANTS_EVENT_TYPE, GROUP_CALL_STATE_EVENT_TYPE,
};
use conclave_common::session::CallSession;
use conclave_common::{RoomId, SessionId, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;

/// How long a burst of mutations may settle before the durable state events
/// are written. Reset on every triggering mutation.
pub const STATE_SYNC_DEBOUNCE: Duration = Duration::from_millis(350);

/// Two-tier state propagation for one call.
pub struct ControlBus {
    room_id: RoomId,
    session_id: SessionId,
    local_user: UserId,
    transport: Arc<dyn RoomTransport>,
    peers: Arc<PeerManager>,
    registry: Arc<ParticipantRegistry>,
    session: Arc<RwLock<CallSession>>,
    events_tx: broadcast::Sender<CallEvent>,
    /// The pending debounce timer, aborted and replaced on each re-trigger.
    debounce: Mutex<Option<JoinHandle<()>>>,
}

impl ControlBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        room_id: RoomId,
        session_id: SessionId,
        local_user: UserId,
        transport: Arc<dyn RoomTransport>,
        peers: Arc<PeerManager>,
        registry: Arc<ParticipantRegistry>,
        session: Arc<RwLock<CallSession>>,
        events_tx: broadcast::Sender<CallEvent>,
    ) -> Arc<Self> {
        Arc::new(Self {
            room_id,
            session_id,
            local_user,
            transport,
            peers,
            registry,
            session,
            events_tx,
            debounce: Mutex::new(None),
        })
    }

    fn envelope(&self, message: ControlMessage) -> ControlEnvelope {
        ControlEnvelope {
            session_id: self.session_id.clone(),
            from: self.local_user.clone(),
            message,
        }
    }

    /// Broadcast a delta over every open control channel, then schedule the
    /// debounced durable write. Channel failures are logged per peer and
    /// never abort the fan-out.
    pub async fn broadcast(self: &Arc<Self>, message: ControlMessage) {
        let envelope = self.envelope(message);
        match serde_json::to_vec(&envelope) {
            Ok(bytes) => {
                for (remote, channel) in self.peers.open_channels(ChannelKind::Control).await {
                    if let Err(e) = channel.send(&bytes).await {
                        tracing::warn!(remote = %remote, error = %e, "Control channel send failed");
                    }
                }
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode control message");
            }
        }
        self.schedule_sync().await;
    }

    /// Send one control message to a single peer. Used for the
    /// `participants-sync` snapshot pushed the moment a channel opens.
    pub async fn send_to(&self, remote: &str, message: ControlMessage) -> CallResult<()> {
        let entry = self
            .peers
            .get(remote)
            .await
            .ok_or_else(|| CallError::UnknownParticipant { user_id: remote.into() })?;
        let bytes = serde_json::to_vec(&self.envelope(message))?;
        entry.control.send(&bytes).await
    }

    /// (Re)arm the debounce timer. Each call replaces the previous pending
    /// write so a burst of mutations yields a single durable snapshot.
    pub async fn schedule_sync(self: &Arc<Self>) {
        let mut guard = self.debounce.lock().await;
        if let Some(handle) = guard.take() {
            handle.abort();
        }
        let bus = Arc::downgrade(self);
        *guard = Some(tokio::spawn(async move {
            tokio::time::sleep(STATE_SYNC_DEBOUNCE).await;
            if let Some(bus) = bus.upgrade() {
                bus.flush().await;
            }
        }));
    }

    /// Write the durable participants and call state events immediately.
    /// Send failures surface as `error` events; they are never retried —
    /// the next debounce cycle is the reconciliation path.
    pub async fn flush(&self) {
        let participants = self.registry.summaries().await;
        let stage = self.registry.stage().await;
        let session = self.session.read().await.clone();

        let participants_content = ParticipantsStateContent {
            session_id: self.session_id.clone(),
            participants: participants.clone(),
            updated_at: Utc::now(),
        };
        let call_content = CallStateContent {
            session_id: self.session_id.clone(),
            started_by: session.started_by,
            started_at: session.started_at,
            kind: session.kind,
            url: session.url,
            participants,
            co_watch: session.co_watch,
            stage,
        };

        for (event_type, content) in [
            (GROUP_CALL_PARTICIPANTS_EVENT_TYPE, serde_json::to_value(&participants_content)),
            (GROUP_CALL_STATE_EVENT_TYPE, serde_json::to_value(&call_content)),
        ] {
            let content = match content {
                Ok(c) => c,
                Err(e) => {
                    tracing::error!(event_type, error = %e, "Failed to encode state event");
                    continue;
                }
            };
            if let Err(e) = self
                .transport
                .send_state_event(&self.room_id, event_type, content, &self.session_id)
                .await
            {
                tracing::warn!(event_type, error = %e, "State event write failed");
                let _ = self.events_tx.send(CallEvent::Error {
                    code: "SIGNALING",
                    message: format!("state event write failed: {e}"),
                });
            }
        }
    }

    /// Also mirror a control message onto the room's control event type.
    /// Used for deltas that must reach peers with no open channel yet.
    pub async fn send_room_fallback(&self, message: ControlMessage) {
        let envelope = self.envelope(message);
        let content = match serde_json::to_value(&envelope) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode control event");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send_event(&self.room_id, GROUP_CALL_CONTROL_EVENT_TYPE, content)
            .await
        {
            tracing::warn!(error = %e, "Control event send failed");
            let _ = self.events_tx.send(CallEvent::Error {
                code: "SIGNALING",
                message: format!("control event send failed: {e}"),
            });
        }
    }

    /// Cancel any pending debounce. Part of teardown.
    pub async fn cancel(&self) {
        if let Some(handle) = self.debounce.lock().await.take() {
            handle.abort();
        }
    }
}
