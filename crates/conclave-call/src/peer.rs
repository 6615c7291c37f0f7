//! Peer connection management — one link per remote participant.
//!
//! Mesh topology: every participant connects directly to every other one.
//! Each entry owns at most one underlying connection, one control data
//! channel, one caption data channel, and a queue of signals that arrived
//! before the connection existed.
//!
//! Glare avoidance is deterministic: for any pair, the participant whose id
//! sorts lexicographically smaller always initiates the offer and the other
//! always waits for one. Only one side ever creates an offer, so no
//! perfect-negotiation rollback logic is needed.

use async_trait::async_trait;
use conclave_common::error::CallResult;
use conclave_common::media::{MediaStream, MediaTrack};
use conclave_common::participant::PeerConnectionState;
use conclave_common::session::IceServerConfig;
use conclave_common::signal::{IceCandidate, SessionDescription, SignalPayload};
use conclave_common::UserId;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// Outgoing sender slots on a peer link. Replacing a slot's track must never
/// renegotiate (replaceTrack semantics, not remove+add).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackSlot {
    Audio,
    Video,
    Screen,
}

/// The two data channels every link carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    Control,
    Caption,
}

/// Events surfaced by a peer link implementation back into the coordinator's
/// single event-processing context.
#[derive(Debug)]
pub enum PeerEvent {
    IceCandidate {
        remote: UserId,
        candidate: IceCandidate,
    },
    StateChange {
        remote: UserId,
        state: PeerConnectionState,
    },
    /// Remote camera/mic stream arrived.
    RemoteStream {
        remote: UserId,
        stream: MediaStream,
    },
    /// Remote screen-share stream arrived.
    RemoteScreenStream {
        remote: UserId,
        stream: MediaStream,
    },
    ChannelOpen {
        remote: UserId,
        kind: ChannelKind,
    },
    ChannelMessage {
        remote: UserId,
        kind: ChannelKind,
        data: Vec<u8>,
    },
}

/// A data channel on one peer link.
#[async_trait]
pub trait SignalChannel: Send + Sync {
    fn kind(&self) -> ChannelKind;
    fn is_open(&self) -> bool;
    async fn send(&self, data: &[u8]) -> CallResult<()>;
    fn close(&self);
}

/// One WebRTC connection to a remote participant.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn create_offer(&self) -> CallResult<SessionDescription>;
    async fn create_answer(&self, offer: SessionDescription) -> CallResult<SessionDescription>;
    async fn apply_answer(&self, answer: SessionDescription) -> CallResult<()>;
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> CallResult<()>;
    async fn restart_ice(&self) -> CallResult<()>;

    /// Point a sender slot at a track, replacing whatever it carried.
    async fn attach_track(&self, slot: TrackSlot, track: MediaTrack) -> CallResult<()>;
    async fn clear_track(&self, slot: TrackSlot) -> CallResult<()>;

    fn open_channel(&self, kind: ChannelKind) -> CallResult<Arc<dyn SignalChannel>>;
    fn close(&self);
}

/// Creates peer links. Implementations wire their ICE/track/state callbacks
/// into the provided event sender.
#[async_trait]
pub trait PeerFactory: Send + Sync {
    async fn create(
        &self,
        remote: &UserId,
        ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> CallResult<Arc<dyn PeerLink>>;
}

/// One remote participant's connection and its channels.
#[derive(Clone)]
pub struct PeerEntry {
    pub remote: UserId,
    pub link: Arc<dyn PeerLink>,
    pub control: Arc<dyn SignalChannel>,
    pub caption: Arc<dyn SignalChannel>,
}

/// Tracks currently attached to every outgoing sender.
#[derive(Default, Clone)]
struct OutgoingTracks {
    audio: Option<MediaTrack>,
    video: Option<MediaTrack>,
    screen: Option<MediaTrack>,
}

impl OutgoingTracks {
    fn get(&self, slot: TrackSlot) -> Option<&MediaTrack> {
        match slot {
            TrackSlot::Audio => self.audio.as_ref(),
            TrackSlot::Video => self.video.as_ref(),
            TrackSlot::Screen => self.screen.as_ref(),
        }
    }

    fn set(&mut self, slot: TrackSlot, track: Option<MediaTrack>) {
        match slot {
            TrackSlot::Audio => self.audio = track,
            TrackSlot::Video => self.video = track,
            TrackSlot::Screen => self.screen = track,
        }
    }
}

/// Owns every peer link for one call.
pub struct PeerManager {
    local_user: UserId,
    ice_servers: Vec<IceServerConfig>,
    factory: Arc<dyn PeerFactory>,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    peers: RwLock<HashMap<UserId, PeerEntry>>,
    /// Offers/answers/candidates that arrived before the connection existed.
    pending_signals: Mutex<HashMap<UserId, Vec<SignalPayload>>>,
    outgoing: RwLock<OutgoingTracks>,
}

/// Glare rule: for a pair of ids, the lexicographically smaller one offers.
pub fn initiates_offer(local: &str, remote: &str) -> bool {
    local < remote
}

impl PeerManager {
    pub fn new(
        local_user: UserId,
        ice_servers: Vec<IceServerConfig>,
        factory: Arc<dyn PeerFactory>,
        events_tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            local_user,
            ice_servers,
            factory,
            events_tx,
            peers: RwLock::new(HashMap::new()),
            pending_signals: Mutex::new(HashMap::new()),
            outgoing: RwLock::new(OutgoingTracks::default()),
        }
    }

    pub fn is_initiator_toward(&self, remote: &str) -> bool {
        initiates_offer(&self.local_user, remote)
    }

    pub async fn get(&self, remote: &str) -> Option<PeerEntry> {
        self.peers.read().await.get(remote).cloned()
    }

    pub async fn contains(&self, remote: &str) -> bool {
        self.peers.read().await.contains_key(remote)
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    /// Return the existing link for `remote` or build one: create the
    /// connection, attach every currently-held outgoing track, and open the
    /// control and caption channels.
    ///
    /// Returns the entry plus any signals buffered for `remote` before the
    /// connection existed; the caller drains them immediately.
    pub async fn ensure(&self, remote: &UserId) -> CallResult<(PeerEntry, Vec<SignalPayload>)> {
        if let Some(entry) = self.get(remote).await {
            return Ok((entry, Vec::new()));
        }

        let link = self
            .factory
            .create(remote, &self.ice_servers, self.events_tx.clone())
            .await?;

        let outgoing = self.outgoing.read().await.clone();
        for slot in [TrackSlot::Audio, TrackSlot::Video, TrackSlot::Screen] {
            if let Some(track) = outgoing.get(slot) {
                link.attach_track(slot, track.clone()).await?;
            }
        }

        let control = link.open_channel(ChannelKind::Control)?;
        let caption = link.open_channel(ChannelKind::Caption)?;

        let entry = PeerEntry {
            remote: remote.clone(),
            link,
            control,
            caption,
        };

        self.peers.write().await.insert(remote.clone(), entry.clone());

        let pending = self
            .pending_signals
            .lock()
            .await
            .remove(remote)
            .unwrap_or_default();

        tracing::info!(
            remote = %remote,
            buffered = pending.len(),
            "Peer connection created"
        );

        Ok((entry, pending))
    }

    /// Buffer a signal that arrived before the connection for `from` existed.
    pub async fn buffer_signal(&self, from: &UserId, payload: SignalPayload) {
        tracing::debug!(from = %from, "Buffering early signal");
        self.pending_signals
            .lock()
            .await
            .entry(from.clone())
            .or_default()
            .push(payload);
    }

    pub async fn pending_count(&self, from: &str) -> usize {
        self.pending_signals
            .lock()
            .await
            .get(from)
            .map(|v| v.len())
            .unwrap_or(0)
    }

    /// Point an outgoing sender slot at a new track across every open link.
    /// `None` clears the slot.
    pub async fn set_outgoing_track(&self, slot: TrackSlot, track: Option<MediaTrack>) {
        self.outgoing.write().await.set(slot, track.clone());

        let entries: Vec<PeerEntry> = self.peers.read().await.values().cloned().collect();
        for entry in entries {
            let result = match &track {
                Some(t) => entry.link.attach_track(slot, t.clone()).await,
                None => entry.link.clear_track(slot).await,
            };
            if let Err(e) = result {
                tracing::warn!(remote = %entry.remote, error = %e, "Failed to retarget sender");
            }
        }
    }

    /// All open data channels of one kind, for broadcast fan-out.
    pub async fn open_channels(&self, kind: ChannelKind) -> Vec<(UserId, Arc<dyn SignalChannel>)> {
        self.peers
            .read()
            .await
            .values()
            .map(|e| {
                let ch = match kind {
                    ChannelKind::Control => e.control.clone(),
                    ChannelKind::Caption => e.caption.clone(),
                };
                (e.remote.clone(), ch)
            })
            .filter(|(_, ch)| ch.is_open())
            .collect()
    }

    /// Tear down one peer: close channels and the link, drop buffered
    /// signals. Used on leave and kick.
    pub async fn remove(&self, remote: &str) -> bool {
        self.pending_signals.lock().await.remove(remote);
        if let Some(entry) = self.peers.write().await.remove(remote) {
            entry.control.close();
            entry.caption.close();
            entry.link.close();
            tracing::info!(remote = %remote, "Peer connection removed");
            true
        } else {
            false
        }
    }

    /// Tear down everything. Part of coordinator teardown.
    pub async fn close_all(&self) {
        self.pending_signals.lock().await.clear();
        let mut peers = self.peers.write().await;
        for (_, entry) in peers.drain() {
            entry.control.close();
            entry.caption.close();
            entry.link.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPeerFactory;

    fn manager(factory: &Arc<MockPeerFactory>) -> PeerManager {
        let (tx, _rx) = mpsc::unbounded_channel();
        PeerManager::new(
            "@alice:x".into(),
            IceServerConfig::default_stun(),
            factory.clone() as Arc<dyn PeerFactory>,
            tx,
        )
    }

    #[test]
    fn test_glare_rule_is_lexicographic() {
        assert!(initiates_offer("@alice:x", "@bob:x"));
        assert!(!initiates_offer("@bob:x", "@alice:x"));
        assert!(!initiates_offer("@bob:x", "@bob:x"), "never self-offer");
    }

    #[tokio::test]
    async fn test_ensure_is_idempotent() {
        let factory = Arc::new(MockPeerFactory::new());
        let mgr = manager(&factory);

        let (first, _) = mgr.ensure(&"@bob:x".to_string()).await.unwrap();
        let (second, _) = mgr.ensure(&"@bob:x".to_string()).await.unwrap();
        assert!(Arc::ptr_eq(&first.link, &second.link));
        assert_eq!(factory.created_count(), 1);
        assert_eq!(mgr.len().await, 1);
    }

    #[tokio::test]
    async fn test_buffered_signals_drain_on_create() {
        let factory = Arc::new(MockPeerFactory::new());
        let mgr = manager(&factory);
        let bob: UserId = "@bob:x".into();

        mgr.buffer_signal(
            &bob,
            SignalPayload::IceCandidate {
                candidate: IceCandidate {
                    candidate: "candidate:0".into(),
                    sdp_mid: None,
                    sdp_m_line_index: None,
                },
            },
        )
        .await;
        assert_eq!(mgr.pending_count(&bob).await, 1);

        let (_, pending) = mgr.ensure(&bob).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(mgr.pending_count(&bob).await, 0);
    }

    #[tokio::test]
    async fn test_new_link_gets_held_tracks_and_channels() {
        let factory = Arc::new(MockPeerFactory::new());
        let mgr = manager(&factory);

        let track = MediaTrack::new(conclave_common::media::TrackKind::Video);
        mgr.set_outgoing_track(TrackSlot::Video, Some(track.clone())).await;

        let (entry, _) = mgr.ensure(&"@bob:x".to_string()).await.unwrap();
        let link = factory.link("@bob:x").unwrap();
        assert_eq!(link.attached(TrackSlot::Video).map(|t| t.id().to_string()), Some(track.id().to_string()));
        assert!(entry.control.is_open());
        assert!(entry.caption.is_open());
    }

    #[tokio::test]
    async fn test_set_outgoing_retargets_existing_links() {
        let factory = Arc::new(MockPeerFactory::new());
        let mgr = manager(&factory);
        mgr.ensure(&"@bob:x".to_string()).await.unwrap();
        mgr.ensure(&"@carol:x".to_string()).await.unwrap();

        let track = MediaTrack::new(conclave_common::media::TrackKind::Audio);
        mgr.set_outgoing_track(TrackSlot::Audio, Some(track.clone())).await;

        for remote in ["@bob:x", "@carol:x"] {
            let link = factory.link(remote).unwrap();
            assert!(link.attached(TrackSlot::Audio).is_some(), "{remote} missing track");
        }

        mgr.set_outgoing_track(TrackSlot::Audio, None).await;
        assert!(factory.link("@bob:x").unwrap().attached(TrackSlot::Audio).is_none());
    }

    #[tokio::test]
    async fn test_remove_and_close_all_clear_state() {
        let factory = Arc::new(MockPeerFactory::new());
        let mgr = manager(&factory);
        mgr.ensure(&"@bob:x".to_string()).await.unwrap();
        mgr.ensure(&"@carol:x".to_string()).await.unwrap();

        assert!(mgr.remove("@bob:x").await);
        assert!(!mgr.remove("@bob:x").await, "second remove is a no-op");
        assert!(factory.link("@bob:x").unwrap().is_closed());

        mgr.close_all().await;
        assert!(mgr.is_empty().await);
        assert!(factory.link("@carol:x").unwrap().is_closed());
    }
}
