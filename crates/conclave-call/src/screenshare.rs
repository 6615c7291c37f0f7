//! Screen share — acquire a capture stream and hot-swap it onto existing
//! connections.
//!
//! Only the screen sender slot is touched: the audio sender keeps targeting
//! the camera stream throughout. The platform's native "stop sharing"
//! affordance ends the captured track; the coordinator watches for that and
//! routes it into the same stop path as a manual toggle.

use crate::capture::MediaSource;
use crate::peer::{PeerManager, TrackSlot};
use conclave_common::error::{CallError, CallResult};
use conclave_common::media::MediaStream;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Owns the local screen-capture stream for one call.
pub struct ScreenShareManager {
    source: Arc<dyn MediaSource>,
    peers: Arc<PeerManager>,
    active: Mutex<Option<MediaStream>>,
}

impl ScreenShareManager {
    pub fn new(source: Arc<dyn MediaSource>, peers: Arc<PeerManager>) -> Self {
        Self {
            source,
            peers,
            active: Mutex::new(None),
        }
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Acquire a display stream and attach its video track to every link's
    /// screen slot. Returns the stream so the coordinator can watch its
    /// video track for the native end signal.
    pub async fn start(&self) -> CallResult<MediaStream> {
        let mut active = self.active.lock().await;
        if let Some(existing) = active.as_ref() {
            return Ok(existing.clone());
        }

        let stream = self.source.display_media().await?;
        let track = stream
            .video_track()
            .cloned()
            .ok_or_else(|| CallError::MediaAcquisition {
                message: "display capture returned no video track".into(),
            })?;

        self.peers.set_outgoing_track(TrackSlot::Screen, Some(track)).await;
        *active = Some(stream.clone());
        tracing::info!(stream = %stream.id(), "Screen share started");
        Ok(stream)
    }

    /// Stop sharing: clear the screen slot on every link and stop the
    /// capture. Idempotent — a native track end and a manual toggle both
    /// land here, in either order.
    pub async fn stop(&self) -> bool {
        let stream = self.active.lock().await.take();
        match stream {
            Some(stream) => {
                self.peers.set_outgoing_track(TrackSlot::Screen, None).await;
                stream.stop();
                tracing::info!(stream = %stream.id(), "Screen share stopped");
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockMediaSource, MockPeerFactory};
    use crate::peer::PeerFactory;
    use tokio::sync::mpsc;

    fn fixture() -> (ScreenShareManager, Arc<MockPeerFactory>, Arc<PeerManager>) {
        let factory = Arc::new(MockPeerFactory::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let peers = Arc::new(PeerManager::new(
            "@alice:x".into(),
            vec![],
            factory.clone() as Arc<dyn PeerFactory>,
            tx,
        ));
        let mgr = ScreenShareManager::new(Arc::new(MockMediaSource::new()), peers.clone());
        (mgr, factory, peers)
    }

    #[tokio::test]
    async fn test_start_attaches_only_screen_slot() {
        let (mgr, factory, peers) = fixture();
        peers.ensure(&"@bob:x".to_string()).await.unwrap();

        mgr.start().await.unwrap();
        assert!(mgr.is_active().await);

        let link = factory.link("@bob:x").unwrap();
        assert!(link.attached(TrackSlot::Screen).is_some());
        assert!(link.attached(TrackSlot::Audio).is_none(), "camera audio untouched");
        assert!(link.attached(TrackSlot::Video).is_none(), "camera video untouched");
    }

    #[tokio::test]
    async fn test_start_twice_reuses_stream() {
        let (mgr, _, _) = fixture();
        let first = mgr.start().await.unwrap();
        let second = mgr.start().await.unwrap();
        assert_eq!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_stop_clears_slot_and_ends_capture() {
        let (mgr, factory, peers) = fixture();
        peers.ensure(&"@bob:x".to_string()).await.unwrap();

        let stream = mgr.start().await.unwrap();
        assert!(mgr.stop().await);
        assert!(!mgr.is_active().await);
        assert!(stream.video_track().unwrap().is_ended());
        assert!(factory.link("@bob:x").unwrap().attached(TrackSlot::Screen).is_none());

        assert!(!mgr.stop().await, "second stop is a no-op");
    }

    #[tokio::test]
    async fn test_new_peer_inherits_active_share() {
        let (mgr, factory, peers) = fixture();
        mgr.start().await.unwrap();

        peers.ensure(&"@late:x".to_string()).await.unwrap();
        let link = factory.link("@late:x").unwrap();
        assert!(link.attached(TrackSlot::Screen).is_some());
    }
}
