//! In-crate mock collaborators shared by the unit tests.

use crate::capture::MediaSource;
use crate::captions::CaptionSinks;
use crate::effects::{EffectsConfig, EffectsFactory, EffectsRig};
use crate::peer::{ChannelKind, PeerEvent, PeerFactory, PeerLink, SignalChannel, TrackSlot};
use crate::transport::{RoomEvent, RoomTransport};
use async_trait::async_trait;
use conclave_common::caption::{CaptionEvent, LiveTranscriptChunk};
use conclave_common::error::{CallError, CallResult};
use conclave_common::media::{MediaStream, MediaTrack, TrackKind};
use conclave_common::session::{CallKind, IceServerConfig};
use conclave_common::signal::{IceCandidate, SessionDescription};
use conclave_common::UserId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Route log output through the per-test capture so failing tests print
/// their trace. Safe to call from every fixture; only the first wins.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ---------------------------------------------------------------------------
// Transport

#[derive(Default)]
pub struct MockTransport {
    sent: Mutex<Vec<(String, serde_json::Value)>>,
    state_sent: Mutex<Vec<(String, serde_json::Value, String)>>,
    inbound_tx: Mutex<Option<mpsc::UnboundedSender<RoomEvent>>>,
    fail_sends: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_sends.store(failing, Ordering::SeqCst);
    }

    /// Deliver an inbound room event to whoever subscribed.
    pub fn inject(&self, event: RoomEvent) {
        if let Some(tx) = self.inbound_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn events(&self, event_type: &str) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == event_type)
            .map(|(_, c)| c.clone())
            .collect()
    }

    pub fn state_events(&self, event_type: &str) -> Vec<serde_json::Value> {
        self.state_sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _, _)| t == event_type)
            .map(|(_, c, _)| c.clone())
            .collect()
    }

    pub fn event_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    pub fn state_event_count(&self) -> usize {
        self.state_sent.lock().unwrap().len()
    }
}

#[async_trait]
impl RoomTransport for MockTransport {
    async fn send_event(
        &self,
        _room_id: &str,
        event_type: &str,
        content: serde_json::Value,
    ) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transport down");
        }
        self.sent.lock().unwrap().push((event_type.to_string(), content));
        Ok(())
    }

    async fn send_state_event(
        &self,
        _room_id: &str,
        event_type: &str,
        content: serde_json::Value,
        state_key: &str,
    ) -> anyhow::Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            anyhow::bail!("transport down");
        }
        self.state_sent
            .lock()
            .unwrap()
            .push((event_type.to_string(), content, state_key.to_string()));
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<RoomEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound_tx.lock().unwrap() = Some(tx);
        rx
    }
}

// ---------------------------------------------------------------------------
// Peer links

pub struct MockChannel {
    kind: ChannelKind,
    open: AtomicBool,
    log: Mutex<Vec<Vec<u8>>>,
}

impl MockChannel {
    fn new(kind: ChannelKind) -> Self {
        Self {
            kind,
            open: AtomicBool::new(true),
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl SignalChannel for MockChannel {
    fn kind(&self) -> ChannelKind {
        self.kind
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send(&self, data: &[u8]) -> CallResult<()> {
        if !self.is_open() {
            return Err(CallError::Signaling {
                message: "channel closed".into(),
            });
        }
        self.log.lock().unwrap().push(data.to_vec());
        Ok(())
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

pub struct MockPeerLink {
    pub remote: UserId,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    control: Arc<MockChannel>,
    caption: Arc<MockChannel>,
    tracks: Mutex<HashMap<TrackSlot, MediaTrack>>,
    offers: AtomicUsize,
    answers: AtomicUsize,
    applied_answers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
    ice_restarts: AtomicUsize,
    closed: AtomicBool,
    fail_negotiation: AtomicBool,
}

impl MockPeerLink {
    fn new(remote: UserId, events_tx: mpsc::UnboundedSender<PeerEvent>) -> Self {
        Self {
            remote,
            events_tx,
            control: Arc::new(MockChannel::new(ChannelKind::Control)),
            caption: Arc::new(MockChannel::new(ChannelKind::Caption)),
            tracks: Mutex::new(HashMap::new()),
            offers: AtomicUsize::new(0),
            answers: AtomicUsize::new(0),
            applied_answers: Mutex::new(Vec::new()),
            candidates: Mutex::new(Vec::new()),
            ice_restarts: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            fail_negotiation: AtomicBool::new(false),
        }
    }

    pub fn attached(&self, slot: TrackSlot) -> Option<MediaTrack> {
        self.tracks.lock().unwrap().get(&slot).cloned()
    }

    pub fn offer_count(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn answer_count(&self) -> usize {
        self.answers.load(Ordering::SeqCst)
    }

    pub fn applied_answers(&self) -> Vec<String> {
        self.applied_answers.lock().unwrap().clone()
    }

    pub fn candidates(&self) -> Vec<IceCandidate> {
        self.candidates.lock().unwrap().clone()
    }

    pub fn ice_restart_count(&self) -> usize {
        self.ice_restarts.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn set_fail_negotiation(&self, fail: bool) {
        self.fail_negotiation.store(fail, Ordering::SeqCst);
    }

    /// Push a peer event as the underlying connection would.
    pub fn emit(&self, event: PeerEvent) {
        let _ = self.events_tx.send(event);
    }
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn create_offer(&self) -> CallResult<SessionDescription> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation {
                remote: self.remote.clone(),
                message: "offer failed".into(),
            });
        }
        let n = self.offers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription {
            sdp: format!("offer-to-{}-{n}", self.remote),
        })
    }

    async fn create_answer(&self, offer: SessionDescription) -> CallResult<SessionDescription> {
        if self.fail_negotiation.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation {
                remote: self.remote.clone(),
                message: "answer failed".into(),
            });
        }
        self.answers.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription {
            sdp: format!("answer-to-{}", offer.sdp),
        })
    }

    async fn apply_answer(&self, answer: SessionDescription) -> CallResult<()> {
        self.applied_answers.lock().unwrap().push(answer.sdp);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> CallResult<()> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn restart_ice(&self) -> CallResult<()> {
        self.ice_restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn attach_track(&self, slot: TrackSlot, track: MediaTrack) -> CallResult<()> {
        self.tracks.lock().unwrap().insert(slot, track);
        Ok(())
    }

    async fn clear_track(&self, slot: TrackSlot) -> CallResult<()> {
        self.tracks.lock().unwrap().remove(&slot);
        Ok(())
    }

    fn open_channel(&self, kind: ChannelKind) -> CallResult<Arc<dyn SignalChannel>> {
        Ok(match kind {
            ChannelKind::Control => self.control.clone(),
            ChannelKind::Caption => self.caption.clone(),
        })
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.control.close();
        self.caption.close();
    }
}

#[derive(Default)]
pub struct MockPeerFactory {
    links: Mutex<HashMap<UserId, Arc<MockPeerLink>>>,
    fail_create: AtomicBool,
}

impl MockPeerFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn created_count(&self) -> usize {
        self.links.lock().unwrap().len()
    }

    pub fn link(&self, remote: &str) -> Option<Arc<MockPeerLink>> {
        self.links.lock().unwrap().get(remote).cloned()
    }

    pub fn channel_log(&self, remote: &str, kind: ChannelKind) -> Vec<Vec<u8>> {
        self.link(remote)
            .map(|l| match kind {
                ChannelKind::Control => l.control.sent(),
                ChannelKind::Caption => l.caption.sent(),
            })
            .unwrap_or_default()
    }

    pub fn close_channels(&self, remote: &str) {
        if let Some(link) = self.link(remote) {
            link.control.close();
            link.caption.close();
        }
    }
}

#[async_trait]
impl PeerFactory for MockPeerFactory {
    async fn create(
        &self,
        remote: &UserId,
        _ice_servers: &[IceServerConfig],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> CallResult<Arc<dyn PeerLink>> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(CallError::Negotiation {
                remote: remote.clone(),
                message: "factory down".into(),
            });
        }
        let link = Arc::new(MockPeerLink::new(remote.clone(), events));
        self.links.lock().unwrap().insert(remote.clone(), link.clone());
        Ok(link)
    }
}

// ---------------------------------------------------------------------------
// Media capture

#[derive(Default)]
pub struct MockMediaSource {
    fail_user_media: AtomicBool,
    fail_display_media: AtomicBool,
}

impl MockMediaSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_user_media(&self, fail: bool) {
        self.fail_user_media.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_display_media(&self, fail: bool) {
        self.fail_display_media.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaSource for MockMediaSource {
    async fn user_media(&self, kind: CallKind) -> CallResult<MediaStream> {
        if self.fail_user_media.load(Ordering::SeqCst) {
            return Err(CallError::MediaAcquisition {
                message: "permission denied".into(),
            });
        }
        Ok(match kind {
            CallKind::Voice => {
                MediaStream::with_tracks("mic", vec![MediaTrack::new(TrackKind::Audio)])
            }
            CallKind::Video => MediaStream::camera(),
        })
    }

    async fn display_media(&self) -> CallResult<MediaStream> {
        if self.fail_display_media.load(Ordering::SeqCst) {
            return Err(CallError::MediaAcquisition {
                message: "capture cancelled".into(),
            });
        }
        Ok(MediaStream::screen())
    }
}

// ---------------------------------------------------------------------------
// Effects

struct MockRig {
    stream: MediaStream,
    disposed: Arc<AtomicUsize>,
}

impl EffectsRig for MockRig {
    fn stream(&self) -> MediaStream {
        self.stream.clone()
    }

    fn dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockEffectsFactory {
    created: AtomicUsize,
    disposed: Arc<AtomicUsize>,
    configs: Mutex<Vec<EffectsConfig>>,
}

impl MockEffectsFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn disposed_count(&self) -> usize {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Configs passed to `create`, in order.
    pub fn configs(&self) -> Vec<EffectsConfig> {
        self.configs.lock().unwrap().clone()
    }
}

#[async_trait]
impl EffectsFactory for MockEffectsFactory {
    async fn create(
        &self,
        input: &MediaStream,
        config: &EffectsConfig,
    ) -> CallResult<Box<dyn EffectsRig>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        self.configs.lock().unwrap().push(config.clone());
        // Derived stream: same track kinds, fresh tracks.
        let tracks = input.tracks().iter().map(|t| MediaTrack::new(t.kind())).collect();
        Ok(Box::new(MockRig {
            stream: MediaStream::with_tracks("processed", tracks),
            disposed: self.disposed.clone(),
        }))
    }

    fn default_config(&self) -> EffectsConfig {
        serde_json::json!({ "background": "none" })
    }
}

/// Always fails; exercises the fall-back-to-raw path.
pub struct FailingEffectsFactory;

#[async_trait]
impl EffectsFactory for FailingEffectsFactory {
    async fn create(
        &self,
        _input: &MediaStream,
        _config: &EffectsConfig,
    ) -> CallResult<Box<dyn EffectsRig>> {
        Err(CallError::EffectsPipeline {
            message: "gpu unavailable".into(),
        })
    }

    fn default_config(&self) -> EffectsConfig {
        serde_json::json!({})
    }
}

// ---------------------------------------------------------------------------
// Caption sinks

#[derive(Default)]
pub struct RecordingSinks {
    timeline: Mutex<Vec<CaptionEvent>>,
    indexed: AtomicUsize,
    notified: AtomicUsize,
    chunks: Mutex<Vec<LiveTranscriptChunk>>,
    fail: AtomicBool,
}

impl RecordingSinks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn timeline_count(&self) -> usize {
        self.timeline.lock().unwrap().len()
    }

    pub fn indexed_count(&self) -> usize {
        self.indexed.load(Ordering::SeqCst)
    }

    pub fn notified_count(&self) -> usize {
        self.notified.load(Ordering::SeqCst)
    }

    pub fn chunks(&self) -> Vec<LiveTranscriptChunk> {
        self.chunks.lock().unwrap().clone()
    }
}

#[async_trait]
impl CaptionSinks for RecordingSinks {
    async fn append_to_timeline(&self, event: &CaptionEvent) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("timeline unavailable");
        }
        self.timeline.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn index_for_search(&self, _event: &CaptionEvent) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("search unavailable");
        }
        self.indexed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn push_notify(&self, _event: &CaptionEvent) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("notify unavailable");
        }
        self.notified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn emit_live_chunk(&self, chunk: LiveTranscriptChunk) {
        self.chunks.lock().unwrap().push(chunk);
    }
}
