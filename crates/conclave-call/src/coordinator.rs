//! Call coordinator — lifecycle, event dispatch, and teardown for one call.
//!
//! One coordinator instance owns all call state; nothing is process-global.
//! All mutation happens inside its event-processing context, driven by
//! (a) inbound room events, (b) peer-connection callbacks, and (c) local
//! user actions. The only suspension points are awaited I/O (capture,
//! negotiation, transport sends), so there is no concurrent mutation to
//! lock against beyond the per-map guards.

use crate::capture::MediaSource;
use crate::captions::{CaptionRelay, CaptionSinks};
use crate::control_bus::ControlBus;
use crate::effects::{EffectsConfig, EffectsFactory, MediaEffectsBridge};
use crate::peer::{ChannelKind, PeerEntry, PeerEvent, PeerFactory, PeerManager, TrackSlot};
use crate::registry::ParticipantRegistry;
use crate::screenshare::ScreenShareManager;
use crate::transport::{RoomEvent, RoomTransport};
use crate::CallEvent;
use chrono::Utc;
use conclave_common::caption::{CaptionEvent, CaptionTranslation};
use conclave_common::control::{ControlEnvelope, ControlMessage};
use conclave_common::error::{CallError, CallResult};
use conclave_common::events::{
    CallStateContent, ParticipantsStateContent, GROUP_CALL_CONTROL_EVENT_TYPE,
    GROUP_CALL_PARTICIPANTS_EVENT_TYPE, GROUP_CALL_SIGNAL_EVENT_TYPE,
    GROUP_CALL_STATE_EVENT_TYPE,
};
use conclave_common::participant::{
    Participant, ParticipantRole, ParticipantSummary, PeerConnectionState,
};
use conclave_common::session::{CallKind, CallSession, CoWatchState, IceServerConfig};
use conclave_common::signal::{SignalEnvelope, SignalPayload};
use conclave_common::stage::StageState;
use conclave_common::{RoomId, SessionId, UserId};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Everything needed to create a coordinator.
#[derive(Clone)]
pub struct CallOptions {
    pub room_id: RoomId,
    /// `None` starts a new call; `Some` joins an existing one.
    pub session_id: Option<SessionId>,
    pub user_id: UserId,
    pub display_name: String,
    pub avatar_url: Option<String>,
    pub role: ParticipantRole,
    pub kind: CallKind,
    /// Deep link into the hosting application.
    pub url: Option<String>,
    pub ice_servers: Vec<IceServerConfig>,
    /// Active video-effects configuration; `None` sends the raw capture.
    pub effects_config: Option<EffectsConfig>,
}

impl CallOptions {
    pub fn new(
        room_id: impl Into<RoomId>,
        user_id: impl Into<UserId>,
        display_name: impl Into<String>,
        kind: CallKind,
    ) -> Self {
        Self {
            room_id: room_id.into(),
            session_id: None,
            user_id: user_id.into(),
            display_name: display_name.into(),
            avatar_url: None,
            role: ParticipantRole::Host,
            kind,
            url: None,
            ice_servers: IceServerConfig::default_stun(),
            effects_config: None,
        }
    }
}

/// External collaborators, all dyn-dispatched so embedders and tests can
/// swap implementations.
#[derive(Clone)]
pub struct CallCollaborators {
    pub transport: Arc<dyn RoomTransport>,
    pub peer_factory: Arc<dyn PeerFactory>,
    pub media: Arc<dyn MediaSource>,
    pub effects: Arc<dyn EffectsFactory>,
    pub caption_sinks: Arc<dyn CaptionSinks>,
}

/// Point-in-time call statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CallStats {
    pub participants: usize,
    pub speakers: usize,
    pub listeners: usize,
    pub hand_raise_queue: usize,
    pub open_peers: usize,
    pub caption_history: usize,
}

/// Orchestrates one group call.
pub struct CallCoordinator {
    room_id: RoomId,
    session_id: SessionId,
    local_user: UserId,
    transport: Arc<dyn RoomTransport>,
    registry: Arc<ParticipantRegistry>,
    peers: Arc<PeerManager>,
    control: Arc<ControlBus>,
    captions: Arc<CaptionRelay>,
    effects: Arc<MediaEffectsBridge>,
    screenshare: Arc<ScreenShareManager>,
    session: Arc<RwLock<CallSession>>,
    /// Effects configs applied to specific remotes' incoming streams.
    incoming_effects: RwLock<HashMap<UserId, EffectsConfig>>,
    events_tx: broadcast::Sender<CallEvent>,
    disposed: AtomicBool,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    screen_watch: Mutex<Option<JoinHandle<()>>>,
}

impl CallCoordinator {
    /// Acquire local media, announce the call, and start processing events.
    /// Media acquisition failure is the one fatal creation error.
    pub async fn create(
        options: CallOptions,
        collaborators: CallCollaborators,
    ) -> CallResult<Arc<Self>> {
        let session_id = options
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let raw = collaborators.media.user_media(options.kind).await?;

        let room_rx = collaborators.transport.subscribe();
        let (peer_tx, peer_rx) = mpsc::unbounded_channel();

        let ice_servers = if options.ice_servers.is_empty() {
            IceServerConfig::default_stun()
        } else {
            options.ice_servers.clone()
        };
        let peers = Arc::new(PeerManager::new(
            options.user_id.clone(),
            ice_servers,
            collaborators.peer_factory.clone(),
            peer_tx,
        ));

        let mut local = Participant::local(
            options.user_id.clone(),
            options.display_name.clone(),
            options.role,
        );
        local.avatar_url = options.avatar_url.clone();
        let registry = Arc::new(ParticipantRegistry::new(local));

        let mut session = CallSession::new(session_id.clone(), options.user_id.clone(), options.kind);
        session.url = options.url.clone();
        let session = Arc::new(RwLock::new(session));

        let effects = Arc::new(MediaEffectsBridge::new(
            collaborators.effects.clone(),
            peers.clone(),
        ));
        let outgoing = effects.install_local(raw, options.effects_config.clone()).await;
        peers
            .set_outgoing_track(TrackSlot::Audio, outgoing.audio_track().cloned())
            .await;
        peers
            .set_outgoing_track(TrackSlot::Video, outgoing.video_track().cloned())
            .await;
        registry.set_stream(&options.user_id, Some(outgoing)).await;
        registry.recompute_stage().await;

        let (events_tx, _) = broadcast::channel(64);
        let control = ControlBus::new(
            options.room_id.clone(),
            session_id.clone(),
            options.user_id.clone(),
            collaborators.transport.clone(),
            peers.clone(),
            registry.clone(),
            session.clone(),
            events_tx.clone(),
        );
        let captions = Arc::new(CaptionRelay::new(
            session_id.clone(),
            options.user_id.clone(),
            peers.clone(),
            collaborators.caption_sinks.clone(),
        ));
        let screenshare = Arc::new(ScreenShareManager::new(
            collaborators.media.clone(),
            peers.clone(),
        ));

        let coordinator = Arc::new(Self {
            room_id: options.room_id.clone(),
            session_id: session_id.clone(),
            local_user: options.user_id.clone(),
            transport: collaborators.transport.clone(),
            registry,
            peers,
            control,
            captions,
            effects,
            screenshare,
            session,
            incoming_effects: RwLock::new(HashMap::new()),
            events_tx,
            disposed: AtomicBool::new(false),
            event_loop: Mutex::new(None),
            screen_watch: Mutex::new(None),
        });

        let loop_handle = tokio::spawn(Self::run_event_loop(
            Arc::downgrade(&coordinator),
            room_rx,
            peer_rx,
        ));
        *coordinator.event_loop.lock().await = Some(loop_handle);

        let member = coordinator.registry.local().await.to_summary();
        coordinator
            .send_signal(SignalEnvelope::broadcast(
                session_id,
                options.user_id,
                SignalPayload::Join { member },
            ))
            .await;
        coordinator.control.flush().await;

        tracing::info!(
            session = %coordinator.session_id,
            user = %coordinator.local_user,
            "Call coordinator started"
        );
        Ok(coordinator)
    }

    // -- accessors ----------------------------------------------------------

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Subscribe to call events. Receivers lagging behind drop the oldest
    /// events, never block the call.
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.events_tx.subscribe()
    }

    pub async fn participants(&self) -> Vec<Participant> {
        self.registry.all().await
    }

    pub async fn stage(&self) -> StageState {
        self.registry.stage().await
    }

    pub async fn session(&self) -> CallSession {
        self.session.read().await.clone()
    }

    pub async fn stats(&self) -> CallStats {
        let stage = self.registry.stage().await;
        CallStats {
            participants: self.registry.len().await,
            speakers: stage.speakers.len(),
            listeners: stage.listeners.len(),
            hand_raise_queue: stage.hand_raise_queue.len(),
            open_peers: self.peers.len().await,
            caption_history: self.captions.history_len().await,
        }
    }

    // -- event loop ---------------------------------------------------------

    async fn run_event_loop(
        this: Weak<Self>,
        mut room_rx: mpsc::UnboundedReceiver<RoomEvent>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerEvent>,
    ) {
        loop {
            tokio::select! {
                ev = room_rx.recv() => {
                    let Some(ev) = ev else { break };
                    let Some(c) = this.upgrade() else { break };
                    if c.is_disposed() {
                        break;
                    }
                    c.handle_room_event(ev).await;
                }
                ev = peer_rx.recv() => {
                    let Some(ev) = ev else { break };
                    let Some(c) = this.upgrade() else { break };
                    if c.is_disposed() {
                        break;
                    }
                    c.handle_peer_event(ev).await;
                }
            }
        }
    }

    async fn handle_room_event(self: &Arc<Self>, event: RoomEvent) {
        match event.event_type.as_str() {
            GROUP_CALL_SIGNAL_EVENT_TYPE => {
                let envelope: SignalEnvelope = match serde_json::from_value(event.content) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring malformed signal event");
                        return;
                    }
                };
                if !envelope.accepts(&self.session_id, &self.local_user) {
                    return;
                }
                self.handle_signal(envelope).await;
            }
            GROUP_CALL_CONTROL_EVENT_TYPE => {
                let envelope: ControlEnvelope = match serde_json::from_value(event.content) {
                    Ok(e) => e,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring malformed control event");
                        return;
                    }
                };
                if envelope.session_id != self.session_id || envelope.from == self.local_user {
                    return;
                }
                self.handle_control(envelope.from, envelope.message).await;
            }
            GROUP_CALL_PARTICIPANTS_EVENT_TYPE => {
                if event.sender == self.local_user {
                    return;
                }
                let content: ParticipantsStateContent = match serde_json::from_value(event.content) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring malformed participants state");
                        return;
                    }
                };
                if content.session_id != self.session_id {
                    return;
                }
                self.merge_participants(content.participants).await;
            }
            GROUP_CALL_STATE_EVENT_TYPE => {
                if event.sender == self.local_user {
                    return;
                }
                let content: CallStateContent = match serde_json::from_value(event.content) {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::debug!(error = %e, "Ignoring malformed call state");
                        return;
                    }
                };
                if content.session_id != self.session_id {
                    return;
                }
                self.replay_call_state(content).await;
            }
            other => {
                tracing::trace!(event_type = other, "Ignoring unrelated room event");
            }
        }
    }

    // -- signaling ----------------------------------------------------------

    async fn handle_signal(self: &Arc<Self>, envelope: SignalEnvelope) {
        let from = envelope.from;
        match envelope.payload {
            SignalPayload::Join { member } => self.handle_remote_join(from, member).await,
            SignalPayload::Leave => self.handle_remote_leave(&from).await,
            other => {
                // Offers/answers/candidates can outrun the join they belong
                // to; buffer them until the connection exists.
                if self.peers.contains(&from).await {
                    self.apply_signal(&from, other).await;
                } else {
                    self.peers.buffer_signal(&from, other).await;
                }
            }
        }
    }

    async fn handle_remote_join(self: &Arc<Self>, from: UserId, member: ParticipantSummary) {
        self.registry.upsert_remote(member).await;

        let (entry, pending) = match self.peers.ensure(&from).await {
            Ok(v) => v,
            Err(e) => {
                tracing::error!(remote = %from, error = %e, "Failed to create peer connection");
                self.emit_error(&e);
                return;
            }
        };

        // Glare avoidance: only the lexicographically smaller id offers.
        if self.peers.is_initiator_toward(&from) {
            self.negotiate_offer(&entry).await;
        }

        for signal in pending {
            self.apply_signal(&from, signal).await;
        }

        self.after_participant_mutation().await;
    }

    async fn handle_remote_leave(self: &Arc<Self>, from: &UserId) {
        self.peers.remove(from).await;
        self.effects.dispose_remote(from).await;
        if let Some(p) = self.registry.remove(from).await {
            if let Some(stream) = p.stream {
                stream.stop();
            }
            if let Some(stream) = p.screenshare_stream {
                stream.stop();
            }
            self.after_participant_mutation().await;
        }
    }

    async fn negotiate_offer(&self, entry: &PeerEntry) {
        match entry.link.create_offer().await {
            Ok(description) => {
                self.send_signal(SignalEnvelope::targeted(
                    self.session_id.clone(),
                    self.local_user.clone(),
                    entry.remote.clone(),
                    SignalPayload::Offer { description },
                ))
                .await;
            }
            Err(e) => {
                // Left to reach `failed`; ICE restart is the recovery path.
                tracing::error!(remote = %entry.remote, error = %e, "Offer creation failed");
                self.emit_error(&e);
            }
        }
    }

    async fn apply_signal(&self, from: &UserId, payload: SignalPayload) {
        let Some(entry) = self.peers.get(from).await else {
            tracing::warn!(remote = %from, "Dropping signal for missing connection");
            return;
        };
        match payload {
            SignalPayload::Offer { description } => {
                if self.peers.is_initiator_toward(from) {
                    // The glare rule says this side offers; a counter-offer
                    // from the larger id is a protocol violation.
                    tracing::warn!(remote = %from, "Ignoring offer from non-initiating peer");
                    return;
                }
                match entry.link.create_answer(description).await {
                    Ok(description) => {
                        self.send_signal(SignalEnvelope::targeted(
                            self.session_id.clone(),
                            self.local_user.clone(),
                            from.clone(),
                            SignalPayload::Answer { description },
                        ))
                        .await;
                    }
                    Err(e) => {
                        tracing::error!(remote = %from, error = %e, "Answer creation failed");
                        self.emit_error(&e);
                    }
                }
            }
            SignalPayload::Answer { description } => {
                if let Err(e) = entry.link.apply_answer(description).await {
                    tracing::error!(remote = %from, error = %e, "Answer application failed");
                    self.emit_error(&e);
                }
            }
            SignalPayload::IceCandidate { candidate } => {
                if let Err(e) = entry.link.add_remote_candidate(candidate).await {
                    tracing::warn!(remote = %from, error = %e, "Candidate application failed");
                }
            }
            SignalPayload::Join { .. } | SignalPayload::Leave => {
                // Handled before buffering; never queued.
            }
        }
    }

    async fn send_signal(&self, envelope: SignalEnvelope) {
        let content = match serde_json::to_value(&envelope) {
            Ok(c) => c,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode signal");
                return;
            }
        };
        if let Err(e) = self
            .transport
            .send_event(&self.room_id, GROUP_CALL_SIGNAL_EVENT_TYPE, content)
            .await
        {
            // Not retried: the debounced state sync is the reconciliation
            // path for whatever this send was carrying.
            tracing::warn!(error = %e, "Signal send failed");
            let _ = self.events_tx.send(CallEvent::Error {
                code: "SIGNALING",
                message: format!("signal send failed: {e}"),
            });
        }
    }

    // -- peer events --------------------------------------------------------

    async fn handle_peer_event(self: &Arc<Self>, event: PeerEvent) {
        match event {
            PeerEvent::IceCandidate { remote, candidate } => {
                self.send_signal(SignalEnvelope::targeted(
                    self.session_id.clone(),
                    self.local_user.clone(),
                    remote,
                    SignalPayload::IceCandidate { candidate },
                ))
                .await;
            }
            PeerEvent::StateChange { remote, state } => {
                self.registry.set_connection_state(&remote, state).await;
                if state == PeerConnectionState::Failed {
                    if let Some(entry) = self.peers.get(&remote).await {
                        tracing::info!(remote = %remote, "Connection failed, restarting ICE");
                        if let Err(e) = entry.link.restart_ice().await {
                            tracing::error!(remote = %remote, error = %e, "ICE restart failed");
                        }
                    }
                }
                self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
            }
            PeerEvent::RemoteStream { remote, stream } => {
                let config = self.incoming_effects.read().await.get(&remote).cloned();
                let display = self
                    .effects
                    .process_incoming(&remote, stream, config.as_ref())
                    .await;
                self.registry.set_stream(&remote, Some(display)).await;
                self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
            }
            PeerEvent::RemoteScreenStream { remote, stream } => {
                self.registry.set_screenshare_stream(&remote, Some(stream)).await;
                self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
            }
            PeerEvent::ChannelOpen { remote, kind } => match kind {
                ChannelKind::Control => {
                    let snapshot = ControlMessage::ParticipantsSync {
                        participants: self.registry.summaries().await,
                    };
                    if let Err(e) = self.control.send_to(&remote, snapshot).await {
                        tracing::warn!(remote = %remote, error = %e, "Initial sync push failed");
                    }
                }
                ChannelKind::Caption => {
                    if let Some(entry) = self.peers.get(&remote).await {
                        self.captions.replay_to(&remote, &entry.caption).await;
                    }
                }
            },
            PeerEvent::ChannelMessage { remote, kind, data } => match kind {
                ChannelKind::Control => {
                    let envelope: ControlEnvelope = match serde_json::from_slice(&data) {
                        Ok(e) => e,
                        Err(e) => {
                            tracing::debug!(remote = %remote, error = %e, "Ignoring unknown control message");
                            return;
                        }
                    };
                    if envelope.session_id != self.session_id || envelope.from == self.local_user {
                        return;
                    }
                    self.handle_control(envelope.from, envelope.message).await;
                }
                ChannelKind::Caption => {
                    let message = match serde_json::from_slice(&data) {
                        Ok(m) => m,
                        Err(e) => {
                            tracing::debug!(remote = %remote, error = %e, "Ignoring unknown caption message");
                            return;
                        }
                    };
                    self.captions.handle_channel_message(&remote, message).await;
                }
            },
        }
    }

    // -- control dispatch ---------------------------------------------------

    async fn handle_control(self: &Arc<Self>, from: UserId, message: ControlMessage) {
        match message {
            ControlMessage::CowatchToggle { co_watch } => {
                self.session.write().await.co_watch = co_watch.clone();
                self.registry
                    .update(&from, |p| p.is_co_watching = co_watch.active)
                    .await;
                self.emit(CallEvent::CoWatchChanged(co_watch));
            }
            ControlMessage::ParticipantsSync { participants } => {
                self.merge_participants(participants).await;
            }
            ControlMessage::ScreenshareToggle { user_id, active } => {
                self.registry
                    .update(&user_id, |p| {
                        p.is_screensharing = active;
                        if !active {
                            p.screenshare_stream = None;
                        }
                    })
                    .await;
                self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
            }
            ControlMessage::StageUpdate { stage } => {
                self.adopt_stage(stage).await;
            }
            ControlMessage::HandRaise { user_id } => {
                // Hands are raised for oneself, and only from the audience.
                if user_id != from {
                    tracing::debug!(from = %from, target = %user_id, "Ignoring hand raise for another user");
                    return;
                }
                match self.registry.get(&user_id).await {
                    Some(p) if p.role == ParticipantRole::Listener => {
                        self.registry
                            .set_role(&user_id, ParticipantRole::RequestingSpeak)
                            .await;
                        self.after_participant_mutation().await;
                    }
                    _ => {}
                }
            }
            ControlMessage::HandLower { user_id } => {
                if user_id != from {
                    return;
                }
                if let Some(p) = self.registry.get(&user_id).await {
                    if p.role == ParticipantRole::RequestingSpeak {
                        self.registry.set_role(&user_id, ParticipantRole::Listener).await;
                        self.after_participant_mutation().await;
                    }
                }
            }
            ControlMessage::StageInvite { user_id, role } => {
                if user_id == self.local_user {
                    // Accept the promotion and let everyone see it.
                    self.registry.set_role(&self.local_user, role).await;
                    self.after_participant_mutation().await;
                    self.control
                        .broadcast(ControlMessage::ParticipantsSync {
                            participants: self.registry.summaries().await,
                        })
                        .await;
                } else {
                    self.registry.set_role(&user_id, role).await;
                    self.after_participant_mutation().await;
                }
            }
        }
    }

    /// Merge a wire snapshot into the registry. Local state always wins for
    /// the local entry; unknown remotes are added and will get a connection
    /// when their signals arrive.
    async fn merge_participants(self: &Arc<Self>, participants: Vec<ParticipantSummary>) {
        for summary in participants {
            self.registry.upsert_remote(summary).await;
        }
        self.after_participant_mutation().await;
    }

    /// Adopt a remote stage broadcast by reconciling roles with it, then
    /// re-deriving locally so the registry invariants hold.
    async fn adopt_stage(self: &Arc<Self>, stage: StageState) {
        for user_id in &stage.speakers {
            if let Some(p) = self.registry.get(user_id).await {
                if !p.role.is_speaker() {
                    self.registry.set_role(user_id, ParticipantRole::Participant).await;
                }
            }
        }
        for user_id in &stage.listeners {
            // The queue is carried separately; ids in it stay requesting.
            if stage.queue_position(user_id).is_some() {
                continue;
            }
            if let Some(p) = self.registry.get(user_id).await {
                if p.role.is_speaker() && !p.role.is_privileged() {
                    self.registry.set_role(user_id, ParticipantRole::Listener).await;
                }
            }
        }
        for (idx, user_id) in stage.hand_raise_queue.iter().enumerate() {
            let Some(p) = self.registry.get(user_id).await else {
                continue;
            };
            if p.role != ParticipantRole::RequestingSpeak {
                self.registry.set_role(user_id, ParticipantRole::RequestingSpeak).await;
                // Preserve the sender's queue order for entries we had no
                // raise timestamp for.
                let at = stage.updated_at + chrono::Duration::milliseconds(idx as i64);
                self.registry.update(user_id, |p| p.hand_raised_at = Some(at)).await;
            }
        }
        self.after_participant_mutation().await;
    }

    /// Late-join/reconnect reconciliation from the durable call state.
    async fn replay_call_state(self: &Arc<Self>, content: CallStateContent) {
        {
            let mut session = self.session.write().await;
            session.started_by = content.started_by;
            session.started_at = content.started_at;
            session.url = content.url;
            if session.co_watch != content.co_watch {
                session.co_watch = content.co_watch.clone();
                self.emit(CallEvent::CoWatchChanged(content.co_watch));
            }
        }
        for summary in content.participants {
            self.registry.upsert_remote(summary).await;
        }
        self.adopt_stage(content.stage).await;
    }

    // -- local actions ------------------------------------------------------

    fn ensure_live(&self) -> CallResult<()> {
        if self.is_disposed() {
            Err(CallError::Disposed)
        } else {
            Ok(())
        }
    }

    fn ensure_privileged(&self, local: &Participant) -> CallResult<()> {
        if local.role.is_privileged() {
            Ok(())
        } else {
            Err(CallError::Forbidden {
                message: format!("{} is not a host or moderator", local.user_id),
            })
        }
    }

    /// Toggle the local microphone. The raw and processed audio tracks are
    /// kept in lockstep. Returns the new muted flag.
    pub async fn toggle_mute(self: &Arc<Self>) -> CallResult<bool> {
        self.ensure_live()?;
        let muted = !self.registry.local().await.is_muted;
        self.effects.set_audio_enabled(!muted).await;
        self.registry
            .update(&self.local_user, |p| p.is_muted = muted)
            .await;
        self.control
            .broadcast(ControlMessage::ParticipantsSync {
                participants: self.registry.summaries().await,
            })
            .await;
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        Ok(muted)
    }

    /// Toggle the local camera. Returns the new video-muted flag.
    pub async fn toggle_video_mute(self: &Arc<Self>) -> CallResult<bool> {
        self.ensure_live()?;
        let muted = !self.registry.local().await.is_video_muted;
        self.effects.set_video_enabled(!muted).await;
        self.registry
            .update(&self.local_user, |p| p.is_video_muted = muted)
            .await;
        self.control
            .broadcast(ControlMessage::ParticipantsSync {
                participants: self.registry.summaries().await,
            })
            .await;
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        Ok(muted)
    }

    /// Toggle the local hand. Raising twice is equivalent to lowering.
    /// Returns the new raised flag.
    pub async fn raise_hand(self: &Arc<Self>) -> CallResult<bool> {
        self.ensure_live()?;
        let raised = self.registry.toggle_local_hand().await.ok_or_else(|| {
            CallError::Forbidden {
                message: "speakers have nothing to request".into(),
            }
        })?;
        let message = if raised {
            ControlMessage::HandRaise { user_id: self.local_user.clone() }
        } else {
            ControlMessage::HandLower { user_id: self.local_user.clone() }
        };
        self.control.broadcast(message).await;
        let stage = self.registry.recompute_stage().await;
        self.control
            .broadcast(ControlMessage::StageUpdate { stage: stage.clone() })
            .await;
        self.emit(CallEvent::StageChanged(stage));
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        Ok(raised)
    }

    /// Lower the local hand if raised; a no-op otherwise.
    pub async fn lower_hand(self: &Arc<Self>) -> CallResult<()> {
        self.ensure_live()?;
        if self.registry.local().await.role != ParticipantRole::RequestingSpeak {
            return Ok(());
        }
        self.registry
            .set_role(&self.local_user, ParticipantRole::Listener)
            .await;
        self.control
            .broadcast(ControlMessage::HandLower { user_id: self.local_user.clone() })
            .await;
        let stage = self.registry.recompute_stage().await;
        self.control
            .broadcast(ControlMessage::StageUpdate { stage: stage.clone() })
            .await;
        self.emit(CallEvent::StageChanged(stage));
        Ok(())
    }

    /// Promote a listener or requester onto the stage. Host/moderator only.
    pub async fn bring_to_stage(
        self: &Arc<Self>,
        user_id: &str,
        role: ParticipantRole,
    ) -> CallResult<()> {
        self.ensure_live()?;
        self.ensure_privileged(&self.registry.local().await)?;
        self.registry.promote(user_id, role).await?;
        self.control
            .broadcast(ControlMessage::StageInvite {
                user_id: user_id.to_string(),
                role,
            })
            .await;
        self.broadcast_stage().await;
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        Ok(())
    }

    /// Demote a participant to the audience. Rejected for hosts/moderators.
    pub async fn move_to_audience(self: &Arc<Self>, user_id: &str) -> CallResult<()> {
        self.ensure_live()?;
        self.ensure_privileged(&self.registry.local().await)?;
        self.registry.demote(user_id).await?;
        self.broadcast_stage().await;
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        Ok(())
    }

    async fn broadcast_stage(self: &Arc<Self>) {
        let stage = self.registry.recompute_stage().await;
        self.control
            .broadcast(ControlMessage::StageUpdate { stage: stage.clone() })
            .await;
        self.emit(CallEvent::StageChanged(stage));
    }

    /// Remove a remote participant from the call. Host/moderator only.
    pub async fn kick(self: &Arc<Self>, user_id: &str) -> CallResult<()> {
        self.ensure_live()?;
        self.ensure_privileged(&self.registry.local().await)?;
        if user_id == self.local_user {
            return Err(CallError::Validation {
                message: "cannot kick yourself; use leave()".into(),
            });
        }
        let removed = self
            .registry
            .remove(user_id)
            .await
            .ok_or_else(|| CallError::UnknownParticipant { user_id: user_id.into() })?;
        self.peers.remove(user_id).await;
        self.effects.dispose_remote(user_id).await;
        if let Some(stream) = removed.stream {
            stream.stop();
        }
        if let Some(stream) = removed.screenshare_stream {
            stream.stop();
        }
        tracing::info!(user = %user_id, "Participant kicked");
        self.control
            .broadcast(ControlMessage::ParticipantsSync {
                participants: self.registry.summaries().await,
            })
            .await;
        self.after_participant_mutation().await;
        Ok(())
    }

    // -- screen share -------------------------------------------------------

    pub async fn start_screenshare(self: &Arc<Self>) -> CallResult<()> {
        self.ensure_live()?;
        let stream = self.screenshare.start().await?;
        self.registry
            .update(&self.local_user, |p| {
                p.is_screensharing = true;
                p.screenshare_stream = Some(stream.clone());
            })
            .await;

        // Route the platform's native "stop sharing" into the same teardown
        // as a manual toggle.
        if let Some(track) = stream.video_track().cloned() {
            let weak = Arc::downgrade(self);
            let watcher = tokio::spawn(async move {
                track.ended().await;
                if let Some(c) = weak.upgrade() {
                    c.finish_screenshare().await;
                }
            });
            if let Some(old) = self.screen_watch.lock().await.replace(watcher) {
                old.abort();
            }
        }

        self.control
            .broadcast(ControlMessage::ScreenshareToggle {
                user_id: self.local_user.clone(),
                active: true,
            })
            .await;
        self.emit(CallEvent::ScreenshareChanged(true));
        Ok(())
    }

    pub async fn stop_screenshare(self: &Arc<Self>) -> CallResult<()> {
        self.ensure_live()?;
        if let Some(watcher) = self.screen_watch.lock().await.take() {
            watcher.abort();
        }
        self.finish_screenshare().await;
        Ok(())
    }

    pub async fn toggle_screenshare(self: &Arc<Self>) -> CallResult<bool> {
        if self.screenshare.is_active().await {
            self.stop_screenshare().await?;
            Ok(false)
        } else {
            self.start_screenshare().await?;
            Ok(true)
        }
    }

    /// Shared tail of the manual and native stop paths. Idempotent.
    async fn finish_screenshare(self: &Arc<Self>) {
        if !self.screenshare.stop().await {
            return;
        }
        self.registry
            .update(&self.local_user, |p| {
                p.is_screensharing = false;
                p.screenshare_stream = None;
            })
            .await;
        self.control
            .broadcast(ControlMessage::ScreenshareToggle {
                user_id: self.local_user.clone(),
                active: false,
            })
            .await;
        self.emit(CallEvent::ScreenshareChanged(false));
    }

    // -- co-watch -----------------------------------------------------------

    pub async fn start_co_watch(self: &Arc<Self>, url: &str) -> CallResult<()> {
        self.ensure_live()?;
        let parsed = url::Url::parse(url).map_err(|e| CallError::Validation {
            message: format!("invalid co-watch url: {e}"),
        })?;
        let co_watch = CoWatchState {
            active: true,
            url: Some(parsed.to_string()),
            started_by: Some(self.local_user.clone()),
            started_at: Some(Utc::now()),
        };
        self.apply_local_co_watch(co_watch).await;
        Ok(())
    }

    pub async fn stop_co_watch(self: &Arc<Self>) -> CallResult<()> {
        self.ensure_live()?;
        self.apply_local_co_watch(CoWatchState::default()).await;
        Ok(())
    }

    async fn apply_local_co_watch(self: &Arc<Self>, co_watch: CoWatchState) {
        self.session.write().await.co_watch = co_watch.clone();
        self.registry
            .update(&self.local_user, |p| p.is_co_watching = co_watch.active)
            .await;
        self.control
            .broadcast(ControlMessage::CowatchToggle { co_watch: co_watch.clone() })
            .await;
        // Peers with no open channel yet still learn about it promptly.
        self.control
            .send_room_fallback(ControlMessage::CowatchToggle { co_watch: co_watch.clone() })
            .await;
        self.emit(CallEvent::CoWatchChanged(co_watch));
    }

    // -- captions -----------------------------------------------------------

    /// Publish a locally transcribed caption to peers and the sinks.
    pub async fn send_caption(
        self: &Arc<Self>,
        text: &str,
        language: Option<&str>,
        final_: bool,
    ) -> CallResult<CaptionEvent> {
        self.ensure_live()?;
        let mut event = CaptionEvent::new(self.session_id.clone(), self.local_user.clone(), text);
        event.language = language.map(str::to_string);
        event.final_ = final_;
        self.captions.publish_local(event.clone()).await;
        Ok(event)
    }

    /// Attach a translation to an already-published caption.
    pub async fn send_caption_translation(
        self: &Arc<Self>,
        translation: CaptionTranslation,
    ) -> CallResult<()> {
        self.ensure_live()?;
        self.captions.publish_translation(translation).await;
        Ok(())
    }

    pub async fn caption_history(&self) -> Vec<CaptionEvent> {
        self.captions.history().await
    }

    // -- effects ------------------------------------------------------------

    /// Swap the local effects configuration; `None` returns to the raw
    /// capture. Senders are retargeted without renegotiation.
    pub async fn set_effects_config(self: &Arc<Self>, config: Option<EffectsConfig>) -> CallResult<()> {
        self.ensure_live()?;
        self.effects.set_local_config(config).await?;
        let outgoing = self.effects.outgoing_stream().await;
        self.registry.set_stream(&self.local_user, outgoing).await;
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        Ok(())
    }

    /// Configure effects for one remote's incoming stream, applied when
    /// their next stream arrives.
    pub async fn set_incoming_effects(
        self: &Arc<Self>,
        user_id: &str,
        config: Option<EffectsConfig>,
    ) -> CallResult<()> {
        self.ensure_live()?;
        let mut map = self.incoming_effects.write().await;
        match config {
            Some(cfg) => {
                map.insert(user_id.to_string(), cfg);
            }
            None => {
                map.remove(user_id);
                drop(map);
                self.effects.dispose_remote(user_id).await;
            }
        }
        Ok(())
    }

    // -- shared mutation tail ----------------------------------------------

    /// Every registry mutation ends here: recompute the stage, surface the
    /// change, and schedule the debounced durable sync.
    async fn after_participant_mutation(self: &Arc<Self>) {
        let before = self.registry.stage().await;
        let stage = self.registry.recompute_stage().await;
        self.emit(CallEvent::ParticipantsChanged(self.registry.all().await));
        if stage.speakers != before.speakers
            || stage.listeners != before.listeners
            || stage.hand_raise_queue != before.hand_raise_queue
        {
            self.emit(CallEvent::StageChanged(stage));
        }
        self.control.schedule_sync().await;
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events_tx.send(event);
    }

    fn emit_error(&self, error: &CallError) {
        let _ = self.events_tx.send(CallEvent::Error {
            code: error.code(),
            message: error.to_string(),
        });
    }

    // -- teardown -----------------------------------------------------------

    /// Tear the call down. Idempotent: the first call wins, re-entry is a
    /// no-op. Teardown order matters — the transport listener dies first so
    /// no further signals are processed, then departure is announced, then
    /// connections, media, effects, and maps are released.
    pub async fn leave(self: &Arc<Self>) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(session = %self.session_id, "Leaving call");

        if let Some(handle) = self.event_loop.lock().await.take() {
            handle.abort();
        }
        if let Some(handle) = self.screen_watch.lock().await.take() {
            handle.abort();
        }
        self.control.cancel().await;

        self.send_signal(SignalEnvelope::broadcast(
            self.session_id.clone(),
            self.local_user.clone(),
            SignalPayload::Leave,
        ))
        .await;

        self.peers.close_all().await;
        self.screenshare.stop().await;

        for participant in self.registry.all().await {
            if let Some(stream) = participant.stream {
                stream.stop();
            }
            if let Some(stream) = participant.screenshare_stream {
                stream.stop();
            }
        }
        self.effects.dispose_all().await;
        self.registry.clear().await;
        self.captions.clear().await;
        self.incoming_effects.write().await.clear();

        self.emit(CallEvent::Disposed);
        tracing::info!(session = %self.session_id, "Call disposed");
    }
}
